pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod fetch;
pub mod install;
pub mod jobs;
pub mod logging;
pub mod orchestrator;
pub mod paths;
pub mod probe;
pub mod process;
pub mod store;
pub mod updater;

pub use config::{AudioFormat, DownloadType, LogLevel, Settings, VideoResolution};
pub use controller::{AppController, Command, ControllerHandle};
pub use error::{
    ConfigError, ControllerError, InstallError, MultiytError, ProbeError, ProcessError,
};
pub use events::{Event, EventBus, JobUpdate};
pub use fetch::{FetchPhase, FetchProgress, HttpFetcher, ProgressSink};
pub use install::{DependencyInstaller, DependencyKind};
pub use jobs::{DownloadKind, Job, JobOptions, JobStatus};
pub use logging::{LogManager, LogManagerBuilder};
pub use orchestrator::{JobSpec, Orchestrator};
pub use store::{JobStore, StoreDelta};

pub type Result<T> = std::result::Result<T, MultiytError>;
