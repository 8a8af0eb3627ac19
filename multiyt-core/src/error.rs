use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to write config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize config: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("process did not finish within {0:?}")]
    Timeout(Duration),
    #[error("io error: {source}")]
    Io {
        #[source]
        source: std::io::Error,
    },
}

/// Failure of URL expansion, always carrying a single user-presentable
/// sentence extracted from the acquisition tool's diagnostics.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("{0}")]
    Extraction(String),
}

impl ProbeError {
    pub fn reason(&self) -> &str {
        match self {
            ProbeError::Extraction(reason) => reason,
        }
    }
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("network error: {reason}")]
    Network { reason: String },
    #[error("file error: {reason}")]
    File { reason: String },
    #[error("archive error: {reason}")]
    Archive { reason: String },
    #[error("download cancelled by user")]
    Cancelled,
    #[error("unexpected error: {reason}")]
    Unexpected { reason: String },
}

impl InstallError {
    pub fn network(source: impl std::fmt::Display) -> Self {
        InstallError::Network {
            reason: source.to_string(),
        }
    }

    pub fn file(path: &std::path::Path, source: impl std::fmt::Display) -> Self {
        InstallError::File {
            reason: format!("{}: {source}", path.display()),
        }
    }

    pub fn archive(source: impl std::fmt::Display) -> Self {
        InstallError::Archive {
            reason: source.to_string(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, InstallError::Cancelled)
    }
}

/// Rejections raised before any work starts. Surfaced synchronously to
/// whoever submitted the request, naming the offending field where one
/// exists.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("invalid value for '{field}': {message}")]
    Validation {
        field: &'static str,
        message: String,
    },
    #[error("cannot write to the output directory: {message}")]
    Permission { message: String },
    #[error("yt-dlp is not available")]
    MissingAcquisitionTool,
    #[error("a download batch is already running")]
    Busy,
    #[error("could not persist settings: {0}")]
    Persist(String),
    #[error("the controller has shut down")]
    Closed,
}

#[derive(Debug, Error)]
pub enum MultiytError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Install(#[from] InstallError),
    #[error(transparent)]
    Controller(#[from] ControllerError),
}
