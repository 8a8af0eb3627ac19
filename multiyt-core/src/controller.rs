use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{self, DownloadType, Settings};
use crate::error::ControllerError;
use crate::events::{Event, EventBus};
use crate::fetch::ProgressSink;
use crate::install::{self, DependencyInstaller, DependencyKind};
use crate::jobs::{DownloadKind, Job, JobOptions, JobStatus};
use crate::orchestrator::{JobSpec, Orchestrator};
use crate::paths;
use crate::store::JobStore;
use crate::updater;

const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Builds the immutable per-job options snapshot from current settings.
pub fn job_options_from_settings(settings: &Settings, output_dir: PathBuf) -> JobOptions {
    let kind = match settings.download_type {
        DownloadType::Video => DownloadKind::Video {
            resolution: settings.video_resolution,
        },
        DownloadType::Audio => DownloadKind::Audio {
            format: settings.audio_format,
        },
    };
    JobOptions {
        output_dir,
        filename_template: settings.filename_template.clone(),
        kind,
        embed_thumbnail: settings.embed_thumbnail,
        embed_metadata: settings.embed_metadata,
    }
}

pub enum Command {
    StartDownloads {
        urls: Vec<String>,
        options: JobOptions,
        reply: oneshot::Sender<Result<(), ControllerError>>,
    },
    StopDownloads,
    RetryJobs(Vec<Uuid>),
    ClearCompleted,
    InstallDependency(DependencyKind),
    CancelInstall,
    DependencyVersions,
    SaveSettings {
        settings: Settings,
        reply: oneshot::Sender<Result<(), ControllerError>>,
    },
    SkipUpdateVersion(String),
    CheckForUpdates,
    Snapshot {
        reply: oneshot::Sender<Vec<Job>>,
    },
    Progress {
        reply: oneshot::Sender<(u64, u64)>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cheap cloneable front door to the controller task.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<Command>,
}

impl ControllerHandle {
    pub async fn start_downloads(
        &self,
        urls: Vec<String>,
        options: JobOptions,
    ) -> Result<(), ControllerError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(Command::StartDownloads {
                urls,
                options,
                reply,
            })
            .await
            .map_err(|_| ControllerError::Closed)?;
        response.await.map_err(|_| ControllerError::Closed)?
    }

    pub async fn stop_downloads(&self) {
        self.tx.send(Command::StopDownloads).await.ok();
    }

    pub async fn retry_jobs(&self, ids: Vec<Uuid>) {
        self.tx.send(Command::RetryJobs(ids)).await.ok();
    }

    pub async fn clear_completed(&self) {
        self.tx.send(Command::ClearCompleted).await.ok();
    }

    pub async fn install_dependency(&self, kind: DependencyKind) {
        self.tx.send(Command::InstallDependency(kind)).await.ok();
    }

    pub async fn cancel_install(&self) {
        self.tx.send(Command::CancelInstall).await.ok();
    }

    pub async fn dependency_versions(&self) {
        self.tx.send(Command::DependencyVersions).await.ok();
    }

    pub async fn save_settings(&self, settings: Settings) -> Result<(), ControllerError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(Command::SaveSettings { settings, reply })
            .await
            .map_err(|_| ControllerError::Closed)?;
        response.await.map_err(|_| ControllerError::Closed)?
    }

    pub async fn skip_update_version(&self, version: String) {
        self.tx.send(Command::SkipUpdateVersion(version)).await.ok();
    }

    pub async fn check_for_updates(&self) {
        self.tx.send(Command::CheckForUpdates).await.ok();
    }

    pub async fn snapshot(&self) -> Vec<Job> {
        let (reply, response) = oneshot::channel();
        if self.tx.send(Command::Snapshot { reply }).await.is_err() {
            return Vec::new();
        }
        response.await.unwrap_or_default()
    }

    pub async fn progress(&self) -> (u64, u64) {
        let (reply, response) = oneshot::channel();
        if self.tx.send(Command::Progress { reply }).await.is_err() {
            return (0, 0);
        }
        response.await.unwrap_or((0, 0))
    }

    /// Drives the stop protocol (if needed), persists settings, and ends the
    /// controller task.
    pub async fn shutdown(&self) {
        let (reply, response) = oneshot::channel();
        if self.tx.send(Command::Shutdown { reply }).await.is_ok() {
            response.await.ok();
        }
    }
}

/// The central coordinator: owns the job store and settings, gates download
/// requests, and consolidates background events into the UI sink.
pub struct AppController {
    settings: Settings,
    config_path: PathBuf,
    store: JobStore,
    orchestrator: Orchestrator,
    installer: Arc<DependencyInstaller>,
    bus: EventBus,
    events_rx: mpsc::Receiver<Event>,
    commands_rx: mpsc::Receiver<Command>,
    ui: mpsc::Sender<Event>,
    yt_dlp_path: Option<PathBuf>,
    ffmpeg_path: Option<PathBuf>,
    pending_download_task: Option<(Vec<String>, JobOptions)>,
    downloading: bool,
}

impl AppController {
    pub fn new(
        settings: Settings,
        config_path: PathBuf,
        ui: mpsc::Sender<Event>,
    ) -> crate::Result<(AppController, ControllerHandle)> {
        Self::with_dirs(
            settings,
            config_path,
            paths::app_dir(),
            paths::temp_download_dir(),
            ui,
        )
    }

    pub fn with_dirs(
        settings: Settings,
        config_path: PathBuf,
        app_dir: PathBuf,
        temp_dir: PathBuf,
        ui: mpsc::Sender<Event>,
    ) -> crate::Result<(AppController, ControllerHandle)> {
        let (bus, events_rx) = EventBus::channel();
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let installer = Arc::new(DependencyInstaller::new(app_dir)?);
        let yt_dlp_path = installer.find(DependencyKind::YtDlp);
        let ffmpeg_path = installer.find(DependencyKind::Ffmpeg);
        let orchestrator = Orchestrator::new(bus.clone(), temp_dir);

        let controller = AppController {
            settings,
            config_path,
            store: JobStore::default(),
            orchestrator,
            installer,
            bus,
            events_rx,
            commands_rx,
            ui,
            yt_dlp_path,
            ffmpeg_path,
            pending_download_task: None,
            downloading: false,
        };
        Ok((controller, ControllerHandle { tx: commands_tx }))
    }

    /// Runs until `Shutdown` arrives or every handle is dropped.
    pub async fn run(mut self) {
        if self.settings.check_for_updates_on_startup {
            let bus = self.bus.clone();
            let skipped = self.settings.skipped_update_version.clone();
            tokio::spawn(async move {
                updater::check_for_updates(&skipped, &bus).await;
            });
        }
        if self.yt_dlp_path.is_none() {
            self.forward(Event::DependencyPrompt(DependencyKind::YtDlp))
                .await;
        }

        loop {
            tokio::select! {
                event = self.events_rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                command = self.commands_rx.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        reply.send(()).ok();
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartDownloads {
                urls,
                options,
                reply,
            } => {
                let result = self.start_downloads(urls, options).await;
                reply.send(result).ok();
            }
            Command::StopDownloads => self.stop_downloads().await,
            Command::RetryJobs(ids) => self.retry_jobs(ids).await,
            Command::ClearCompleted => self.clear_completed().await,
            Command::InstallDependency(kind) => self.install_dependency(kind),
            Command::CancelInstall => self.installer.cancel(),
            Command::DependencyVersions => self.dependency_versions(),
            Command::SaveSettings { settings, reply } => {
                reply.send(self.save_settings(settings)).ok();
            }
            Command::SkipUpdateVersion(version) => {
                self.settings.skipped_update_version = version;
                if let Err(save_error) = self.settings.save(&self.config_path) {
                    error!("error saving config: {save_error}");
                }
            }
            Command::CheckForUpdates => {
                let bus = self.bus.clone();
                let skipped = self.settings.skipped_update_version.clone();
                tokio::spawn(async move {
                    updater::check_for_updates(&skipped, &bus).await;
                });
            }
            Command::Snapshot { reply } => {
                reply.send(self.store.snapshot()).ok();
            }
            Command::Progress { reply } => {
                reply.send(self.orchestrator.stats()).ok();
            }
            Command::Shutdown { .. } => unreachable!("handled by the run loop"),
        }
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::AddJob(job) => {
                let delta = self.store.insert(job.clone());
                self.forward(Event::AddJob(job)).await;
                self.forward(Event::StoreChanged(delta)).await;
            }
            Event::UpdateJob { id, update } => {
                if let Some(delta) = self.store.apply(id, &update) {
                    self.forward(Event::UpdateJob { id, update }).await;
                    self.forward(Event::StoreChanged(delta)).await;
                }
            }
            Event::Done { id, status } => {
                let delta = self.store.finish(id, status.clone());
                self.forward(Event::Done { id, status }).await;
                if let Some(delta) = delta {
                    self.forward(Event::StoreChanged(delta)).await;
                }
                self.check_batch_complete();
            }
            Event::DependencyDone {
                kind,
                success,
                detail,
            } => self.handle_dependency_done(kind, success, detail).await,
            other => self.forward(other).await,
        }
    }

    /// Preconditions, in order: not already downloading, yt-dlp known, sane
    /// template, writable output directory, ffmpeg present when the options
    /// need it (otherwise the request parks as a pending task).
    async fn start_downloads(
        &mut self,
        urls: Vec<String>,
        options: JobOptions,
    ) -> Result<(), ControllerError> {
        if self.downloading {
            return Err(ControllerError::Busy);
        }
        if urls.is_empty() {
            return Err(ControllerError::Validation {
                field: "urls",
                message: "no URLs supplied".to_string(),
            });
        }
        let Some(yt_dlp) = self.yt_dlp_path.clone() else {
            self.forward(Event::DependencyPrompt(DependencyKind::YtDlp))
                .await;
            return Err(ControllerError::MissingAcquisitionTool);
        };
        config::validate_filename_template(&options.filename_template).map_err(|message| {
            ControllerError::Validation {
                field: "filename_template",
                message,
            }
        })?;
        probe_writable(&options.output_dir)
            .map_err(|message| ControllerError::Permission { message })?;

        if options.requires_ffmpeg() && self.ffmpeg_path.is_none() {
            info!("ffmpeg is required for the selected options; prompting for install");
            self.pending_download_task = Some((urls, options));
            self.downloading = true;
            self.forward(Event::DependencyPrompt(DependencyKind::Ffmpeg))
                .await;
            return Ok(());
        }

        info!("queuing {} URL(s)", urls.len());
        self.downloading = true;
        self.orchestrator.configure(
            yt_dlp,
            self.ffmpeg_path.clone(),
            self.settings.max_concurrent_downloads,
        );
        self.orchestrator.enqueue(urls, options).await;
        Ok(())
    }

    async fn stop_downloads(&mut self) {
        if !self.downloading {
            return;
        }
        // the stop protocol emits into the bus this task drains, so it runs
        // detached; its Done events flow back through the normal loop
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            orchestrator.stop().await;
        });
        self.pending_download_task = None;
        self.downloading = false;
    }

    /// Failed jobs are removed and rebuilt from their captured options under
    /// fresh ids.
    async fn retry_jobs(&mut self, ids: Vec<Uuid>) {
        let mut failed_ids = Vec::new();
        let mut specs = Vec::new();
        for id in ids {
            if let Some(job) = self.store.get(id) {
                if job.status.is_failure() {
                    failed_ids.push(id);
                    specs.push(JobSpec {
                        url: job.original_url.clone(),
                        playlist_index: job.playlist_index,
                        options: job.options.clone(),
                    });
                }
            }
        }
        if specs.is_empty() {
            warn!("could not find job data for the selected failed items");
            return;
        }

        let delta = self.store.remove_many(&failed_ids);
        self.forward(Event::StoreChanged(delta)).await;

        if let Some(yt_dlp) = self.yt_dlp_path.clone() {
            self.orchestrator.configure(
                yt_dlp,
                self.ffmpeg_path.clone(),
                self.settings.max_concurrent_downloads,
            );
        }
        self.downloading = true;
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            orchestrator.add_jobs_for_retry(specs).await;
        });
    }

    async fn clear_completed(&mut self) {
        let ids = self.store.ids_where(|job| job.status.is_terminal());
        let delta = self.store.remove_many(&ids);
        info!("cleared {} finished item(s) from the list", delta.removed.len());
        self.forward(Event::StoreChanged(delta)).await;
    }

    fn install_dependency(&self, kind: DependencyKind) {
        let installer = self.installer.clone();
        let bus = self.bus.clone();
        tokio::spawn(async move {
            let sink: ProgressSink = {
                let bus = bus.clone();
                Arc::new(move |progress| {
                    bus.emit_lossy(Event::DependencyProgress { kind, progress });
                })
            };
            let result = match kind {
                DependencyKind::YtDlp => installer.install_yt_dlp(&sink).await,
                DependencyKind::Ffmpeg => installer.install_ffmpeg(&sink).await,
            };
            let event = match result {
                Ok(path) => Event::DependencyDone {
                    kind,
                    success: true,
                    detail: path.display().to_string(),
                },
                Err(install_error) => {
                    if install_error.is_cancelled() {
                        info!("{kind} download cancelled by user");
                    } else {
                        error!("{kind} install failed: {install_error}");
                    }
                    Event::DependencyDone {
                        kind,
                        success: false,
                        detail: install_error.to_string(),
                    }
                }
            };
            bus.emit(event).await;
        });
    }

    /// Version checks run detached so startup stays responsive; results come
    /// back as events.
    fn dependency_versions(&self) {
        let probes = [
            (DependencyKind::YtDlp, self.yt_dlp_path.clone()),
            (DependencyKind::Ffmpeg, self.ffmpeg_path.clone()),
        ];
        for (kind, path) in probes {
            let bus = self.bus.clone();
            tokio::spawn(async move {
                let version = install::probe_version(kind, path.as_deref()).await;
                bus.emit(Event::DependencyVersion { kind, version }).await;
            });
        }
    }

    async fn handle_dependency_done(
        &mut self,
        kind: DependencyKind,
        success: bool,
        detail: String,
    ) {
        match kind {
            DependencyKind::YtDlp => {
                self.yt_dlp_path = self.installer.find(kind);
                if self.yt_dlp_path.is_none() {
                    self.forward(Event::CriticalError(
                        "yt-dlp is required. The application cannot continue without it."
                            .to_string(),
                    ))
                    .await;
                }
            }
            DependencyKind::Ffmpeg => {
                self.ffmpeg_path = self.installer.find(kind);
                if success {
                    if let Some((urls, options)) = self.pending_download_task.take() {
                        info!("ffmpeg installed; resuming queued downloads");
                        self.downloading = false;
                        if let Err(start_error) = self.start_downloads(urls, options).await {
                            warn!("pending downloads could not start: {start_error}");
                        }
                    }
                } else if self.pending_download_task.take().is_some() {
                    warn!("ffmpeg download failed; aborting pending downloads");
                    self.downloading = false;
                }
            }
        }
        self.forward(Event::DependencyDone {
            kind,
            success,
            detail,
        })
        .await;
    }

    fn save_settings(&mut self, settings: Settings) -> Result<(), ControllerError> {
        validate_settings(&settings)?;
        settings
            .save(&self.config_path)
            .map_err(|save_error| ControllerError::Persist(save_error.to_string()))?;
        self.settings = settings;
        if let Some(yt_dlp) = self.yt_dlp_path.clone() {
            self.orchestrator.configure(
                yt_dlp,
                self.ffmpeg_path.clone(),
                self.settings.max_concurrent_downloads,
            );
        }
        Ok(())
    }

    async fn shutdown(&mut self) {
        info!("application closing");
        if self.downloading || self.store.has_non_terminal() {
            // keep draining events while the stop protocol runs, otherwise a
            // full bus would wedge it
            let orchestrator = self.orchestrator.clone();
            let (stopped_tx, mut stopped_rx) = oneshot::channel();
            tokio::spawn(async move {
                orchestrator.stop().await;
                stopped_tx.send(()).ok();
            });
            loop {
                tokio::select! {
                    _ = &mut stopped_rx => break,
                    event = self.events_rx.recv() => match event {
                        Some(event) => self.handle_event(event).await,
                        None => break,
                    },
                }
            }
            // apply whatever the stop protocol emitted last
            while let Ok(event) = self.events_rx.try_recv() {
                self.handle_event(event).await;
            }
            // supervisory sweep for jobs whose done event never arrived
            for id in self.store.ids_where(|job| !job.status.is_terminal()) {
                if self.store.finish(id, JobStatus::Cancelled).is_some() {
                    self.forward(Event::Done {
                        id,
                        status: JobStatus::Cancelled,
                    })
                    .await;
                }
            }
            self.downloading = false;
        }
        if let Err(save_error) = self.settings.save(&self.config_path) {
            error!("error saving config: {save_error}");
        }
    }

    fn check_batch_complete(&mut self) {
        let (completed, total) = self.orchestrator.stats();
        if self.downloading && total > 0 && completed >= total {
            info!("all queued downloads are complete");
            self.downloading = false;
        }
    }

    async fn forward(&self, event: Event) {
        if self.ui.send(event).await.is_err() {
            debug!("ui sink closed; dropping event");
        }
    }
}

fn validate_settings(settings: &Settings) -> Result<(), ControllerError> {
    config::validate_filename_template(&settings.filename_template).map_err(|message| {
        ControllerError::Validation {
            field: "filename_template",
            message,
        }
    })?;
    let (lo, hi) = config::MAX_CONCURRENT_RANGE;
    if !(lo..=hi).contains(&settings.max_concurrent_downloads) {
        return Err(ControllerError::Validation {
            field: "max_concurrent_downloads",
            message: format!("must be between {lo} and {hi}"),
        });
    }
    Ok(())
}

/// Creates and deletes a zero-length probe file to prove the directory is
/// writable before any job starts.
fn probe_writable(dir: &Path) -> Result<(), String> {
    let probe = dir.join(format!(".writetest_{}", std::process::id()));
    std::fs::write(&probe, b"").map_err(|probe_error| probe_error.to_string())?;
    std::fs::remove_file(&probe).map_err(|probe_error| probe_error.to_string())?;
    Ok(())
}
