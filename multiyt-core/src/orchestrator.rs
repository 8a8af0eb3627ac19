use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use tokio::sync::{watch, Notify};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{AudioFormat, MAX_CONCURRENT_RANGE};
use crate::error::ProcessError;
use crate::events::{Event, EventBus, JobUpdate};
use crate::jobs::{DownloadKind, Job, JobOptions, JobStatus};
use crate::probe::UrlProbe;
use crate::process::{self, group_command, StreamingChild};

const MAX_URL_PROCESSORS: usize = 8;
const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(10);
const TEMP_SUFFIXES: &[&str] = &[".part", ".ytdl", ".webm"];

static DESTINATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[download\]\s+Destination:\s+(?P<path>.+)").expect("valid regex"));
static STAGE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[(\w+)\]").expect("valid regex"));
static DOWNLOAD_PERCENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+\.?\d*)%").expect("valid regex"));

/// Everything needed to (re)build a job: retry re-enqueues one of these with
/// a fresh id.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub url: String,
    pub playlist_index: Option<u32>,
    pub options: Arc<JobOptions>,
}

struct QueuedJob {
    id: Uuid,
    spec: JobSpec,
}

struct UrlTask {
    url: String,
    options: Arc<JobOptions>,
}

#[derive(Clone)]
struct RunnerConfig {
    yt_dlp: PathBuf,
    ffmpeg: Option<PathBuf>,
    max_concurrent: usize,
}

struct ActiveProcess {
    pid: u32,
    exited: watch::Receiver<bool>,
}

/// FIFO queue shared by a pool of consumers.
struct WorkQueue<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
}

impl<T> WorkQueue<T> {
    fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    fn push(&self, item: T) {
        self.items.lock().push_back(item);
        self.notify.notify_one();
    }

    fn try_pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    fn drain(&self) -> Vec<T> {
        self.items.lock().drain(..).collect()
    }

    fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Waits for the next item. Returns `None` once cancelled, or once
    /// `idle_stop` reads true while the queue is empty.
    async fn pop(
        &self,
        cancel: &CancellationToken,
        idle_stop: &mut watch::Receiver<bool>,
    ) -> Option<T> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            if let Some(item) = self.try_pop() {
                // wake a sibling for the items still queued
                if !self.is_empty() {
                    self.notify.notify_one();
                }
                return Some(item);
            }
            if *idle_stop.borrow() {
                return None;
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = self.notify.notified() => {}
                changed = idle_stop.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }
}

/// Expands user URLs into jobs, runs them on a bounded worker pool, and owns
/// the stop protocol. Clones share one instance.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    events: EventBus,
    temp_dir: PathBuf,
    config: Mutex<Option<RunnerConfig>>,
    url_queue: WorkQueue<UrlTask>,
    job_queue: WorkQueue<QueuedJob>,
    /// (completed, total), under its own lock.
    stats: Mutex<(u64, u64)>,
    active: Mutex<HashMap<Uuid, ActiveProcess>>,
    cancel: Mutex<CancellationToken>,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    urls_done: watch::Sender<bool>,
}

impl Orchestrator {
    pub fn new(events: EventBus, temp_dir: PathBuf) -> Self {
        let (urls_done, _) = watch::channel(true);
        Self {
            inner: Arc::new(Inner {
                events,
                temp_dir,
                config: Mutex::new(None),
                url_queue: WorkQueue::new(),
                job_queue: WorkQueue::new(),
                stats: Mutex::new((0, 0)),
                active: Mutex::new(HashMap::new()),
                cancel: Mutex::new(CancellationToken::new()),
                workers: Mutex::new(Vec::new()),
                urls_done,
            }),
        }
    }

    pub fn configure(&self, yt_dlp: PathBuf, ffmpeg: Option<PathBuf>, max_concurrent: u32) {
        let (lo, hi) = MAX_CONCURRENT_RANGE;
        *self.inner.config.lock() = Some(RunnerConfig {
            yt_dlp,
            ffmpeg,
            max_concurrent: max_concurrent.clamp(lo, hi) as usize,
        });
    }

    pub fn stats(&self) -> (u64, u64) {
        *self.inner.stats.lock()
    }

    /// Live workers, pruning finished handles.
    pub fn worker_count(&self) -> usize {
        let mut workers = self.inner.workers.lock();
        workers.retain(|handle| !handle.is_finished());
        workers.len()
    }

    /// Expands each URL into jobs and feeds the worker pool. `total` grows as
    /// expansion yields items; `UrlProcessingDone` fires exactly once after
    /// every submitted URL has been expanded.
    pub async fn enqueue(&self, urls: Vec<String>, options: JobOptions) {
        let Some(config) = self.inner.config.lock().clone() else {
            error!("yt-dlp path is not set; cannot start downloads");
            return;
        };

        *self.inner.stats.lock() = (0, 0);
        let cancel = self.fresh_cancel_scope();
        self.inner.urls_done.send_replace(false);
        self.start_workers(&config, &cancel);

        let options = Arc::new(options);
        let url_count = urls.len();
        for url in urls {
            self.inner.url_queue.push(UrlTask {
                url,
                options: options.clone(),
            });
        }

        let processors = MAX_URL_PROCESSORS.min(url_count);
        let mut handles = Vec::with_capacity(processors);
        for index in 0..processors {
            let inner = self.inner.clone();
            let probe = UrlProbe::new(config.yt_dlp.clone());
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                url_processor(inner, probe, cancel, index + 1).await;
            }));
        }

        // completion waiter: emits UrlProcessingDone once, after the URL
        // queue has drained and every processor has exited
        let inner = self.inner.clone();
        tokio::spawn(async move {
            for handle in handles {
                handle.await.ok();
            }
            inner.urls_done.send_replace(true);
            if !cancel.is_cancelled() {
                inner.events.emit(Event::UrlProcessingDone).await;
            }
        });
    }

    /// Re-enqueues jobs rebuilt from the captured options of failed ones.
    pub async fn add_jobs_for_retry(&self, specs: Vec<JobSpec>) {
        let Some(config) = self.inner.config.lock().clone() else {
            error!("yt-dlp path is not set; cannot add jobs");
            return;
        };
        info!("retrying {} failed download(s)", specs.len());
        let cancel = self.fresh_cancel_scope();
        {
            let mut stats = self.inner.stats.lock();
            stats.1 += specs.len() as u64;
        }
        for spec in specs {
            if cancel.is_cancelled() {
                break;
            }
            let job = Job::new(spec.url.clone(), spec.playlist_index, spec.options.clone());
            let id = job.id;
            self.inner.events.emit(Event::AddJob(job)).await;
            self.inner.job_queue.push(QueuedJob { id, spec });
        }
        self.start_workers(&config, &cancel);
    }

    /// The stop protocol: cancel everything, drain the queues, terminate
    /// every active process group (gracefully, then by force), clean the
    /// temp directory, zero the statistics.
    pub async fn stop(&self) {
        info!("stop signal received; terminating downloads");
        self.inner.cancel.lock().cancel();

        self.inner.url_queue.drain();
        for job in self.inner.job_queue.drain() {
            self.inner
                .events
                .emit(Event::Done {
                    id: job.id,
                    status: JobStatus::Cancelled,
                })
                .await;
        }

        let entries: Vec<(Uuid, u32, watch::Receiver<bool>)> = {
            self.inner
                .active
                .lock()
                .iter()
                .map(|(id, process)| (*id, process.pid, process.exited.clone()))
                .collect()
        };
        for (id, pid, mut exited) in entries {
            info!("requesting graceful shutdown for {id} (pid {pid})");
            if let Err(signal_error) = process::interrupt_group(pid) {
                warn!("graceful interrupt for {id} failed: {signal_error}");
            }
            let graceful_ok = matches!(
                timeout(GRACEFUL_STOP_TIMEOUT, exited.wait_for(|done| *done)).await,
                Ok(Ok(_))
            );
            if graceful_ok {
                info!("process {id} (pid {pid}) terminated gracefully");
            } else {
                warn!("graceful shutdown for {id} failed; forcing termination");
                if let Err(kill_error) = process::kill_group(pid).await {
                    error!("forceful termination for {id} also failed: {kill_error}");
                }
            }
            self.inner
                .events
                .emit(Event::Done {
                    id,
                    status: JobStatus::Cancelled,
                })
                .await;
            self.inner.active.lock().remove(&id);
        }

        self.cleanup_temporary_files().await;
        *self.inner.stats.lock() = (0, 0);
    }

    fn fresh_cancel_scope(&self) -> CancellationToken {
        let mut guard = self.inner.cancel.lock();
        if guard.is_cancelled() {
            *guard = CancellationToken::new();
        }
        guard.clone()
    }

    /// Idempotent: only spawns enough workers to reach the configured
    /// concurrency.
    fn start_workers(&self, config: &RunnerConfig, cancel: &CancellationToken) {
        let mut workers = self.inner.workers.lock();
        workers.retain(|handle| !handle.is_finished());
        while workers.len() < config.max_concurrent {
            let inner = self.inner.clone();
            let config = config.clone();
            let cancel = cancel.clone();
            let index = workers.len() + 1;
            workers.push(tokio::spawn(async move {
                download_worker(inner, config, cancel, index).await;
            }));
        }
    }

    /// Deletes the acquisition tool's leftover partial files from the
    /// app-owned temp directory.
    async fn cleanup_temporary_files(&self) {
        let dir = self.inner.temp_dir.clone();
        let removed = tokio::task::spawn_blocking(move || {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                return 0usize;
            };
            let mut removed = 0;
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if TEMP_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)) {
                    match std::fs::remove_file(entry.path()) {
                        Ok(()) => removed += 1,
                        Err(delete_error) => error!("error deleting {name}: {delete_error}"),
                    }
                }
            }
            removed
        })
        .await
        .unwrap_or(0);
        if removed > 0 {
            info!("cleanup complete; deleted {removed} temporary file(s)");
        }
    }
}

async fn url_processor(
    inner: Arc<Inner>,
    probe: UrlProbe,
    cancel: CancellationToken,
    index: usize,
) {
    while !cancel.is_cancelled() {
        let Some(task) = inner.url_queue.try_pop() else {
            break;
        };
        info!("[url-processor-{index}] started processing: {}", task.url);
        match probe.count_items(&task.url).await {
            Ok(0) => {
                warn!("[url-processor-{index}] no items found for '{}'", task.url);
            }
            Ok(1) => {
                if cancel.is_cancelled() {
                    break;
                }
                let title = probe
                    .single_title(&task.url)
                    .await
                    .unwrap_or_else(|_| "Title not found".to_string());
                let mut job = Job::new(task.url.clone(), None, task.options.clone());
                job.title = title;
                add_and_queue(&inner, job).await;
            }
            Ok(count) => {
                info!(
                    "[url-processor-{index}] found {count} item(s) for '{}'",
                    task.url
                );
                for item in 1..=count {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let mut job =
                        Job::new(task.url.clone(), Some(item as u32), task.options.clone());
                    job.title = format!("Item {item}/{count}...");
                    add_and_queue(&inner, job).await;
                }
            }
            Err(probe_error) => {
                error!(
                    "[url-processor-{index}] failed to process '{}': {probe_error}",
                    task.url
                );
                if cancel.is_cancelled() {
                    break;
                }
                // surfaced as a job so the failure is visible in the list
                let mut job = Job::new(task.url.clone(), None, task.options.clone());
                job.title = probe_error.reason().to_string();
                job.status = JobStatus::failed(probe_error.reason());
                let id = job.id;
                let status = job.status.clone();
                {
                    let mut stats = inner.stats.lock();
                    stats.1 += 1;
                }
                inner.events.emit(Event::AddJob(job)).await;
                finish_job(&inner, id, status).await;
            }
        }
    }
}

async fn add_and_queue(inner: &Arc<Inner>, job: Job) {
    {
        let mut stats = inner.stats.lock();
        stats.1 += 1;
    }
    let queued = QueuedJob {
        id: job.id,
        spec: JobSpec {
            url: job.original_url.clone(),
            playlist_index: job.playlist_index,
            options: job.options.clone(),
        },
    };
    inner.events.emit(Event::AddJob(job)).await;
    inner.job_queue.push(queued);
}

/// Terminal bookkeeping: completion counter strictly after process
/// deregistration, then the final `Done` event.
async fn finish_job(inner: &Arc<Inner>, id: Uuid, status: JobStatus) {
    {
        let mut stats = inner.stats.lock();
        if stats.0 < stats.1 {
            stats.0 += 1;
        }
    }
    inner.events.emit(Event::Done { id, status }).await;
}

async fn download_worker(
    inner: Arc<Inner>,
    config: RunnerConfig,
    cancel: CancellationToken,
    index: usize,
) {
    debug!("[worker-{index}] started");
    let mut urls_done = inner.urls_done.subscribe();
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let Some(job) = inner.job_queue.pop(&cancel, &mut urls_done).await else {
            break;
        };
        if cancel.is_cancelled() {
            // popped between stop's drain and our own exit
            inner
                .events
                .emit(Event::Done {
                    id: job.id,
                    status: JobStatus::Cancelled,
                })
                .await;
            continue;
        }
        inner
            .events
            .emit(Event::UpdateJob {
                id: job.id,
                update: JobUpdate::Status(JobStatus::Downloading),
            })
            .await;
        run_download_job(&inner, &config, &cancel, job).await;
    }
    debug!("[worker-{index}] exiting");
}

async fn run_download_job(
    inner: &Arc<Inner>,
    config: &RunnerConfig,
    cancel: &CancellationToken,
    job: QueuedJob,
) {
    let command = build_command(config, &inner.temp_dir, &job.spec);

    // registration happens under the same lock as the cancellation check, so
    // a stop raised first means the process is never started
    let spawned = {
        let mut active = inner.active.lock();
        if cancel.is_cancelled() {
            return;
        }
        match StreamingChild::spawn(command) {
            Ok(child) => {
                let (exit_tx, exit_rx) = watch::channel(false);
                active.insert(
                    job.id,
                    ActiveProcess {
                        pid: child.pid,
                        exited: exit_rx,
                    },
                );
                Ok((child, exit_tx))
            }
            Err(spawn_error) => Err(spawn_error),
        }
    };

    let (mut child, exit_tx) = match spawned {
        Ok(pair) => pair,
        Err(spawn_error) => {
            let reason = match &spawn_error {
                ProcessError::Spawn { source, .. }
                    if source.kind() == std::io::ErrorKind::NotFound =>
                {
                    "yt-dlp executable not found".to_string()
                }
                _ => "An unexpected exception occurred".to_string(),
            };
            error!("[{}] {spawn_error}", job.id);
            if !cancel.is_cancelled() {
                finish_job(inner, job.id, JobStatus::Error(reason)).await;
            }
            return;
        }
    };

    let mut parser = OutputParser::default();
    let mut stdout = child.take_stdout();
    let mut stderr = child.take_stderr();

    while stdout.is_some() || stderr.is_some() {
        tokio::select! {
            _ = cancel.cancelled() => break,
            line = read_next(&mut stdout), if stdout.is_some() => {
                match line {
                    Some(line) => {
                        debug!("[{}] {line}", job.id);
                        for update in parser.parse_line(&line) {
                            inner.events.emit(Event::UpdateJob { id: job.id, update }).await;
                        }
                    }
                    None => stdout = None,
                }
            }
            line = read_next(&mut stderr), if stderr.is_some() => {
                match line {
                    Some(line) => {
                        debug!("[{}] {line}", job.id);
                        for update in parser.parse_line(&line) {
                            inner.events.emit(Event::UpdateJob { id: job.id, update }).await;
                        }
                    }
                    None => stderr = None,
                }
            }
        }
    }

    // on cancellation the stop protocol signals the group; this wait returns
    // once it has
    let exit = child.wait().await;
    let _ = exit_tx.send(true);

    inner.active.lock().remove(&job.id);
    if cancel.is_cancelled() {
        // the stop protocol authors the final Cancelled status
        return;
    }

    let final_status = match exit {
        Ok(status) if status.success() => JobStatus::Completed,
        Ok(_) => match parser.error_reason.take() {
            Some(reason) => JobStatus::failed(reason),
            None => JobStatus::Failed(None),
        },
        Err(wait_error) => {
            error!("[{}] error waiting for process: {wait_error}", job.id);
            JobStatus::Error("An unexpected exception occurred".to_string())
        }
    };
    finish_job(inner, job.id, final_status).await;
}

async fn read_next<R: tokio::io::AsyncRead + Unpin>(
    lines: &mut Option<process::LossyLines<R>>,
) -> Option<String> {
    match lines {
        Some(reader) => match reader.next_line().await {
            Ok(Some(line)) => Some(line),
            // EOF and read errors both end the stream
            _ => None,
        },
        None => std::future::pending().await,
    }
}

/// Assembles the acquisition tool's argv from one job's options.
fn build_command(
    config: &RunnerConfig,
    temp_dir: &Path,
    spec: &JobSpec,
) -> tokio::process::Command {
    let mut command = group_command(&config.yt_dlp);
    command.arg("--newline");
    command
        .arg("--progress-template")
        .arg("PROGRESS::%(progress._percent_str)s");
    command.arg("--no-mtime");
    command.arg("--paths").arg(format!("temp:{}", temp_dir.display()));
    command
        .arg("-o")
        .arg(spec.options.output_dir.join(&spec.options.filename_template));

    if let Some(ffmpeg) = &config.ffmpeg {
        if let Some(dir) = ffmpeg.parent() {
            command.arg("--ffmpeg-location").arg(dir);
        }
    }

    match &spec.options.kind {
        DownloadKind::Video { resolution } => {
            let selector = match resolution.height() {
                None => "bestvideo[ext=mp4]+bestaudio[ext=m4a]/best[ext=mp4]/best".to_string(),
                Some(height) => format!(
                    "bestvideo[height<={height}][ext=mp4]+bestaudio[ext=m4a]/best[ext=mp4]/best[height<={height}]"
                ),
            };
            command.arg("-f").arg(selector);
        }
        DownloadKind::Audio { format } => {
            command.arg("-f").arg("bestaudio/best");
            command.arg("-x");
            if *format != AudioFormat::Best {
                command.arg("--audio-format").arg(format.to_string());
                if *format == AudioFormat::Mp3 {
                    command.arg("--audio-quality").arg("192K");
                }
            }
        }
    }

    if spec.options.embed_thumbnail {
        command.arg("--embed-thumbnail");
    }
    if spec.options.embed_metadata {
        command.arg("--embed-metadata");
    }
    if let Some(item) = spec.playlist_index {
        command.arg("--playlist-items").arg(item.to_string());
    }
    command.arg(&spec.url);
    command
}

/// Incremental parser for the acquisition tool's output stream.
#[derive(Default)]
struct OutputParser {
    error_reason: Option<String>,
    title: Option<String>,
}

impl OutputParser {
    fn parse_line(&mut self, raw: &str) -> Vec<JobUpdate> {
        let line = raw.trim();
        let mut updates = Vec::new();

        if let Some(captures) = DESTINATION_RE.captures(line) {
            if let Some(path) = captures.name("path") {
                let stem = Path::new(path.as_str().trim())
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_default();
                if !stem.is_empty() && self.title.as_deref() != Some(stem.as_str()) {
                    self.title = Some(stem.clone());
                    updates.push(JobUpdate::Title(stem));
                }
            }
        }

        if let Some(rest) = line.strip_prefix("ERROR:") {
            self.error_reason = Some(rest.trim().to_string());
        }

        if let Some(captures) = STAGE_RE.captures(line) {
            let stage = match captures[1].to_lowercase().as_str() {
                "merger" => Some(JobStatus::Merging),
                "extractaudio" => Some(JobStatus::ExtractingAudio),
                "embedthumbnail" => Some(JobStatus::Embedding),
                "fixupm4a" => Some(JobStatus::FixingContainer),
                "metadata" => Some(JobStatus::WritingMetadata),
                _ => None,
            };
            if let Some(status) = stage {
                updates.push(JobUpdate::Status(status));
            }
        }

        let mut percent = None;
        if let Some(rest) = line.strip_prefix("PROGRESS::") {
            percent = rest.trim().trim_end_matches('%').trim().parse::<f64>().ok();
        } else if line.contains("[download]") {
            if let Some(captures) = DOWNLOAD_PERCENT_RE.captures(line) {
                percent = captures[1].parse::<f64>().ok();
            }
        }
        if let Some(percent) = percent {
            updates.push(JobUpdate::Progress(format!("{percent:.1}%")));
        }

        updates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VideoResolution;

    fn video_options(resolution: VideoResolution) -> Arc<JobOptions> {
        Arc::new(JobOptions {
            output_dir: PathBuf::from("/downloads"),
            filename_template: "%(title)s.%(ext)s".to_string(),
            kind: DownloadKind::Video { resolution },
            embed_thumbnail: false,
            embed_metadata: false,
        })
    }

    fn audio_options(format: AudioFormat) -> Arc<JobOptions> {
        Arc::new(JobOptions {
            output_dir: PathBuf::from("/downloads"),
            filename_template: "%(title)s.%(ext)s".to_string(),
            kind: DownloadKind::Audio { format },
            embed_thumbnail: false,
            embed_metadata: false,
        })
    }

    fn args_of(command: &tokio::process::Command) -> Vec<String> {
        command
            .as_std()
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    fn runner_config(ffmpeg: Option<PathBuf>) -> RunnerConfig {
        RunnerConfig {
            yt_dlp: PathBuf::from("/opt/app/yt-dlp"),
            ffmpeg,
            max_concurrent: 4,
        }
    }

    #[test]
    fn command_selects_capped_video_formats() {
        let spec = JobSpec {
            url: "https://example/v/abc".to_string(),
            playlist_index: None,
            options: video_options(VideoResolution::P1080),
        };
        let command = build_command(&runner_config(None), Path::new("/tmp/dl"), &spec);
        let args = args_of(&command);

        assert_eq!(args.first().map(String::as_str), Some("--newline"));
        let f_pos = args.iter().position(|a| a == "-f").unwrap();
        assert_eq!(
            args[f_pos + 1],
            "bestvideo[height<=1080][ext=mp4]+bestaudio[ext=m4a]/best[ext=mp4]/best[height<=1080]"
        );
        assert!(args.contains(&"--no-mtime".to_string()));
        assert!(args.contains(&"temp:/tmp/dl".to_string()));
        assert!(!args.contains(&"--ffmpeg-location".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("https://example/v/abc"));
    }

    #[test]
    fn command_selects_unconstrained_best_video() {
        let spec = JobSpec {
            url: "https://example/v/abc".to_string(),
            playlist_index: None,
            options: video_options(VideoResolution::Best),
        };
        let args = args_of(&build_command(&runner_config(None), Path::new("/tmp/dl"), &spec));
        let f_pos = args.iter().position(|a| a == "-f").unwrap();
        assert_eq!(
            args[f_pos + 1],
            "bestvideo[ext=mp4]+bestaudio[ext=m4a]/best[ext=mp4]/best"
        );
    }

    #[test]
    fn command_extracts_audio_with_mp3_quality() {
        let spec = JobSpec {
            url: "https://example/v/abc".to_string(),
            playlist_index: None,
            options: audio_options(AudioFormat::Mp3),
        };
        let args = args_of(&build_command(
            &runner_config(Some(PathBuf::from("/opt/app/ffmpeg"))),
            Path::new("/tmp/dl"),
            &spec,
        ));

        let f_pos = args.iter().position(|a| a == "-f").unwrap();
        assert_eq!(args[f_pos + 1], "bestaudio/best");
        assert!(args.contains(&"-x".to_string()));
        let format_pos = args.iter().position(|a| a == "--audio-format").unwrap();
        assert_eq!(args[format_pos + 1], "mp3");
        let quality_pos = args.iter().position(|a| a == "--audio-quality").unwrap();
        assert_eq!(args[quality_pos + 1], "192K");
        let location_pos = args.iter().position(|a| a == "--ffmpeg-location").unwrap();
        assert_eq!(args[location_pos + 1], "/opt/app");
    }

    #[test]
    fn command_leaves_best_audio_unconverted() {
        let spec = JobSpec {
            url: "https://example/v/abc".to_string(),
            playlist_index: None,
            options: audio_options(AudioFormat::Best),
        };
        let args = args_of(&build_command(&runner_config(None), Path::new("/tmp/dl"), &spec));
        assert!(args.contains(&"-x".to_string()));
        assert!(!args.contains(&"--audio-format".to_string()));
        assert!(!args.contains(&"--audio-quality".to_string()));
    }

    #[test]
    fn command_constrains_playlist_items_and_embeds() {
        let options = Arc::new(JobOptions {
            output_dir: PathBuf::from("/downloads"),
            filename_template: "%(title)s.%(ext)s".to_string(),
            kind: DownloadKind::Video {
                resolution: VideoResolution::P720,
            },
            embed_thumbnail: true,
            embed_metadata: true,
        });
        let spec = JobSpec {
            url: "https://example/list".to_string(),
            playlist_index: Some(3),
            options,
        };
        let args = args_of(&build_command(&runner_config(None), Path::new("/tmp/dl"), &spec));
        assert!(args.contains(&"--embed-thumbnail".to_string()));
        assert!(args.contains(&"--embed-metadata".to_string()));
        let items_pos = args.iter().position(|a| a == "--playlist-items").unwrap();
        assert_eq!(args[items_pos + 1], "3");
    }

    #[test]
    fn parser_prefers_progress_template_lines() {
        let mut parser = OutputParser::default();
        let updates = parser.parse_line("PROGRESS:: 25.0%");
        assert!(matches!(
            updates.as_slice(),
            [JobUpdate::Progress(p)] if p == "25.0%"
        ));
    }

    #[test]
    fn parser_falls_back_to_download_percentages() {
        let mut parser = OutputParser::default();
        let updates =
            parser.parse_line("[download]  42.3% of ~120.00MiB at 4.20MiB/s ETA 00:27");
        assert!(matches!(
            updates.as_slice(),
            [JobUpdate::Progress(p)] if p == "42.3%"
        ));

        let updates = parser.parse_line("[download] 100% of 3.50MiB in 00:02");
        assert!(matches!(
            updates.as_slice(),
            [JobUpdate::Progress(p)] if p == "100.0%"
        ));
    }

    #[test]
    fn parser_maps_stage_markers_to_statuses() {
        let mut parser = OutputParser::default();
        let cases = [
            ("[Merger] Merging formats", JobStatus::Merging),
            ("[ExtractAudio] Destination ignored here", JobStatus::ExtractingAudio),
            ("[EmbedThumbnail] writing", JobStatus::Embedding),
            ("[FixupM4a] fixing", JobStatus::FixingContainer),
            ("[Metadata] adding", JobStatus::WritingMetadata),
        ];
        for (line, expected) in cases {
            let updates = parser.parse_line(line);
            assert!(
                updates
                    .iter()
                    .any(|u| matches!(u, JobUpdate::Status(s) if *s == expected)),
                "line {line:?} should map to {expected:?}"
            );
        }
        assert!(parser.parse_line("[youtube] extracting").is_empty());
    }

    #[test]
    fn parser_updates_title_from_destination_once() {
        let mut parser = OutputParser::default();
        let updates = parser.parse_line("[download] Destination: /downloads/Clip [abc123].mp4");
        assert!(matches!(
            updates.as_slice(),
            [JobUpdate::Title(t)] if t == "Clip [abc123]"
        ));
        // unchanged destination does not repeat the update
        assert!(parser
            .parse_line("[download] Destination: /downloads/Clip [abc123].mp4")
            .is_empty());
    }

    #[test]
    fn parser_captures_error_reasons() {
        let mut parser = OutputParser::default();
        parser.parse_line("ERROR: Video unavailable");
        assert_eq!(parser.error_reason.as_deref(), Some("Video unavailable"));
    }

    #[tokio::test]
    async fn work_queue_is_fifo_and_drains() {
        let queue = WorkQueue::new();
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.try_pop(), Some(1));
        assert_eq!(queue.drain(), vec![2, 3]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn work_queue_pop_honors_cancellation_and_idle_stop() {
        let queue: Arc<WorkQueue<u32>> = Arc::new(WorkQueue::new());
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);

        // cancellation wins even while waiting
        let waiting = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            let mut done_rx = done_rx.clone();
            tokio::spawn(async move { queue.pop(&cancel, &mut done_rx).await })
        };
        cancel.cancel();
        assert_eq!(waiting.await.unwrap(), None);

        // idle-stop ends an empty wait, but queued items still come first
        let cancel = CancellationToken::new();
        queue.push(7);
        let mut done_rx2 = done_rx.clone();
        done_tx.send_replace(true);
        assert_eq!(queue.pop(&cancel, &mut done_rx2).await, Some(7));
        assert_eq!(queue.pop(&cancel, &mut done_rx2).await, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn starting_workers_twice_yields_the_same_count() {
        let (bus, _rx) = EventBus::channel();
        let orchestrator = Orchestrator::new(bus, std::env::temp_dir());
        orchestrator.inner.urls_done.send_replace(false);
        let config = runner_config(None);
        let cancel = CancellationToken::new();

        orchestrator.start_workers(&config, &cancel);
        let first = orchestrator.worker_count();
        orchestrator.start_workers(&config, &cancel);
        let second = orchestrator.worker_count();
        assert_eq!(first, config.max_concurrent);
        assert_eq!(second, first);

        cancel.cancel();
    }

    #[cfg(unix)]
    mod end_to_end {
        use super::super::*;
        use crate::config::VideoResolution;
        use std::collections::HashMap;
        use std::os::unix::fs::PermissionsExt;
        use tempfile::tempdir;
        use tokio::sync::mpsc;

        const FAKE_TOOL: &str = r#"
case "$*" in
  *--flat-playlist*)
    cat "$FAKE_IDS"
    ;;
  *--get-title*)
    echo 'Clip'
    ;;
  *)
    if [ -n "$FAKE_FAIL_ITEM" ]; then
      for arg in "$@"; do
        if [ "$prev" = "--playlist-items" ] && [ "$arg" = "$FAKE_FAIL_ITEM" ]; then
          echo 'ERROR: Video unavailable' >&2
          exit 1
        fi
        prev="$arg"
      done
    fi
    echo 'PROGRESS:: 25.0%'
    echo 'PROGRESS:: 75.0%'
    echo '[Metadata] Adding metadata'
    echo 'PROGRESS:: 100.0%'
    exit 0
    ;;
esac
"#;

        struct Fixture {
            orchestrator: Orchestrator,
            rx: mpsc::Receiver<Event>,
            _dirs: (tempfile::TempDir, tempfile::TempDir),
            temp_dir: PathBuf,
        }

        fn fixture(ids: &str, fail_item: Option<&str>) -> Fixture {
            let tool_dir = tempdir().unwrap();
            let temp = tempdir().unwrap();
            let temp_dir = temp.path().to_path_buf();

            let ids_path = tool_dir.path().join("ids.txt");
            std::fs::write(&ids_path, ids).unwrap();

            let tool = tool_dir.path().join("fake-yt-dlp");
            let exports = format!(
                "#!/bin/sh\nFAKE_IDS='{}'\nFAKE_FAIL_ITEM='{}'\nexport FAKE_IDS FAKE_FAIL_ITEM\n{FAKE_TOOL}",
                ids_path.display(),
                fail_item.unwrap_or("")
            );
            std::fs::write(&tool, exports).unwrap();
            let mut perms = std::fs::metadata(&tool).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&tool, perms).unwrap();

            let (bus, rx) = EventBus::channel();
            let orchestrator = Orchestrator::new(bus, temp_dir.clone());
            orchestrator.configure(tool, None, 4);
            Fixture {
                orchestrator,
                rx,
                _dirs: (tool_dir, temp),
                temp_dir,
            }
        }

        fn job_options() -> JobOptions {
            JobOptions {
                output_dir: std::env::temp_dir(),
                filename_template: "%(title)s.%(ext)s".to_string(),
                kind: DownloadKind::Video {
                    resolution: VideoResolution::P1080,
                },
                embed_thumbnail: false,
                embed_metadata: true,
            }
        }

        async fn collect_until_done(
            rx: &mut mpsc::Receiver<Event>,
            expected_done: usize,
        ) -> Vec<Event> {
            let mut events = Vec::new();
            let mut done = 0;
            while done < expected_done {
                let event = tokio::time::timeout(Duration::from_secs(20), rx.recv())
                    .await
                    .expect("events before timeout")
                    .expect("bus open");
                if matches!(event, Event::Done { .. }) {
                    done += 1;
                }
                events.push(event);
            }
            events
        }

        #[tokio::test(flavor = "multi_thread")]
        async fn single_video_happy_path() {
            let mut fx = fixture("abc\n", None);
            fx.orchestrator
                .enqueue(vec!["https://example/v/abc".to_string()], job_options())
                .await;

            let events = collect_until_done(&mut fx.rx, 1).await;

            let added: Vec<&Job> = events
                .iter()
                .filter_map(|e| match e {
                    Event::AddJob(job) => Some(job),
                    _ => None,
                })
                .collect();
            assert_eq!(added.len(), 1);
            assert_eq!(added[0].title, "Clip");
            assert_eq!(added[0].playlist_index, None);

            let progress: Vec<String> = events
                .iter()
                .filter_map(|e| match e {
                    Event::UpdateJob {
                        update: JobUpdate::Progress(p),
                        ..
                    } => Some(p.clone()),
                    _ => None,
                })
                .collect();
            assert!(progress.contains(&"25.0%".to_string()));
            assert!(progress.contains(&"75.0%".to_string()));

            assert!(events.iter().any(|e| matches!(
                e,
                Event::UpdateJob {
                    update: JobUpdate::Status(JobStatus::WritingMetadata),
                    ..
                }
            )));
            assert!(events.iter().any(|e| matches!(
                e,
                Event::Done {
                    status: JobStatus::Completed,
                    ..
                }
            )));
            assert_eq!(fx.orchestrator.stats(), (1, 1));
        }

        #[tokio::test(flavor = "multi_thread")]
        async fn playlist_of_three_with_one_failure() {
            let mut fx = fixture("a\nb\nc\n", Some("2"));
            fx.orchestrator
                .enqueue(vec!["https://example/list".to_string()], job_options())
                .await;

            let events = collect_until_done(&mut fx.rx, 3).await;

            let mut index_by_id = HashMap::new();
            for event in &events {
                if let Event::AddJob(job) = event {
                    assert!(job.title.starts_with("Item "));
                    index_by_id.insert(job.id, job.playlist_index.unwrap());
                }
            }
            assert_eq!(index_by_id.len(), 3);

            let mut statuses = HashMap::new();
            for event in &events {
                if let Event::Done { id, status } = event {
                    statuses.insert(index_by_id[id], status.clone());
                }
            }
            assert_eq!(statuses[&1], JobStatus::Completed);
            assert_eq!(
                statuses[&2],
                JobStatus::failed("Video unavailable")
            );
            assert_eq!(statuses[&3], JobStatus::Completed);
            assert_eq!(fx.orchestrator.stats(), (3, 3));
        }

        #[tokio::test(flavor = "multi_thread")]
        async fn probe_failure_becomes_a_synthetic_failed_job() {
            let mut fx = fixture("", None);
            // empty id file means zero items; use a tool that errors instead
            let tool_dir = tempdir().unwrap();
            let tool = tool_dir.path().join("fake-yt-dlp");
            std::fs::write(
                &tool,
                "#!/bin/sh\necho 'ERROR: Unsupported URL' >&2\nexit 1\n",
            )
            .unwrap();
            let mut perms = std::fs::metadata(&tool).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&tool, perms).unwrap();
            fx.orchestrator.configure(tool, None, 4);

            fx.orchestrator
                .enqueue(vec!["https://example/bogus".to_string()], job_options())
                .await;

            let events = collect_until_done(&mut fx.rx, 1).await;
            let job = events
                .iter()
                .find_map(|e| match e {
                    Event::AddJob(job) => Some(job),
                    _ => None,
                })
                .expect("synthetic job added");
            assert_eq!(job.title, "Unsupported URL");
            assert_eq!(job.status, JobStatus::failed("Unsupported URL"));
            assert!(events.iter().any(|e| matches!(
                e,
                Event::Done { status, .. } if *status == JobStatus::failed("Unsupported URL")
            )));
            assert_eq!(fx.orchestrator.stats(), (1, 1));
        }

        #[tokio::test(flavor = "multi_thread")]
        async fn url_processing_done_fires_after_expansion() {
            let mut fx = fixture("abc\n", None);
            fx.orchestrator
                .enqueue(vec!["https://example/v/abc".to_string()], job_options())
                .await;

            let mut saw_marker = false;
            let mut saw_done = false;
            while !(saw_marker && saw_done) {
                let event = tokio::time::timeout(Duration::from_secs(20), fx.rx.recv())
                    .await
                    .expect("events before timeout")
                    .expect("bus open");
                match event {
                    Event::UrlProcessingDone => saw_marker = true,
                    Event::Done { .. } => saw_done = true,
                    _ => {}
                }
            }
        }

        #[tokio::test(flavor = "multi_thread")]
        async fn stop_protocol_cancels_and_cleans_up() {
            let tool_dir = tempdir().unwrap();
            let temp = tempdir().unwrap();
            let temp_dir = temp.path().to_path_buf();

            // download hangs until signalled
            let tool = tool_dir.path().join("fake-yt-dlp");
            std::fs::write(
                &tool,
                "#!/bin/sh\ncase \"$*\" in\n  *--flat-playlist*) echo abc ;;\n  *--get-title*) echo 'Clip' ;;\n  *) echo 'PROGRESS:: 10.0%'; sleep 60 ;;\nesac\n",
            )
            .unwrap();
            let mut perms = std::fs::metadata(&tool).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&tool, perms).unwrap();

            let (bus, mut rx) = EventBus::channel();
            let orchestrator = Orchestrator::new(bus, temp_dir.clone());
            orchestrator.configure(tool, None, 2);

            std::fs::write(temp_dir.join("partial.part"), "x").unwrap();
            std::fs::write(temp_dir.join("partial.ytdl"), "x").unwrap();
            std::fs::write(temp_dir.join("keep.mp4"), "x").unwrap();

            orchestrator
                .enqueue(vec!["https://example/v/abc".to_string()], job_options())
                .await;

            // wait for the download to be in flight
            let mut downloading = false;
            while !downloading {
                let event = tokio::time::timeout(Duration::from_secs(20), rx.recv())
                    .await
                    .expect("events before timeout")
                    .expect("bus open");
                downloading = matches!(
                    event,
                    Event::UpdateJob {
                        update: JobUpdate::Progress(_),
                        ..
                    }
                );
            }

            orchestrator.stop().await;

            let mut cancelled = 0;
            while let Ok(event) = rx.try_recv() {
                if let Event::Done { status, .. } = event {
                    assert_eq!(status, JobStatus::Cancelled);
                    cancelled += 1;
                }
            }
            assert_eq!(cancelled, 1);
            assert_eq!(orchestrator.stats(), (0, 0));
            assert!(!temp_dir.join("partial.part").exists());
            assert!(!temp_dir.join("partial.ytdl").exists());
            assert!(temp_dir.join("keep.mp4").exists());
        }
    }
}
