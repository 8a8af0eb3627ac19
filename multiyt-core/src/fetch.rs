use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, RANGE};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::time::{interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::InstallError;

pub const CHUNKED_THRESHOLD: u64 = 20 * 1024 * 1024;
pub const CHUNK_COUNT: u64 = 8;
pub const RETRY_ATTEMPTS: u32 = 3;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HEAD_TIMEOUT: Duration = Duration::from_secs(10);
const REPORT_INTERVAL: Duration = Duration::from_millis(500);
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPhase {
    Download,
    Extract,
    Locate,
    Assemble,
}

#[derive(Debug, Clone)]
pub struct FetchProgress {
    pub phase: FetchPhase,
    pub determinate: bool,
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub text: String,
}

impl FetchProgress {
    pub fn determinate(
        phase: FetchPhase,
        bytes_done: u64,
        bytes_total: u64,
        text: impl Into<String>,
    ) -> Self {
        Self {
            phase,
            determinate: true,
            bytes_done,
            bytes_total,
            text: text.into(),
        }
    }

    pub fn indeterminate(phase: FetchPhase, text: impl Into<String>) -> Self {
        Self {
            phase,
            determinate: false,
            bytes_done: 0,
            bytes_total: 0,
            text: text.into(),
        }
    }

    /// Percentage for a determinate progress bar.
    pub fn percent(&self) -> f64 {
        if !self.determinate || self.bytes_total == 0 {
            return 0.0;
        }
        (self.bytes_done as f64 / self.bytes_total as f64) * 100.0
    }
}

pub type ProgressSink = Arc<dyn Fn(FetchProgress) + Send + Sync>;

/// Range-aware, retrying file downloader. Large files on range-capable
/// servers are pulled as eight parallel pieces and reassembled; everything
/// else streams through a single connection.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, InstallError> {
        let client = reqwest::Client::builder()
            .user_agent(BROWSER_USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(InstallError::network)?;
        Ok(Self { client })
    }

    pub async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        sink: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), InstallError> {
        let result = self.fetch_inner(url, dest, sink, cancel).await;
        if matches!(result, Err(InstallError::Cancelled)) {
            let _ = tokio::fs::remove_file(dest).await;
        }
        result
    }

    async fn fetch_inner(
        &self,
        url: &str,
        dest: &Path,
        sink: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), InstallError> {
        sink(FetchProgress::determinate(
            FetchPhase::Download,
            0,
            0,
            "Preparing download...",
        ));

        let (total, ranges_supported) = self.probe_head(url).await;

        if use_chunked(total, ranges_supported) {
            info!(
                "starting chunked download ({:.1} MB in {CHUNK_COUNT} ranges)",
                mib(total)
            );
            match self.fetch_chunked(url, dest, total, sink, cancel).await {
                Ok(()) => {}
                Err(InstallError::Cancelled) => return Err(InstallError::Cancelled),
                Err(fallback_cause) => {
                    warn!("chunked download failed ({fallback_cause}); falling back to single stream");
                    let _ = tokio::fs::remove_file(dest).await;
                    self.fetch_single_stream(url, dest, sink, cancel).await?;
                }
            }
        } else {
            if total > 0 && total <= CHUNKED_THRESHOLD {
                info!("starting single-stream download (file is small)");
            } else if total > 0 {
                info!("starting single-stream download (server does not support ranged requests)");
            } else {
                info!("starting single-stream download");
            }
            self.fetch_single_stream(url, dest, sink, cancel).await?;
        }

        if cancel.is_cancelled() {
            return Err(InstallError::Cancelled);
        }

        sink(FetchProgress::determinate(
            FetchPhase::Download,
            total,
            total,
            "Download complete. Preparing...",
        ));
        Ok(())
    }

    /// Discovers size and range support. Failure is non-fatal; the download
    /// proceeds single-stream.
    async fn probe_head(&self, url: &str) -> (u64, bool) {
        let response = self
            .client
            .head(url)
            .timeout(HEAD_TIMEOUT)
            .send()
            .await
            .and_then(|response| response.error_for_status());
        let response = match response {
            Ok(response) => response,
            Err(probe_error) => {
                warn!("HEAD request failed: {probe_error}; proceeding with single-stream download");
                return (0, false);
            }
        };

        let total = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(0);
        let ranges_supported = response
            .headers()
            .get(ACCEPT_RANGES)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);
        (total, ranges_supported)
    }

    async fn fetch_single_stream(
        &self,
        url: &str,
        dest: &Path,
        sink: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), InstallError> {
        let mut last_error = None;
        for attempt in 0..RETRY_ATTEMPTS {
            if cancel.is_cancelled() {
                return Err(InstallError::Cancelled);
            }
            match self.single_stream_attempt(url, dest, sink, cancel).await {
                Ok(()) => return Ok(()),
                Err(InstallError::Cancelled) => return Err(InstallError::Cancelled),
                Err(retryable @ InstallError::Network { .. }) => {
                    error!(
                        "single-stream error on attempt {}: {retryable}",
                        attempt + 1
                    );
                    last_error = Some(retryable);
                    if attempt + 1 < RETRY_ATTEMPTS {
                        sleep(backoff(attempt)).await;
                    }
                }
                Err(fatal) => return Err(fatal),
            }
        }
        Err(last_error.unwrap_or(InstallError::Network {
            reason: "download failed".to_string(),
        }))
    }

    async fn single_stream_attempt(
        &self,
        url: &str,
        dest: &Path,
        sink: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), InstallError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(InstallError::network)?;

        let total = response.content_length().unwrap_or(0);
        if total == 0 {
            sink(FetchProgress::indeterminate(
                FetchPhase::Download,
                "Downloading... (size unknown)",
            ));
        }

        let mut file = File::create(dest)
            .await
            .map_err(|source| InstallError::file(dest, source))?;
        let started = Instant::now();
        let mut downloaded: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                return Err(InstallError::Cancelled);
            }
            let chunk = chunk.map_err(InstallError::network)?;
            file.write_all(&chunk)
                .await
                .map_err(|source| InstallError::file(dest, source))?;
            downloaded += chunk.len() as u64;
            if total > 0 {
                sink(FetchProgress::determinate(
                    FetchPhase::Download,
                    downloaded,
                    total,
                    human_rate_text(downloaded, total, started.elapsed()),
                ));
            }
        }
        file.flush()
            .await
            .map_err(|source| InstallError::file(dest, source))?;

        if total > 0 && downloaded != total {
            return Err(InstallError::Network {
                reason: format!("incomplete body: {downloaded} of {total} bytes"),
            });
        }
        Ok(())
    }

    async fn fetch_chunked(
        &self,
        url: &str,
        dest: &Path,
        total: u64,
        sink: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), InstallError> {
        let scratch = tempfile::tempdir().map_err(|source| InstallError::File {
            reason: format!("could not create scratch directory: {source}"),
        })?;

        let ranges = split_ranges(total, CHUNK_COUNT);
        let counters: Vec<Arc<AtomicU64>> = ranges
            .iter()
            .map(|_| Arc::new(AtomicU64::new(0)))
            .collect();
        let chunk_scope = cancel.child_token();

        let mut tasks = Vec::with_capacity(ranges.len());
        for (index, range) in ranges.iter().enumerate() {
            tasks.push(tokio::spawn(fetch_chunk(
                self.client.clone(),
                url.to_string(),
                *range,
                index,
                scratch.path().join(format!("chunk_{index}")),
                counters[index].clone(),
                chunk_scope.clone(),
            )));
        }

        let reporter_stop = CancellationToken::new();
        let reporter = tokio::spawn(report_combined_bytes(
            counters.clone(),
            total,
            sink.clone(),
            reporter_stop.clone(),
        ));

        let mut failure: Option<InstallError> = None;
        for task in tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(chunk_error)) => {
                    if failure.is_none() {
                        failure = Some(chunk_error);
                        chunk_scope.cancel();
                    }
                }
                Err(join_error) => {
                    if failure.is_none() {
                        failure = Some(InstallError::Unexpected {
                            reason: join_error.to_string(),
                        });
                        chunk_scope.cancel();
                    }
                }
            }
        }
        reporter_stop.cancel();
        reporter.await.ok();

        if cancel.is_cancelled() {
            return Err(InstallError::Cancelled);
        }
        if let Some(chunk_error) = failure {
            return Err(chunk_error);
        }

        sink(FetchProgress::indeterminate(
            FetchPhase::Assemble,
            "Assembling file...",
        ));
        assemble_chunks(dest, scratch.path(), ranges.len()).await?;

        let written = tokio::fs::metadata(dest)
            .await
            .map(|meta| meta.len())
            .unwrap_or(0);
        if written != total {
            return Err(InstallError::Network {
                reason: format!("assembled {written} of {total} bytes"),
            });
        }
        Ok(())
    }
}

async fn fetch_chunk(
    client: reqwest::Client,
    url: String,
    range: (u64, u64),
    index: usize,
    path: std::path::PathBuf,
    counter: Arc<AtomicU64>,
    cancel: CancellationToken,
) -> Result<(), InstallError> {
    let mut last_error = None;
    for attempt in 0..RETRY_ATTEMPTS {
        if cancel.is_cancelled() {
            return Err(InstallError::Cancelled);
        }
        match fetch_chunk_attempt(&client, &url, range, &path, &counter, &cancel).await {
            Ok(()) => return Ok(()),
            Err(InstallError::Cancelled) => return Err(InstallError::Cancelled),
            Err(retryable @ InstallError::Network { .. }) => {
                error!("error on chunk {index}, attempt {}: {retryable}", attempt + 1);
                last_error = Some(retryable);
                if attempt + 1 < RETRY_ATTEMPTS {
                    sleep(backoff(attempt)).await;
                }
            }
            Err(fatal) => return Err(fatal),
        }
    }
    Err(last_error.unwrap_or(InstallError::Network {
        reason: format!("failed to download chunk {index}"),
    }))
}

async fn fetch_chunk_attempt(
    client: &reqwest::Client,
    url: &str,
    (start, end): (u64, u64),
    path: &Path,
    counter: &Arc<AtomicU64>,
    cancel: &CancellationToken,
) -> Result<(), InstallError> {
    counter.store(0, Ordering::Relaxed);
    let response = client
        .get(url)
        .header(RANGE, format!("bytes={start}-{end}"))
        .send()
        .await
        .and_then(|response| response.error_for_status())
        .map_err(InstallError::network)?;

    let mut file = File::create(path)
        .await
        .map_err(|source| InstallError::file(path, source))?;
    let mut written: u64 = 0;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        if cancel.is_cancelled() {
            return Err(InstallError::Cancelled);
        }
        let chunk = chunk.map_err(InstallError::network)?;
        file.write_all(&chunk)
            .await
            .map_err(|source| InstallError::file(path, source))?;
        written += chunk.len() as u64;
        counter.store(written, Ordering::Relaxed);
    }
    file.flush()
        .await
        .map_err(|source| InstallError::file(path, source))?;

    let expected = end - start + 1;
    if written != expected {
        return Err(InstallError::Network {
            reason: format!("range {start}-{end} returned {written} of {expected} bytes"),
        });
    }
    Ok(())
}

/// Emits the combined byte count of all in-flight chunks twice a second.
async fn report_combined_bytes(
    counters: Vec<Arc<AtomicU64>>,
    total: u64,
    sink: ProgressSink,
    stop: CancellationToken,
) {
    let started = Instant::now();
    let mut ticker = interval(REPORT_INTERVAL);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                let done: u64 = counters.iter().map(|c| c.load(Ordering::Relaxed)).sum();
                sink(FetchProgress::determinate(
                    FetchPhase::Download,
                    done,
                    total,
                    human_rate_text(done, total, started.elapsed()),
                ));
            }
        }
    }
}

async fn assemble_chunks(dest: &Path, scratch: &Path, count: usize) -> Result<(), InstallError> {
    let mut out = File::create(dest)
        .await
        .map_err(|source| InstallError::file(dest, source))?;
    for index in 0..count {
        let piece = scratch.join(format!("chunk_{index}"));
        let mut input = File::open(&piece)
            .await
            .map_err(|source| InstallError::file(&piece, source))?;
        tokio::io::copy(&mut input, &mut out)
            .await
            .map_err(|source| InstallError::file(dest, source))?;
    }
    out.flush()
        .await
        .map_err(|source| InstallError::file(dest, source))?;
    Ok(())
}

fn use_chunked(total: u64, ranges_supported: bool) -> bool {
    total > CHUNKED_THRESHOLD && ranges_supported
}

/// Splits `[0, size - 1]` into `parts` contiguous inclusive byte ranges; the
/// last range absorbs the remainder.
fn split_ranges(size: u64, parts: u64) -> Vec<(u64, u64)> {
    let chunk = size / parts;
    let mut ranges = Vec::with_capacity(parts as usize);
    for index in 0..parts - 1 {
        ranges.push((index * chunk, (index + 1) * chunk - 1));
    }
    ranges.push(((parts - 1) * chunk, size - 1));
    ranges
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1 << attempt)
}

fn mib(bytes: u64) -> f64 {
    bytes as f64 / 1024.0 / 1024.0
}

fn human_rate_text(done: u64, total: u64, elapsed: Duration) -> String {
    let speed = if elapsed.as_secs_f64() > 0.0 {
        mib(done) / elapsed.as_secs_f64()
    } else {
        0.0
    };
    format!(
        "Downloading... {:.1}/{:.1} MB ({speed:.1} MB/s)",
        mib(done),
        mib(total)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_tile_the_file_exactly() {
        let size = 120 * 1024 * 1024 + 7;
        let ranges = split_ranges(size, CHUNK_COUNT);
        assert_eq!(ranges.len(), CHUNK_COUNT as usize);
        assert_eq!(ranges[0].0, 0);
        assert_eq!(ranges.last().unwrap().1, size - 1);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].1 + 1, pair[1].0);
        }
        let covered: u64 = ranges.iter().map(|(s, e)| e - s + 1).sum();
        assert_eq!(covered, size);
    }

    #[test]
    fn chunking_needs_size_and_range_support() {
        assert!(!use_chunked(CHUNKED_THRESHOLD, true));
        assert!(use_chunked(CHUNKED_THRESHOLD + 1, true));
        assert!(!use_chunked(500 * 1024 * 1024, false));
        assert!(!use_chunked(0, true));
    }

    #[test]
    fn backoff_schedule_is_one_then_two_seconds() {
        assert_eq!(backoff(0), Duration::from_secs(1));
        assert_eq!(backoff(1), Duration::from_secs(2));
    }

    #[test]
    fn progress_text_reports_megabytes_and_rate() {
        let text = human_rate_text(10 * 1024 * 1024, 120 * 1024 * 1024, Duration::from_secs(5));
        assert_eq!(text, "Downloading... 10.0/120.0 MB (2.0 MB/s)");
    }

    #[test]
    fn percent_requires_a_known_total() {
        let known = FetchProgress::determinate(FetchPhase::Download, 30, 120, "");
        assert!((known.percent() - 25.0).abs() < f64::EPSILON);
        let unknown = FetchProgress::indeterminate(FetchPhase::Download, "");
        assert_eq!(unknown.percent(), 0.0);
    }

    #[tokio::test]
    async fn assembly_concatenates_chunks_in_order() {
        let scratch = tempfile::tempdir().unwrap();
        let canonical: Vec<u8> = (0u32..4096).flat_map(|v| v.to_le_bytes()).collect();
        let ranges = split_ranges(canonical.len() as u64, CHUNK_COUNT);
        for (index, (start, end)) in ranges.iter().enumerate() {
            std::fs::write(
                scratch.path().join(format!("chunk_{index}")),
                &canonical[*start as usize..=*end as usize],
            )
            .unwrap();
        }

        let dest_dir = tempfile::tempdir().unwrap();
        let dest = dest_dir.path().join("assembled.bin");
        assemble_chunks(&dest, scratch.path(), ranges.len())
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), canonical);
    }
}
