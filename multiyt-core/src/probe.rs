use std::path::PathBuf;
use std::time::Duration;

use tracing::error;

use crate::error::{ProbeError, ProcessError};
use crate::process::{self, quiet_command, RunOutput};

const COUNT_TIMEOUT: Duration = Duration::from_secs(60);
const TITLE_TIMEOUT: Duration = Duration::from_secs(30);
const ERROR_REASON_MAX: usize = 200;

/// Drives the acquisition tool in its "no extraction" modes to discover what
/// a user-supplied URL expands to.
pub struct UrlProbe {
    yt_dlp: PathBuf,
}

impl UrlProbe {
    pub fn new(yt_dlp: PathBuf) -> Self {
        Self { yt_dlp }
    }

    /// Number of acquisition jobs the URL expands to. A plain item reports 1.
    pub async fn count_items(&self, url: &str) -> Result<usize, ProbeError> {
        let mut command = quiet_command(&self.yt_dlp);
        command.args(["--flat-playlist", "--print", "%(id)s", "--no-warnings", url]);
        let output = self
            .run(command, COUNT_TIMEOUT, "URL probe timed out.")
            .await?;
        Ok(output
            .stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .count())
    }

    /// Title of a single-item URL.
    pub async fn single_title(&self, url: &str) -> Result<String, ProbeError> {
        let mut command = quiet_command(&self.yt_dlp);
        command.args(["--get-title", "--no-warnings", url]);
        let output = self
            .run(command, TITLE_TIMEOUT, "Title lookup timed out.")
            .await?;
        let title = output.stdout.lines().next().map(str::trim).unwrap_or("");
        if title.is_empty() {
            Ok("Title not found".to_string())
        } else {
            Ok(title.to_string())
        }
    }

    async fn run(
        &self,
        command: tokio::process::Command,
        limit: Duration,
        timeout_reason: &str,
    ) -> Result<RunOutput, ProbeError> {
        match process::run_with_timeout(command, limit).await {
            Ok(output) if output.success() => Ok(output),
            Ok(output) => {
                error!(
                    "probe via {:?} failed: {}",
                    self.yt_dlp,
                    output.stderr.trim()
                );
                Err(ProbeError::Extraction(parse_tool_error(&output.stderr)))
            }
            Err(ProcessError::Timeout(_)) => {
                Err(ProbeError::Extraction(timeout_reason.to_string()))
            }
            Err(ProcessError::Spawn { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                Err(ProbeError::Extraction(
                    "yt-dlp executable not found.".to_string(),
                ))
            }
            Err(error) => Err(ProbeError::Extraction(error.to_string())),
        }
    }
}

/// Condenses the tool's stderr into one user-presentable sentence: the first
/// `error:`-prefixed line wins, truncated to a readable length; otherwise the
/// last non-empty line.
fn parse_tool_error(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        return "yt-dlp returned an error with no output.".to_string();
    }

    for line in trimmed.lines() {
        if line.to_lowercase().starts_with("error:") {
            let message = line[6..].trim();
            if message.chars().count() > ERROR_REASON_MAX {
                let clipped: String = message.chars().take(ERROR_REASON_MAX).collect();
                return format!("{clipped}...");
            }
            return message.to_string();
        }
    }

    trimmed
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .map(|line| line.trim().to_string())
        .unwrap_or_else(|| "yt-dlp returned an error with no output.".to_string())
}
