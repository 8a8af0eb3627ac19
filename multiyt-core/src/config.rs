use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConfigError;
use crate::paths;

static TEMPLATE_FIELD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"%\((title|id)").expect("valid regex"));

pub const DEFAULT_FILENAME_TEMPLATE: &str = "%(title).100s [%(id)s].%(ext)s";
pub const MAX_CONCURRENT_RANGE: (u32, u32) = (1, 20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DownloadType {
    #[default]
    Video,
    Audio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum VideoResolution {
    Best,
    #[default]
    #[serde(rename = "1080")]
    P1080,
    #[serde(rename = "720")]
    P720,
    #[serde(rename = "480")]
    P480,
}

impl VideoResolution {
    /// Height value handed to the acquisition tool's format selector.
    pub fn height(&self) -> Option<u32> {
        match self {
            VideoResolution::Best => None,
            VideoResolution::P1080 => Some(1080),
            VideoResolution::P720 => Some(720),
            VideoResolution::P480 => Some(480),
        }
    }
}

impl std::fmt::Display for VideoResolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VideoResolution::Best => write!(f, "Best"),
            VideoResolution::P1080 => write!(f, "1080"),
            VideoResolution::P720 => write!(f, "720"),
            VideoResolution::P480 => write!(f, "480"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Best,
    #[default]
    Mp3,
    M4a,
    Flac,
    Wav,
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            AudioFormat::Best => "best",
            AudioFormat::Mp3 => "mp3",
            AudioFormat::M4a => "m4a",
            AudioFormat::Flac => "flac",
            AudioFormat::Wav => "wav",
        };
        write!(f, "{text}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warning => tracing::Level::WARN,
            // tracing has no level above ERROR
            LogLevel::Error | LogLevel::Critical => tracing::Level::ERROR,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub download_type: DownloadType,
    pub video_resolution: VideoResolution,
    pub audio_format: AudioFormat,
    pub embed_thumbnail: bool,
    pub embed_metadata: bool,
    pub filename_template: String,
    pub max_concurrent_downloads: u32,
    pub last_output_path: PathBuf,
    pub log_level: LogLevel,
    pub check_for_updates_on_startup: bool,
    pub skipped_update_version: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_type: DownloadType::Video,
            video_resolution: VideoResolution::P1080,
            audio_format: AudioFormat::Mp3,
            embed_thumbnail: true,
            embed_metadata: false,
            filename_template: DEFAULT_FILENAME_TEMPLATE.to_string(),
            max_concurrent_downloads: 4,
            last_output_path: dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")),
            log_level: LogLevel::Info,
            check_for_updates_on_startup: true,
            skipped_update_version: String::new(),
        }
    }
}

impl Settings {
    /// Loads settings from `path`, merging missing keys with defaults.
    ///
    /// Unreadable or unparseable files are backed up to
    /// `<path>.<epoch>.bak` and replaced with defaults. Out-of-range field
    /// values are reverted individually.
    pub fn load_or_default(path: &Path) -> Settings {
        if !path.exists() {
            return Settings::default();
        }

        let parsed = fs::read_to_string(path)
            .map_err(|e| e.to_string())
            .and_then(|content| {
                serde_json::from_str::<Settings>(&content).map_err(|e| e.to_string())
            });

        match parsed {
            Ok(mut settings) => {
                settings.validate();
                settings
            }
            Err(error) => {
                warn!("config file is invalid ({error}); backing up and writing defaults");
                back_up_config(path);
                let defaults = Settings::default();
                if let Err(save_error) = defaults.save(path) {
                    warn!("could not write default config: {save_error}");
                }
                defaults
            }
        }
    }

    pub fn load() -> Settings {
        Self::load_or_default(&paths::config_path())
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let serialized = serde_json::to_string_pretty(self)
            .map_err(|source| ConfigError::Serialize { source })?;
        fs::write(path, serialized).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Reverts individually invalid fields to their defaults.
    pub fn validate(&mut self) {
        let defaults = Settings::default();

        let (lo, hi) = MAX_CONCURRENT_RANGE;
        if !(lo..=hi).contains(&self.max_concurrent_downloads) {
            warn!(
                "invalid max_concurrent_downloads {}; reverting to {}",
                self.max_concurrent_downloads, defaults.max_concurrent_downloads
            );
            self.max_concurrent_downloads = defaults.max_concurrent_downloads;
        }

        if let Err(message) = validate_filename_template(&self.filename_template) {
            warn!(
                "invalid filename_template '{}' ({message}); reverting to default",
                self.filename_template
            );
            self.filename_template = defaults.filename_template;
        }

        if !self.last_output_path.is_dir() {
            self.last_output_path = defaults.last_output_path;
        }
    }

    /// Worker-pool size actually used, clamped to the supported range.
    pub fn effective_concurrency(&self) -> usize {
        let (lo, hi) = MAX_CONCURRENT_RANGE;
        self.max_concurrent_downloads.clamp(lo, hi) as usize
    }
}

/// A template is acceptable when it references the title or id of the item
/// and cannot escape the output directory.
pub fn validate_filename_template(template: &str) -> Result<(), String> {
    if template.is_empty() || !TEMPLATE_FIELD_RE.is_match(template) {
        return Err("must contain %(title) or %(id)".to_string());
    }
    if template.contains('/') || template.contains('\\') {
        return Err("must not contain path separators".to_string());
    }
    if template.contains("..") {
        return Err("must not contain '..'".to_string());
    }
    if Path::new(template).is_absolute() {
        return Err("must not be an absolute path".to_string());
    }
    Ok(())
}

fn back_up_config(path: &Path) {
    let epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let backup = PathBuf::from(format!("{}.{epoch}.bak", path.display()));
    if let Err(error) = fs::rename(path, &backup) {
        warn!("could not back up config to {:?}: {error}", backup);
    }
}
