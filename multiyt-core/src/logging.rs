use std::io;
use std::path::PathBuf;

use chrono::{DateTime, Local};
use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::{fmt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogLevel;
use crate::paths;

const LATEST_LOG: &str = "latest.log";

pub struct LogManager {
    _guard: Option<tracing_appender::non_blocking::WorkerGuard>,
    level: Level,
    log_dir: PathBuf,
}

impl LogManager {
    pub fn builder() -> LogManagerBuilder {
        LogManagerBuilder::default()
    }

    pub fn level(&self) -> Level {
        self.level
    }

    pub fn log_dir(&self) -> &PathBuf {
        &self.log_dir
    }
}

pub struct LogManagerBuilder {
    level: Level,
    enable_file: bool,
    log_dir: PathBuf,
    enable_stdout: bool,
}

impl Default for LogManagerBuilder {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            enable_file: true,
            log_dir: paths::log_dir(),
            enable_stdout: true,
        }
    }
}

impl LogManagerBuilder {
    pub fn with_level(mut self, level: &LogLevel) -> Self {
        self.level = level.as_tracing_level();
        self
    }

    pub fn level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn log_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.log_dir = path.into();
        self
    }

    pub fn enable_file(mut self, enable: bool) -> Self {
        self.enable_file = enable;
        self
    }

    pub fn enable_stdout(mut self, enable: bool) -> Self {
        self.enable_stdout = enable;
        self
    }

    pub fn build(self) -> io::Result<LogManager> {
        if self.enable_file {
            std::fs::create_dir_all(&self.log_dir)?;
            rotate_previous_log(&self.log_dir);
        }

        let level_filter = EnvFilter::from_default_env().add_directive(self.level.into());

        let (file_writer, file_guard) = if self.enable_file {
            let file_appender = tracing_appender::rolling::never(&self.log_dir, LATEST_LOG);
            tracing_appender::non_blocking(file_appender)
        } else {
            tracing_appender::non_blocking(io::sink())
        };

        let file_layer = fmt::layer()
            .with_writer(file_writer)
            .with_ansi(false)
            .with_filter(if self.enable_file {
                LevelFilter::TRACE
            } else {
                LevelFilter::OFF
            });

        let stdout_layer = fmt::layer()
            .with_target(true)
            .with_filter(if self.enable_stdout {
                LevelFilter::TRACE
            } else {
                LevelFilter::OFF
            });

        tracing_subscriber::registry()
            .with(level_filter)
            .with(file_layer)
            .with(stdout_layer)
            .init();

        Ok(LogManager {
            _guard: if self.enable_file {
                Some(file_guard)
            } else {
                None
            },
            level: self.level,
            log_dir: self.log_dir,
        })
    }
}

/// Archives the previous run's `latest.log` under a name derived from its
/// modification time, so every run starts a fresh file.
fn rotate_previous_log(log_dir: &std::path::Path) {
    let latest = log_dir.join(LATEST_LOG);
    if !latest.exists() {
        return;
    }
    let stamp = std::fs::metadata(&latest)
        .and_then(|meta| meta.modified())
        .map(|mtime| {
            let local: DateTime<Local> = mtime.into();
            local.format("%Y-%m-%d_%H-%M-%S").to_string()
        });
    match stamp {
        Ok(stamp) => {
            let archive = log_dir.join(format!("{stamp}.log"));
            if let Err(error) = std::fs::rename(&latest, &archive) {
                eprintln!("error rotating log file: {error}");
            }
        }
        Err(error) => eprintln!("error reading log file mtime: {error}"),
    }
}
