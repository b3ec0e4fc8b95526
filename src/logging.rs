//! Logging setup shared by the host, workers and one-shot commands.
//!
//! Logs always go to stderr so stdout carries only results. A file sink can
//! be added on top.
//!
//! # Environment Variables
//!
//! - `SHMTASK_LOG` - Log filter (overrides RUST_LOG)
//! - `SHMTASK_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `SHMTASK_LOG_FORMAT` - Output format: pretty, compact, json
//! - `SHMTASK_LOG_FILE` - Path to log file (in addition to stderr)
//! - `RUST_LOG` - Standard Rust log filter (fallback)
//!
//! Worker processes inherit the host's environment, so these apply to them
//! as well.
//!
//! # Example
//!
//! ```no_run
//! use shmtask::logging::{LogConfig, init};
//!
//! init(LogConfig::for_host().with_env_overrides());
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, MakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line human-readable output
    Pretty,
    /// Single-line output
    #[default]
    Compact,
    /// JSON lines for log aggregation
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Compact => write!(f, "compact"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Rotation of the log file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogRotation {
    Hourly,
    Daily,
    /// One file that grows forever
    #[default]
    Never,
}

impl FromStr for LogRotation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "never" => Ok(Self::Never),
            _ => Err(format!(
                "Unknown log rotation: '{}'. Valid options: hourly, daily, never",
                s
            )),
        }
    }
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base level, used when no filter is set
    pub level: Level,
    pub format: LogFormat,
    /// Extra log file next to stderr
    pub file_path: Option<PathBuf>,
    pub rotation: LogRotation,
    /// `EnvFilter` directives, overriding `level`
    pub filter: Option<String>,
    pub show_target: bool,
    /// Thread names tell the reaper and thread workers apart
    pub show_thread_names: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::WARN,
            format: LogFormat::Compact,
            file_path: None,
            rotation: LogRotation::Never,
            filter: None,
            show_target: false,
            show_thread_names: false,
        }
    }
}

impl LogConfig {
    /// One-shot commands: warnings and errors only.
    pub fn for_cli() -> Self {
        Self::default()
    }

    /// Long-running host (`serve`): lifecycle events at INFO.
    pub fn for_host() -> Self {
        Self {
            level: Level::INFO,
            show_thread_names: true,
            ..Self::default()
        }
    }

    /// Worker subprocesses. Quiet unless the environment asks for more.
    pub fn for_worker() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    pub fn with_rotation(mut self, rotation: LogRotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_filter(mut self, filter: String) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Apply environment variable overrides.
    ///
    /// A filter already set from the command line wins over `SHMTASK_LOG`,
    /// `RUST_LOG` and `SHMTASK_LOG_LEVEL`.
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            if let Ok(filter) = std::env::var("SHMTASK_LOG") {
                self.filter = Some(filter);
            } else if let Ok(filter) = std::env::var("RUST_LOG") {
                self.filter = Some(filter);
            }
        }

        if self.filter.is_none()
            && let Ok(level_str) = std::env::var("SHMTASK_LOG_LEVEL")
        {
            self.level = parse_level(&level_str).unwrap_or(self.level);
        }

        if let Ok(format) = std::env::var("SHMTASK_LOG_FORMAT")
            && let Ok(f) = format.parse()
        {
            self.format = f;
        }

        if let Ok(path) = std::env::var("SHMTASK_LOG_FILE")
            && !path.is_empty()
        {
            self.file_path = Some(PathBuf::from(path));
        }

        self
    }

    fn build_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(self.level.to_string().to_lowercase());
        match &self.filter {
            Some(filter) => EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: Invalid log filter '{}', using default", filter);
                fallback()
            }),
            None => fallback(),
        }
    }

    /// One formatting layer for `writer` in the configured format.
    fn layer<W>(&self, writer: W, ansi: bool) -> Box<dyn Layer<Registry> + Send + Sync>
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(ansi)
            .with_target(self.show_target)
            .with_thread_names(self.show_thread_names);
        match self.format {
            LogFormat::Json => layer.json().boxed(),
            LogFormat::Compact => layer.compact().boxed(),
            LogFormat::Pretty => layer.pretty().boxed(),
        }
    }
}

/// Parse a log level string.
fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

fn file_appender(path: &Path, rotation: LogRotation) -> RollingFileAppender {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("shmtask.log");
    RollingFileAppender::new(rotation.into(), parent, file_name)
}

/// Initialize the global tracing subscriber.
///
/// Call once at startup. Later calls are silently ignored.
pub fn init(config: LogConfig) {
    let mut layers = vec![config.layer(std::io::stderr, true)];
    if let Some(path) = &config.file_path {
        layers.push(config.layer(file_appender(path, config.rotation), false));
    }

    let _ = tracing_subscriber::registry()
        .with(layers)
        .with(config.build_filter())
        .try_init();
}
