//! Unified logging module for ventsrv
//!
//! Console output plus an optional daily rolling file, both using the same
//! bracketed-level line format.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{
        self,
        format::{FmtSpan, Writer},
        FmtContext, FormatEvent, FormatFields,
    },
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Environment variable overriding the log root directory
pub const LOG_DIR_ENV: &str = "VENTSRV_LOG_DIR";

/// Custom format for log level with brackets: `[INFO]`, `[WARN]`, etc.
fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// Event formatter that outputs: `timestamp [LEVEL] message`
///
/// Example output: `2025-12-02T00:50:44.809000Z [INFO] Device eair-1 connected`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m",
                Level::DEBUG => "\x1b[34m",
                Level::INFO => "\x1b[32m",
                Level::WARN => "\x1b[33m",
                Level::ERROR => "\x1b[31m",
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

// Global guards for keeping the non-blocking file writer alive
static GUARDS: OnceLock<Arc<Mutex<Vec<WorkerGuard>>>> = OnceLock::new();

/// Global log root directory (initialized once from config or env)
static LOG_ROOT: OnceLock<PathBuf> = OnceLock::new();

/// Initialize log root directory
///
/// Priority:
/// 1. `VENTSRV_LOG_DIR` environment variable (highest)
/// 2. `config_dir` parameter (from the YAML config)
/// 3. Default value "logs" (lowest)
pub fn init_log_root(config_dir: Option<&str>) {
    LOG_ROOT.get_or_init(|| {
        std::env::var(LOG_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                config_dir
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("logs"))
            })
    });
}

/// Get log root directory
///
/// Falls back to the environment or "logs" when `init_log_root` was never
/// called. Test binaries log into the system temp dir instead.
pub fn get_log_root() -> PathBuf {
    LOG_ROOT.get().cloned().unwrap_or_else(|| {
        std::env::var(LOG_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                if is_test_environment() {
                    std::env::temp_dir().join("ventsrv-test-logs")
                } else {
                    PathBuf::from("logs")
                }
            })
    })
}

fn is_test_environment() -> bool {
    if std::env::var("CARGO_TARGET_TMPDIR").is_ok() {
        return true;
    }

    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.to_str().map(|s| s.contains("target/debug/deps")))
        .unwrap_or(false)
}

/// Logging section of the service configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset (e.g. "info", "ventsrv=debug")
    #[serde(default = "default_level")]
    pub level: String,

    /// Log root directory
    #[serde(default = "default_dir")]
    pub dir: String,

    /// Write to a daily rolling file in addition to the console
    #[serde(default = "default_true")]
    pub file: bool,

    /// JSON lines in the log file
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_dir() -> String {
    "logs".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            dir: default_dir(),
            file: true,
            json: false,
        }
    }
}

// Daily rolling file writer with naming format: {YYYYMMDD}_{service}.log
struct DailyRollingWriter {
    service_name: String,
    log_dir: PathBuf,
    state: Arc<Mutex<(String, Option<File>)>>,
}

impl DailyRollingWriter {
    fn new(service_name: String, log_dir: PathBuf) -> std::io::Result<Self> {
        fs::create_dir_all(&log_dir)?;

        let today = chrono::Local::now().format("%Y%m%d").to_string();
        let file = open_log_file(&log_dir, &today, &service_name)?;

        Ok(Self {
            service_name,
            log_dir,
            state: Arc::new(Mutex::new((today, Some(file)))),
        })
    }

    fn with_file<R>(
        &self,
        f: impl FnOnce(&mut File) -> std::io::Result<R>,
        empty: R,
    ) -> std::io::Result<R> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| std::io::Error::other(format!("Mutex poisoned: {}", e)))?;

        let today = chrono::Local::now().format("%Y%m%d").to_string();
        if state.0 != today {
            fs::create_dir_all(&self.log_dir)?;
            let file = open_log_file(&self.log_dir, &today, &self.service_name)?;
            *state = (today, Some(file));
        }

        match state.1.as_mut() {
            Some(file) => f(file),
            None => Ok(empty),
        }
    }
}

fn open_log_file(dir: &Path, date: &str, service: &str) -> std::io::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(format!("{}_{}.log", date, service)))
}

impl Write for DailyRollingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.with_file(|file| file.write(buf), 0)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.with_file(|file| file.flush(), ())
    }
}

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Service name, used as file suffix and default filter target
    pub service_name: String,
    /// Base directory for logs
    pub log_dir: PathBuf,
    /// Default filter directive when `RUST_LOG` is unset
    pub default_filter: String,
    /// Emit ANSI colors on the console
    pub ansi: bool,
    /// Enable the file layer
    pub enable_file: bool,
    /// Enable JSON format for the file layer
    pub enable_json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".to_string(),
            log_dir: get_log_root(),
            default_filter: "info".to_string(),
            ansi: true,
            enable_file: true,
            enable_json: false,
        }
    }
}

impl LogConfig {
    /// Build from the service name and the `logging` config section
    pub fn from_settings(service_name: &str, settings: &LoggingConfig) -> Self {
        init_log_root(Some(settings.dir.as_str()));
        Self {
            service_name: service_name.to_string(),
            log_dir: get_log_root().join(service_name),
            default_filter: settings.level.clone(),
            ansi: true,
            enable_file: settings.file,
            enable_json: settings.json,
        }
    }
}

/// Build the env filter, `RUST_LOG` wins over the configured default
fn build_filter(config: &LogConfig) -> EnvFilter {
    match std::env::var("RUST_LOG") {
        Ok(env_str) if !env_str.trim().is_empty() => EnvFilter::new(env_str),
        _ => EnvFilter::new(config.default_filter.as_str()),
    }
}

/// Initialize logging system with configuration
pub fn init_with_config(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let console_layer = fmt::layer()
        .with_ansi(config.ansi)
        .event_format(BracketedLevelFormat)
        .boxed();

    let file_layer = if config.enable_file {
        let writer = DailyRollingWriter::new(config.service_name.clone(), config.log_dir.clone())?;
        let (non_blocking, guard) = tracing_appender::non_blocking(writer);

        let guards = GUARDS.get_or_init(|| Arc::new(Mutex::new(Vec::new())));
        match guards.lock() {
            Ok(mut guards) => guards.push(guard),
            Err(poisoned) => poisoned.into_inner().push(guard),
        }

        let layer = if config.enable_json {
            fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_target(true)
                .with_span_events(FmtSpan::CLOSE)
                .boxed()
        } else {
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .event_format(BracketedLevelFormat)
                .boxed()
        };
        Some(layer)
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(build_filter(&config))
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::info!("Logging: {} @ {:?}", config.service_name, config.log_dir);

    Ok(())
}

/// Flush and drop file writer guards (call right before process exit)
pub fn flush() {
    if let Some(guards) = GUARDS.get() {
        if let Ok(mut guards) = guards.lock() {
            guards.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_config_defaults() {
        let cfg = LoggingConfig::default();
        assert_eq!(cfg.level, "info");
        assert_eq!(cfg.dir, "logs");
        assert!(cfg.file);
        assert!(!cfg.json);
    }

    #[test]
    fn test_daily_writer_creates_dated_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer =
            DailyRollingWriter::new("ventsrv".to_string(), dir.path().to_path_buf()).unwrap();
        writer.write_all(b"hello\n").unwrap();
        writer.flush().unwrap();

        let today = chrono::Local::now().format("%Y%m%d").to_string();
        let path = dir.path().join(format!("{}_ventsrv.log", today));
        let content = fs::read_to_string(path).unwrap();
        assert_eq!(content, "hello\n");
    }

    #[test]
    fn test_format_level() {
        assert_eq!(format_level(&Level::WARN), "[WARN]");
        assert_eq!(format_level(&Level::TRACE), "[TRACE]");
    }
}
