//! Log output for the agent
//!
//! Console events go to stderr so stdout stays clean for `config show` and
//! `version`. An optional daily-rotated file receives the same events.
//! `RUST_LOG` replaces the configured base level when set.

use std::fs;
use std::path::Path;

use tracing::Level;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::config::LoggingSettings;
use crate::error::{Error, Result};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Dependencies that are only interesting when they fail
const QUIET_DEPENDENCIES: &[&str] = &[
    "hyper=warn",
    "reqwest=warn",
    "rustls=warn",
    "tokio_tungstenite=warn",
    "tungstenite=warn",
];

/// Flushes the file writer when dropped; hold it until exit
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Install the subscriber for `hydra-agent run`
pub fn init_logging(settings: &LoggingSettings, verbose: u8, quiet: bool) -> Result<LogGuard> {
    let level = effective_level(&settings.level, verbose, quiet);

    let mut layers = vec![format_layer(std::io::stderr, settings.json_format, true)];
    let mut file_guard = None;

    if let Some(file) = settings.file.as_deref().filter(|f| !f.is_empty()) {
        let (writer, guard) = rolling_writer(Path::new(file), settings.max_files)?;
        layers.push(format_layer(writer, settings.json_format, false));
        file_guard = Some(guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter(level)?)
        .try_init()
        .map_err(|e| Error::Internal(format!("Failed to initialize logging: {}", e)))?;

    tracing::debug!(%level, file = ?settings.file, json = settings.json_format, "Logging ready");

    Ok(LogGuard { _file: file_guard })
}

/// Stderr-only logging for the short-lived `config` commands
pub fn init_for_command(level: Level) -> Result<()> {
    tracing_subscriber::registry()
        .with(format_layer(std::io::stderr, false, true))
        .with(env_filter(level)?)
        .try_init()
        .map_err(|e| Error::Internal(format!("Failed to initialize logging: {}", e)))
}

/// `--quiet` wins over `-v`; otherwise each `-v` steps past the configured level
fn effective_level(configured: &str, verbose: u8, quiet: bool) -> Level {
    if quiet {
        return Level::ERROR;
    }
    match verbose {
        0 => configured.parse().unwrap_or(Level::INFO),
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

fn env_filter(level: Level) -> Result<EnvFilter> {
    let base = level.to_string().to_lowercase();
    let parse = |directive: &str| -> Result<Directive> {
        directive
            .parse()
            .map_err(|e| Error::Internal(format!("Invalid log directive '{}': {}", directive, e)))
    };

    let mut filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&base))
        .add_directive(parse(&format!("hydra_agent={}", base))?);
    for directive in QUIET_DEPENDENCIES {
        filter = filter.add_directive(parse(directive)?);
    }
    Ok(filter)
}

fn format_layer<W>(writer: W, json: bool, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer().with_writer(writer).with_ansi(ansi && !json);
    match (json, ansi) {
        (true, _) => layer
            .json()
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        (false, true) => layer.with_target(false).compact().boxed(),
        (false, false) => layer.boxed(),
    }
}

/// Daily-rotated appender named after the configured file's stem
fn rolling_writer(path: &Path, max_files: u32) -> Result<(NonBlocking, WorkerGuard)> {
    let directory = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    fs::create_dir_all(directory).map_err(|e| Error::WriteFile {
        path: directory.to_path_buf(),
        source: e,
    })?;

    let prefix = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("hydra-agent");

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .filename_suffix("log")
        .max_log_files(max_files.max(1) as usize)
        .build(directory)
        .map_err(|e| {
            Error::Internal(format!(
                "Failed to open log file in {}: {}",
                directory.display(),
                e
            ))
        })?;

    Ok(tracing_appender::non_blocking(appender))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_effective_level() {
        assert_eq!(effective_level("info", 0, true), Level::ERROR);
        assert_eq!(effective_level("info", 3, true), Level::ERROR);
        assert_eq!(effective_level("warn", 0, false), Level::WARN);
        assert_eq!(effective_level("DEBUG", 0, false), Level::DEBUG);
        assert_eq!(effective_level("info", 1, false), Level::DEBUG);
        assert_eq!(effective_level("info", 2, false), Level::TRACE);
        assert_eq!(effective_level("loud", 0, false), Level::INFO);
    }

    #[test]
    fn test_env_filter_builds_for_every_level() {
        for level in [Level::ERROR, Level::WARN, Level::INFO, Level::DEBUG, Level::TRACE] {
            assert!(env_filter(level).is_ok());
        }
    }

    #[test]
    fn test_rolling_writer_creates_directory() {
        let temp_dir = TempDir::new().unwrap();
        let log_path = temp_dir.path().join("logs").join("agent.log");

        let (_writer, _guard) = rolling_writer(&log_path, 3).unwrap();
        assert!(temp_dir.path().join("logs").is_dir());
    }
}
