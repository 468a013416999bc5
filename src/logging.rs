//! Log output for the bridge binary. Console logs go to stderr so stdout
//! carries nothing but configuration URLs and dumped options.

use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const LOG_PREFIX: &str = "nadir-bridge";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RotationPeriod {
    Hourly,
    #[default]
    Daily,
    Never,
}

impl std::str::FromStr for RotationPeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hourly" | "hour" => Ok(RotationPeriod::Hourly),
            "daily" | "day" => Ok(RotationPeriod::Daily),
            "never" | "none" => Ok(RotationPeriod::Never),
            _ => Err(format!(
                "Invalid rotation period '{s}'. Valid options: hourly, daily, never"
            )),
        }
    }
}

impl From<RotationPeriod> for Rotation {
    fn from(period: RotationPeriod) -> Self {
        match period {
            RotationPeriod::Hourly => Rotation::HOURLY,
            RotationPeriod::Daily => Rotation::DAILY,
            RotationPeriod::Never => Rotation::NEVER,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub log_dir: PathBuf,
    pub rotation: RotationPeriod,
    /// Rotated files the appender keeps; older ones are deleted on rotation.
    pub max_log_files: usize,
}

impl LogConfig {
    pub fn new(log_dir: impl Into<PathBuf>, rotation: RotationPeriod) -> Self {
        Self {
            log_dir: log_dir.into(),
            rotation,
            max_log_files: 7,
        }
    }

    fn appender(&self) -> std::io::Result<RollingFileAppender> {
        RollingFileAppender::builder()
            .rotation(self.rotation.into())
            .filename_prefix(LOG_PREFIX)
            .filename_suffix("log")
            .max_log_files(self.max_log_files)
            .build(&self.log_dir)
            .map_err(std::io::Error::other)
    }
}

/// Keep alive until exit; dropping it flushes buffered file output.
pub struct LogGuard(Option<WorkerGuard>);

/// Logs to stderr, filtered by `RUST_LOG`.
pub fn setup_console_logging() -> LogGuard {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    LogGuard(None)
}

/// Logs to `<log_dir>/nadir-bridge.<date>.log`.
pub fn setup_file_logging(config: &LogConfig) -> std::io::Result<LogGuard> {
    let (non_blocking, guard) = tracing_appender::non_blocking(config.appender()?);

    let file_layer = Layer::default()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(file_layer)
        .init();

    Ok(LogGuard(Some(guard)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_rotation_period_from_str() {
        assert_eq!(
            "daily".parse::<RotationPeriod>().unwrap(),
            RotationPeriod::Daily
        );
        assert_eq!(
            "Hour".parse::<RotationPeriod>().unwrap(),
            RotationPeriod::Hourly
        );
        assert_eq!(
            "NEVER".parse::<RotationPeriod>().unwrap(),
            RotationPeriod::Never
        );
        assert!("weekly".parse::<RotationPeriod>().is_err());
    }

    #[test]
    fn test_appender_creates_log_dir() {
        let temp_dir = TempDir::new().unwrap();
        let config = LogConfig::new(temp_dir.path().join("logs"), RotationPeriod::Never);

        config.appender().unwrap();

        let names: Vec<String> = std::fs::read_dir(&config.log_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().map(String::from))
            .collect();
        assert_eq!(names, ["nadir-bridge.log"]);
    }
}
