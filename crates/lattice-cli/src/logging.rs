//! Logging setup using `tracing` + `tracing-subscriber`.
//!
//! Priority for determining the filter:
//! 1. `--log-level` CLI flag (if provided)
//! 2. `LATTICE_LOG` environment variable (e.g. "debug", "lattice_core=trace")
//! 3. default to `info`
//!
//! Logs go to STDERR so task output on stdout stays clean.

use anyhow::{anyhow, Result};
use clap::ValueEnum;
use tracing_subscriber::{fmt, EnvFilter};

pub const LOG_ENV: &str = "LATTICE_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

fn filter(cli_level: Option<LogLevel>, env: Option<&str>) -> EnvFilter {
    match (cli_level, env) {
        (Some(level), _) => EnvFilter::new(level.as_str()),
        (None, Some(directives)) => EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new("info")),
        (None, None) => EnvFilter::new("info"),
    }
}

/// Initialise the global subscriber. Call once at startup.
pub fn init_logging(cli_level: Option<LogLevel>) -> Result<()> {
    let env = std::env::var(LOG_ENV).ok();
    fmt()
        .with_env_filter(filter(cli_level, env.as_deref()))
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!("failed to initialise logging: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_flag_wins_over_env() {
        assert_eq!(filter(Some(LogLevel::Debug), Some("trace")).to_string(), "debug");
    }

    #[test]
    fn test_env_then_default() {
        assert_eq!(filter(None, Some("lattice_core=trace")).to_string(), "lattice_core=trace");
        assert_eq!(filter(None, None).to_string(), "info");
    }
}
