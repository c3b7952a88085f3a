// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// Structured logging via tracing-subscriber:
// - pretty / compact / JSON output
// - RUST_LOG overrides the configured level
// - per-component targets (dbintel::correlator, dbintel::breaker, ...)
// ============================================================================

use std::time::Instant;

use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{PipelineError, PipelineResult};

// ----------------------------------------------------------------------------
// 6.1 Logger Initialization
// ----------------------------------------------------------------------------

/// Parse a level name, falling back to INFO for anything unrecognised
pub fn parse_level(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        "off" => LevelFilter::OFF,
        _ => LevelFilter::INFO,
    }
}

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> PipelineResult<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(parse_level(&config.level).into())
        .from_env_lossy();

    let installed = match config.format {
        LogFormat::Json => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true)
                    .with_writer(std::io::stderr),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
        LogFormat::Compact => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_writer(std::io::stderr),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
        LogFormat::Pretty => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true)
                    .with_writer(std::io::stderr),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
    };
    installed.map_err(|e| PipelineError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "dbintel::init",
        level = %config.level,
        format = ?config.format,
        "Logging initialized"
    );

    Ok(())
}

// ----------------------------------------------------------------------------
// 6.2 Performance Timing
// ----------------------------------------------------------------------------

/// Times an operation and warns when it runs past its threshold.
#[derive(Debug)]
pub struct PerfTimer {
    name: &'static str,
    start: Instant,
    threshold_ms: Option<u64>,
}

impl PerfTimer {
    /// Start a new timer
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
            threshold_ms: None,
        }
    }

    /// Start a timer with a warning threshold
    pub fn with_threshold(name: &'static str, threshold_ms: u64) -> Self {
        Self {
            name,
            start: Instant::now(),
            threshold_ms: Some(threshold_ms),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Stop the timer and log if above threshold
    pub fn stop(self) -> u64 {
        let elapsed = self.elapsed_ms();

        if let Some(threshold) = self.threshold_ms {
            if elapsed > threshold {
                warn!(
                    target: "dbintel::perf",
                    operation = self.name,
                    elapsed_ms = elapsed,
                    threshold_ms = threshold,
                    "Operation exceeded threshold"
                );
            }
        }

        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("DEBUG"), LevelFilter::DEBUG);
        assert_eq!(parse_level("warning"), LevelFilter::WARN);
        assert_eq!(parse_level("nonsense"), LevelFilter::INFO);
    }

    #[test]
    fn test_perf_timer_reports_elapsed() {
        let timer = PerfTimer::with_threshold("noop", 10_000);
        assert!(timer.stop() < 10_000);
    }
}
