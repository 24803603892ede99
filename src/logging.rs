// ============================================================================
// LOGGING & TIMING
// ============================================================================

use std::time::Instant;

use tracing::level_filters::LevelFilter;
use tracing::{info, trace, warn};
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{ArchstatsError, ArchstatsResult};

/// Map a configured level name to a filter; unknown names mean `info`.
pub fn level_filter(level: &str) -> LevelFilter {
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

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
pub fn init_logging(config: &LoggingConfig) -> ArchstatsResult<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter(&config.level).into())
        .from_env_lossy();

    let installed = match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
        "compact" => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().compact().with_ansi(config.colors).with_target(true));
            tracing::subscriber::set_global_default(subscriber)
        }
        _ => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
    };
    installed.map_err(|e| ArchstatsError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "archstats::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );
    Ok(())
}

/// Measures one pass or group update and warns past a threshold.
#[derive(Debug)]
pub struct PassTimer {
    name: String,
    start: Instant,
    threshold_ms: Option<u64>,
}

impl PassTimer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start: Instant::now(),
            threshold_ms: None,
        }
    }

    pub fn with_threshold(name: impl Into<String>, threshold_ms: u64) -> Self {
        Self {
            threshold_ms: Some(threshold_ms),
            ..Self::new(name)
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Stop the timer, logging if it ran past the threshold.
    pub fn stop(self) -> u64 {
        let elapsed = self.elapsed_ms();
        match self.threshold_ms {
            Some(threshold) if elapsed > threshold => warn!(
                target: "archstats::perf",
                operation = %self.name,
                elapsed_ms = elapsed,
                threshold_ms = threshold,
                "Operation exceeded threshold"
            ),
            _ => trace!(
                target: "archstats::perf",
                operation = %self.name,
                elapsed_ms = elapsed,
                "Operation completed"
            ),
        }
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_filter() {
        assert_eq!(level_filter("DEBUG"), LevelFilter::DEBUG);
        assert_eq!(level_filter("warning"), LevelFilter::WARN);
        assert_eq!(level_filter("nonsense"), LevelFilter::INFO);
    }

    #[test]
    fn test_timer_reports_elapsed() {
        let timer = PassTimer::with_threshold("pass", 0);
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(timer.stop() >= 2);
    }
}
