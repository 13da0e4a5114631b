//! Logging and tracing initialization for the airbridge daemon.
//!
//! Structured logging via the `tracing` ecosystem, with either compact console
//! output (journald friendly) or JSON output for machine parsing.

use std::cell::Cell;
use std::time::Duration;

use tokio::time::Instant;
use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::LogSettings;

/// Configuration for the logging system.
#[derive(Default)]
pub struct LogConfig {
    /// Output logs as JSON (for machine parsing)
    pub json: bool,
    /// Enable verbose logging (sets default level to DEBUG)
    pub verbose: bool,
}

impl From<&LogSettings> for LogConfig {
    fn from(settings: &LogSettings) -> Self {
        Self {
            json: settings.json,
            verbose: settings.verbose,
        }
    }
}

/// Initialize the tracing subscriber with the given configuration.
///
/// Call once, after config is loaded. `RUST_LOG` overrides the level.
pub fn init(config: LogConfig) {
    let default_level = if config.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "airbridge={}",
            default_level.as_str().to_lowercase()
        ))
    });

    if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true),
            )
            .init();
    } else {
        // systemd adds its own timestamps
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .without_time()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .init();
    }
}

/// A rate limiter for throttling log messages.
///
/// Used for per-chunk upload progress, which would otherwise flood the
/// journal on slow links. Runs on the tokio clock.
pub struct LogThrottle {
    interval: Duration,
    last_log: Cell<Option<Instant>>,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_log: Cell::new(None),
        }
    }

    /// Returns true if enough time has passed since the last log.
    pub fn should_log(&self) -> bool {
        let now = Instant::now();
        match self.last_log.get() {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last_log.set(Some(now));
                true
            }
        }
    }

    /// Allow the next log immediately.
    pub fn reset(&self) {
        self.last_log.set(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_allows_first_log() {
        let throttle = LogThrottle::new(Duration::from_secs(1));
        assert!(throttle.should_log());
    }

    #[test]
    fn throttle_blocks_immediate_second_log() {
        let throttle = LogThrottle::new(Duration::from_secs(1));
        assert!(throttle.should_log());
        assert!(!throttle.should_log());
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_follows_tokio_clock() {
        let throttle = LogThrottle::new(Duration::from_secs(10));
        assert!(throttle.should_log());
        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(!throttle.should_log());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(throttle.should_log());
    }

    #[test]
    fn throttle_reset_allows_log() {
        let throttle = LogThrottle::new(Duration::from_secs(100));
        assert!(throttle.should_log());
        assert!(!throttle.should_log());
        throttle.reset();
        assert!(throttle.should_log());
    }

    #[test]
    fn log_config_follows_settings() {
        let config = LogConfig::from(&LogSettings {
            json: true,
            verbose: false,
        });
        assert!(config.json);
        assert!(!config.verbose);
    }
}
