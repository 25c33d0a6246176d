//! Tracing setup for the `ferry` binary.
//!
//! Human-readable output by default, JSON lines with `--json`. `RUST_LOG`
//! replaces the computed filter entirely.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::Level;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};

#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    pub json: bool,
    /// Log at DEBUG instead of INFO.
    pub verbose: bool,
}

/// The filter used when `RUST_LOG` is not set.
pub fn default_directive(verbose: bool) -> String {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    format!("ferry={}", level.as_str().to_lowercase())
}

/// Install the global subscriber. Fails if one is already installed.
///
/// JSON output flattens event fields and closes the `transfer` span with its
/// timing, so one transfer ends with a single line carrying its duration.
pub fn init(config: LogConfig) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(config.verbose)));

    let output = if config.json {
        fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
            .with_span_events(FmtSpan::CLOSE)
            .boxed()
    } else {
        fmt::layer()
            .compact()
            .with_target(false)
            .with_file(false)
            .with_line_number(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(output)
        .try_init()
}

struct ThrottleState {
    last_at: Option<Instant>,
    last_percentage: u8,
}

/// Decides which progress samples are worth a log line.
///
/// A sample passes when it is the first one, when `interval` has elapsed since
/// the last logged sample, or when the percentage moved by at least `step`.
/// Reaching 100% always passes once.
pub struct ProgressThrottle {
    interval: Duration,
    step: u8,
    state: Mutex<ThrottleState>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration, step: u8) -> Self {
        Self {
            interval,
            step: step.max(1),
            state: Mutex::new(ThrottleState {
                last_at: None,
                last_percentage: 0,
            }),
        }
    }

    pub fn should_report(&self, percentage: u8) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let due = match state.last_at {
            None => true,
            Some(_) if percentage >= 100 => state.last_percentage < 100,
            Some(at) => {
                at.elapsed() >= self.interval
                    || percentage.saturating_sub(state.last_percentage) >= self.step
            }
        };
        if due {
            state.last_at = Some(Instant::now());
            state.last_percentage = percentage;
        }
        due
    }

    /// Forget the last sample so the next one is logged.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.last_at = None;
        state.last_percentage = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directive_tracks_verbosity() {
        assert_eq!(default_directive(false), "ferry=info");
        assert_eq!(default_directive(true), "ferry=debug");
    }

    #[test]
    fn first_sample_is_reported() {
        let throttle = ProgressThrottle::new(Duration::from_secs(60), 10);
        assert!(throttle.should_report(0));
        assert!(!throttle.should_report(3));
    }

    #[test]
    fn large_jumps_pass_before_the_interval() {
        let throttle = ProgressThrottle::new(Duration::from_secs(60), 10);
        assert!(throttle.should_report(5));
        assert!(!throttle.should_report(14));
        assert!(throttle.should_report(15));
    }

    #[test]
    fn completion_is_reported_once() {
        let throttle = ProgressThrottle::new(Duration::from_secs(60), 50);
        assert!(throttle.should_report(90));
        assert!(throttle.should_report(100));
        assert!(!throttle.should_report(100));
    }

    #[test]
    fn reset_allows_the_next_sample() {
        let throttle = ProgressThrottle::new(Duration::from_secs(60), 10);
        assert!(throttle.should_report(40));
        assert!(!throttle.should_report(41));
        throttle.reset();
        assert!(throttle.should_report(41));
    }

    #[test]
    fn zero_interval_never_blocks() {
        let throttle = ProgressThrottle::new(Duration::ZERO, 100);
        assert!(throttle.should_report(1));
        assert!(throttle.should_report(2));
    }
}
