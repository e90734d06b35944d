//! Circuit breaker for group dispatch
//!
//! Three states with fast-fail semantics:
//!
//! - closed: calls flow, consecutive failures are counted
//! - open: all dispatches reject immediately, no backend traffic
//! - half-open: a single probe call is admitted after the reset timeout

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitMode {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// State transition observed by a caller, for event publishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitTransition {
    Opened,
    Reset,
}

#[derive(Debug)]
struct BreakerInner {
    mode: CircuitMode,
    failure_count: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Per-group circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            inner: Mutex::new(BreakerInner {
                mode: CircuitMode::Closed,
                failure_count: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Time-based transition: open -> half-open once the reset timeout elapses.
    /// Must hold the lock.
    fn advance(inner: &mut BreakerInner, reset_timeout: Duration) {
        if inner.mode == CircuitMode::Open {
            let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
            if elapsed >= reset_timeout {
                inner.mode = CircuitMode::HalfOpen;
                inner.probe_in_flight = false;
            }
        }
    }

    /// Ask permission to dispatch.
    ///
    /// Returns the remaining open time on rejection. In half-open, exactly one
    /// caller gets through as the probe; everyone else is rejected until the
    /// probe outcome is recorded.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut inner = self.inner.lock().expect("breaker poisoned");
        Self::advance(&mut inner, self.reset_timeout);

        match inner.mode {
            CircuitMode::Closed => Ok(()),
            CircuitMode::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                Err(self.reset_timeout.saturating_sub(elapsed))
            }
            CircuitMode::HalfOpen => {
                if inner.probe_in_flight {
                    Err(Duration::ZERO)
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Release an acquired slot without an outcome (dispatch aborted before
    /// reaching the backend).
    pub fn cancel_probe(&self) {
        let mut inner = self.inner.lock().expect("breaker poisoned");
        inner.probe_in_flight = false;
    }

    /// Record a successful call.
    pub fn record_success(&self) -> Option<CircuitTransition> {
        let mut inner = self.inner.lock().expect("breaker poisoned");
        match inner.mode {
            CircuitMode::Closed => {
                inner.failure_count = 0;
                None
            }
            CircuitMode::HalfOpen => {
                inner.mode = CircuitMode::Closed;
                inner.failure_count = 0;
                inner.opened_at = None;
                inner.probe_in_flight = false;
                Some(CircuitTransition::Reset)
            }
            CircuitMode::Open => None,
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) -> Option<CircuitTransition> {
        let mut inner = self.inner.lock().expect("breaker poisoned");
        match inner.mode {
            CircuitMode::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.failure_threshold {
                    inner.mode = CircuitMode::Open;
                    inner.opened_at = Some(Instant::now());
                    Some(CircuitTransition::Opened)
                } else {
                    None
                }
            }
            CircuitMode::HalfOpen => {
                // Failed probe re-opens and restarts the timer
                inner.mode = CircuitMode::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
                Some(CircuitTransition::Opened)
            }
            CircuitMode::Open => None,
        }
    }

    /// Current mode (applies the time-based transition first).
    pub fn mode(&self) -> CircuitMode {
        let mut inner = self.inner.lock().expect("breaker poisoned");
        Self::advance(&mut inner, self.reset_timeout);
        inner.mode
    }

    /// Consecutive failure count while closed.
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().expect("breaker poisoned").failure_count
    }

    pub fn is_open(&self) -> bool {
        self.mode() == CircuitMode::Open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(threshold, Duration::from_millis(reset_ms))
    }

    #[test]
    fn test_opens_at_threshold() {
        let cb = breaker(3, 1000);

        assert!(cb.try_acquire().is_ok());
        assert_eq!(cb.record_failure(), None);
        assert_eq!(cb.record_failure(), None);
        assert_eq!(cb.record_failure(), Some(CircuitTransition::Opened));
        assert!(cb.is_open());
        assert!(cb.try_acquire().is_err());
    }

    #[test]
    fn test_threshold_one_opens_on_first_failure() {
        let cb = breaker(1, 1000);
        assert_eq!(cb.record_failure(), Some(CircuitTransition::Opened));
    }

    #[test]
    fn test_success_resets_count() {
        let cb = breaker(3, 1000);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(cb.record_failure(), None);
    }

    #[tokio::test]
    async fn test_half_open_single_probe() {
        let cb = breaker(1, 20);
        cb.record_failure();
        assert!(cb.try_acquire().is_err());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cb.mode(), CircuitMode::HalfOpen);

        // Exactly one probe admitted
        assert!(cb.try_acquire().is_ok());
        assert!(cb.try_acquire().is_err());

        // Probe success closes the circuit
        assert_eq!(cb.record_success(), Some(CircuitTransition::Reset));
        assert_eq!(cb.mode(), CircuitMode::Closed);
    }

    #[tokio::test]
    async fn test_failed_probe_reopens() {
        let cb = breaker(1, 20);
        cb.record_failure();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(cb.try_acquire().is_ok());
        assert_eq!(cb.record_failure(), Some(CircuitTransition::Opened));
        assert!(cb.try_acquire().is_err());
    }

    #[tokio::test]
    async fn test_cancel_probe_releases_slot() {
        let cb = breaker(1, 20);
        cb.record_failure();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(cb.try_acquire().is_ok());
        cb.cancel_probe();
        assert!(cb.try_acquire().is_ok());
    }
}
