//! Circuit breaker guarding one DICOM source.

use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use super::SourceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
	Closed,
	Open,
	HalfOpen,
}

#[derive(Debug)]
enum Inner {
	Closed { consecutive_failures: u32 },
	Open { since: Instant },
	HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
	inner: Mutex<Inner>,
	failure_threshold: u32,
	reset_after: Duration,
}

impl CircuitBreaker {
	pub const fn new(failure_threshold: u32, reset_after: Duration) -> Self {
		Self {
			inner: Mutex::new(Inner::Closed {
				consecutive_failures: 0,
			}),
			failure_threshold,
			reset_after,
		}
	}

	pub fn state(&self) -> CircuitState {
		match *self.inner.lock().unwrap() {
			Inner::Closed { .. } => CircuitState::Closed,
			Inner::Open { .. } => CircuitState::Open,
			Inner::HalfOpen => CircuitState::HalfOpen,
		}
	}

	/// Fails fast while the circuit is open. After the reset interval one
	/// probe request is let through (half-open).
	/// # Errors
	/// Returns [`SourceError::CircuitOpen`] while requests must not be
	/// attempted.
	pub fn check(&self) -> Result<(), SourceError> {
		let mut inner = self.inner.lock().unwrap();
		match *inner {
			Inner::Closed { .. } | Inner::HalfOpen => Ok(()),
			Inner::Open { since } => {
				if since.elapsed() >= self.reset_after {
					info!("Circuit half-open, allowing a probe request");
					*inner = Inner::HalfOpen;
					Ok(())
				} else {
					Err(SourceError::CircuitOpen)
				}
			}
		}
	}

	pub fn record_success(&self) {
		let mut inner = self.inner.lock().unwrap();
		if matches!(*inner, Inner::HalfOpen) {
			info!("Circuit closed again after successful probe");
		}
		*inner = Inner::Closed {
			consecutive_failures: 0,
		};
	}

	pub fn record_failure(&self) {
		let mut inner = self.inner.lock().unwrap();
		match *inner {
			Inner::Closed {
				consecutive_failures,
			} => {
				let consecutive_failures = consecutive_failures + 1;
				if consecutive_failures >= self.failure_threshold {
					warn!(
						failures = consecutive_failures,
						"Circuit opened after consecutive failures"
					);
					*inner = Inner::Open {
						since: Instant::now(),
					};
				} else {
					*inner = Inner::Closed {
						consecutive_failures,
					};
				}
			}
			Inner::HalfOpen => {
				warn!("Probe request failed, circuit re-opened");
				*inner = Inner::Open {
					since: Instant::now(),
				};
			}
			Inner::Open { .. } => {}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test(start_paused = true)]
	async fn opens_after_threshold_and_recovers() {
		let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
		assert_eq!(breaker.state(), CircuitState::Closed);

		breaker.record_failure();
		breaker.record_failure();
		assert!(breaker.check().is_ok());

		breaker.record_failure();
		assert_eq!(breaker.state(), CircuitState::Open);
		assert!(breaker.check().is_err());

		// Probe is allowed once the reset interval elapsed.
		tokio::time::advance(Duration::from_secs(61)).await;
		assert!(breaker.check().is_ok());
		assert_eq!(breaker.state(), CircuitState::HalfOpen);

		breaker.record_success();
		assert_eq!(breaker.state(), CircuitState::Closed);
	}

	#[tokio::test(start_paused = true)]
	async fn failed_probe_reopens() {
		let breaker = CircuitBreaker::new(1, Duration::from_secs(10));
		breaker.record_failure();
		assert_eq!(breaker.state(), CircuitState::Open);

		tokio::time::advance(Duration::from_secs(11)).await;
		assert!(breaker.check().is_ok());
		breaker.record_failure();
		assert_eq!(breaker.state(), CircuitState::Open);
		assert!(breaker.check().is_err());
	}

	#[test]
	fn success_resets_failure_count() {
		let breaker = CircuitBreaker::new(2, Duration::from_secs(10));
		breaker.record_failure();
		breaker.record_success();
		breaker.record_failure();
		assert_eq!(breaker.state(), CircuitState::Closed);
	}
}
