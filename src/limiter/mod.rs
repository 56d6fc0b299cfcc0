//! Token-bucket rate limiting and in-flight ceilings.
//!
//! The bucket governs *request initiation* against a DICOM source; the
//! semaphores govern *concurrent occupation*. A token is consumed when a
//! request starts and is never returned, so no token is held across a
//! long-lived transfer.

use crate::config::RateConfig;
use crate::types::SourceKind;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug)]
struct BucketState {
	tokens: f64,
	last_refill: Instant,
	rate: f64,
	burst: u32,
}

impl BucketState {
	fn refill(&mut self, now: Instant) {
		let elapsed = now.duration_since(self.last_refill).as_secs_f64();
		self.tokens = (self.tokens + elapsed * self.rate).min(f64::from(self.burst));
		self.last_refill = now;
	}
}

/// An async token bucket. `acquire` suspends until a token is available or
/// the cancellation signal fires.
#[derive(Debug)]
pub struct TokenBucket {
	state: Mutex<BucketState>,
}

impl TokenBucket {
	pub fn new(rate: f64, burst: u32) -> Self {
		Self {
			state: Mutex::new(BucketState {
				tokens: f64::from(burst),
				last_refill: Instant::now(),
				rate,
				burst,
			}),
		}
	}

	/// Swaps the refill parameters. Takes effect for the next acquisition.
	pub fn reload(&self, rate: f64, burst: u32) {
		let mut state = self.state.lock().unwrap();
		state.refill(Instant::now());
		state.rate = rate;
		state.burst = burst;
		state.tokens = state.tokens.min(f64::from(burst));
	}

	/// Consumes one token, waiting for the refill if the bucket is empty.
	/// # Errors
	/// Returns [`LimiterError::Cancelled`] if the signal fires first.
	pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), LimiterError> {
		loop {
			let wait = {
				let mut state = self.state.lock().unwrap();
				state.refill(Instant::now());
				if state.tokens >= 1.0 {
					state.tokens -= 1.0;
					return Ok(());
				}
				// Time until one full token has accumulated.
				Duration::from_secs_f64((1.0 - state.tokens) / state.rate)
			};

			tokio::select! {
				() = tokio::time::sleep(wait) => {}
				() = cancel.cancelled() => return Err(LimiterError::Cancelled),
			}
		}
	}

	fn try_acquire(&self) -> bool {
		let mut state = self.state.lock().unwrap();
		state.refill(Instant::now());
		if state.tokens >= 1.0 {
			state.tokens -= 1.0;
			true
		} else {
			false
		}
	}
}

struct SourceLimiter {
	bucket: TokenBucket,
	in_flight: Arc<Semaphore>,
	gauge: Arc<AtomicUsize>,
}

/// Held while a request occupies a source. Dropping it releases the
/// per-source slot.
pub struct SourcePermit {
	_permit: OwnedSemaphorePermit,
	gauge: Arc<AtomicUsize>,
}

impl Drop for SourcePermit {
	fn drop(&mut self) {
		self.gauge.fetch_sub(1, Ordering::SeqCst);
	}
}

/// Held while a message is being processed. Dropping it releases the global
/// slot.
pub struct MessagePermit {
	_permit: OwnedSemaphorePermit,
	gauge: Arc<AtomicUsize>,
}

impl Drop for MessagePermit {
	fn drop(&mut self) {
		self.gauge.fetch_sub(1, Ordering::SeqCst);
	}
}

pub struct RateLimiter {
	global: Arc<Semaphore>,
	global_gauge: Arc<AtomicUsize>,
	sources: HashMap<SourceKind, SourceLimiter>,
}

impl RateLimiter {
	pub fn new(global_ceiling: usize, rates: &[(SourceKind, RateConfig)]) -> Self {
		let sources = rates
			.iter()
			.map(|(kind, rate)| {
				(
					*kind,
					SourceLimiter {
						bucket: TokenBucket::new(rate.rate, rate.burst),
						in_flight: Arc::new(Semaphore::new(rate.max_in_flight)),
						gauge: Arc::new(AtomicUsize::new(0)),
					},
				)
			})
			.collect();

		Self {
			global: Arc::new(Semaphore::new(global_ceiling)),
			global_gauge: Arc::new(AtomicUsize::new(0)),
			sources,
		}
	}

	/// Claims a slot under the global in-flight ceiling.
	/// # Errors
	/// Returns [`LimiterError::Cancelled`] if the signal fires first.
	pub async fn message_permit(
		&self,
		cancel: &CancellationToken,
	) -> Result<MessagePermit, LimiterError> {
		let permit = tokio::select! {
			permit = Arc::clone(&self.global).acquire_owned() => {
				permit.map_err(|_| LimiterError::Closed)?
			}
			() = cancel.cancelled() => return Err(LimiterError::Cancelled),
		};
		self.global_gauge.fetch_add(1, Ordering::SeqCst);
		Ok(MessagePermit {
			_permit: permit,
			gauge: Arc::clone(&self.global_gauge),
		})
	}

	/// Waits for a rate token, then claims a per-source slot. The token is
	/// consumed; the returned permit only tracks occupation.
	/// # Errors
	/// Returns [`LimiterError::Cancelled`] if the signal fires first, or
	/// [`LimiterError::UnknownSource`] for an unconfigured source.
	pub async fn initiate(
		&self,
		source: SourceKind,
		cancel: &CancellationToken,
	) -> Result<SourcePermit, LimiterError> {
		let limiter = self
			.sources
			.get(&source)
			.ok_or(LimiterError::UnknownSource(source))?;

		limiter.bucket.acquire(cancel).await?;

		let permit = tokio::select! {
			permit = Arc::clone(&limiter.in_flight).acquire_owned() => {
				permit.map_err(|_| LimiterError::Closed)?
			}
			() = cancel.cancelled() => return Err(LimiterError::Cancelled),
		};
		limiter.gauge.fetch_add(1, Ordering::SeqCst);
		debug!(source = %source, in_flight = self.in_flight(source), "Initiated source request");

		Ok(SourcePermit {
			_permit: permit,
			gauge: Arc::clone(&limiter.gauge),
		})
	}

	/// Non-blocking variant of [`initiate`](Self::initiate) used by repair
	/// jobs that prefer to back off instead of queueing.
	pub fn try_initiate(&self, source: SourceKind) -> Option<SourcePermit> {
		let limiter = self.sources.get(&source)?;
		if !limiter.bucket.try_acquire() {
			return None;
		}
		let permit = Arc::clone(&limiter.in_flight).try_acquire_owned().ok()?;
		limiter.gauge.fetch_add(1, Ordering::SeqCst);
		Some(SourcePermit {
			_permit: permit,
			gauge: Arc::clone(&limiter.gauge),
		})
	}

	/// Swaps the rate parameters of one source at runtime.
	pub fn reload(&self, source: SourceKind, rate: &RateConfig) {
		if let Some(limiter) = self.sources.get(&source) {
			limiter.bucket.reload(rate.rate, rate.burst);
		}
	}

	pub fn in_flight(&self, source: SourceKind) -> usize {
		self.sources
			.get(&source)
			.map_or(0, |limiter| limiter.gauge.load(Ordering::SeqCst))
	}

	pub fn messages_in_flight(&self) -> usize {
		self.global_gauge.load(Ordering::SeqCst)
	}
}

#[derive(Debug, Error)]
pub enum LimiterError {
	#[error("Acquisition was cancelled")]
	Cancelled,
	#[error("Limiter is closed")]
	Closed,
	#[error("No limiter configured for source {0}")]
	UnknownSource(SourceKind),
}

#[cfg(test)]
mod tests {
	use super::*;

	fn rate(rate: f64, burst: u32, max_in_flight: usize) -> RateConfig {
		RateConfig {
			rate,
			burst,
			max_in_flight,
		}
	}

	#[tokio::test(start_paused = true)]
	async fn bucket_spaces_acquisitions_by_rate() {
		let bucket = TokenBucket::new(1.0, 1);
		let cancel = CancellationToken::new();

		let start = Instant::now();
		bucket.acquire(&cancel).await.unwrap();
		bucket.acquire(&cancel).await.unwrap();
		bucket.acquire(&cancel).await.unwrap();

		// Burst of 1: the second and third token each wait a full second.
		assert!(start.elapsed() >= Duration::from_secs(2));
	}

	#[tokio::test(start_paused = true)]
	async fn bucket_burst_is_immediate() {
		let bucket = TokenBucket::new(1.0, 5);
		let cancel = CancellationToken::new();

		let start = Instant::now();
		for _ in 0..5 {
			bucket.acquire(&cancel).await.unwrap();
		}
		assert_eq!(start.elapsed(), Duration::ZERO);
	}

	#[tokio::test(start_paused = true)]
	async fn acquire_observes_cancellation() {
		let bucket = TokenBucket::new(0.001, 1);
		let cancel = CancellationToken::new();
		bucket.acquire(&cancel).await.unwrap();

		cancel.cancel();
		let result = bucket.acquire(&cancel).await;
		assert!(matches!(result, Err(LimiterError::Cancelled)));
	}

	#[tokio::test(start_paused = true)]
	async fn per_source_ceiling_is_enforced() {
		let limiter = RateLimiter::new(10, &[(SourceKind::Primary, rate(1000.0, 1000, 2))]);
		let cancel = CancellationToken::new();

		let first = limiter.initiate(SourceKind::Primary, &cancel).await.unwrap();
		let _second = limiter.initiate(SourceKind::Primary, &cancel).await.unwrap();
		assert_eq!(limiter.in_flight(SourceKind::Primary), 2);

		assert!(limiter.try_initiate(SourceKind::Primary).is_none());

		drop(first);
		assert_eq!(limiter.in_flight(SourceKind::Primary), 1);
		assert!(limiter.try_initiate(SourceKind::Primary).is_some());
	}

	#[tokio::test(start_paused = true)]
	async fn global_ceiling_is_enforced() {
		let limiter = RateLimiter::new(1, &[(SourceKind::Primary, rate(1000.0, 1000, 10))]);
		let cancel = CancellationToken::new();

		let permit = limiter.message_permit(&cancel).await.unwrap();
		assert_eq!(limiter.messages_in_flight(), 1);

		let blocked = CancellationToken::new();
		let canceller = tokio::spawn({
			let blocked = blocked.clone();
			async move {
				tokio::time::sleep(Duration::from_millis(10)).await;
				blocked.cancel();
			}
		});

		let result = limiter.message_permit(&blocked).await;
		assert!(matches!(result, Err(LimiterError::Cancelled)));

		drop(permit);
		assert_eq!(limiter.messages_in_flight(), 0);
		canceller.await.unwrap();
	}

	#[tokio::test(start_paused = true)]
	async fn reload_changes_refill_rate() {
		let bucket = TokenBucket::new(0.5, 1);
		let cancel = CancellationToken::new();
		bucket.acquire(&cancel).await.unwrap();

		bucket.reload(10.0, 1);
		let start = Instant::now();
		bucket.acquire(&cancel).await.unwrap();
		assert!(start.elapsed() <= Duration::from_millis(200));
	}
}
