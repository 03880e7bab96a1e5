use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current UNIX time in whole seconds, querying the system clock directly.
///
/// Used anywhere TTL arithmetic must be exact (response timestamps, fail-TTL barriers);
/// [`Clock::now`] is for fast paths that can tolerate a second of skew.
pub fn unix_now() -> i64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

/// A process-wide monotonically-advancing approximation of the current UNIX time.
///
/// A single background tick calls [`Clock::refresh`] once a second; every other reader
/// calls [`Clock::now`], which is a single relaxed atomic load instead of a syscall. Never
/// goes backwards, even if the system clock is stepped.
pub struct Clock {
	seconds: AtomicI64,
}

impl Clock {
	pub fn new() -> Self {
		Self { seconds: AtomicI64::new(unix_now()) }
	}

	/// The cached approximation of the current time.
	#[inline]
	pub fn now(&self) -> i64 {
		self.seconds.load(Ordering::Relaxed)
	}

	/// Re-samples the system clock and advances the cached value. A no-op if the system
	/// clock moved backwards, preserving monotonicity.
	pub fn refresh(&self) {
		let fresh = unix_now();
		self.seconds.fetch_max(fresh, Ordering::Relaxed);
	}
}

impl Default for Clock {
	fn default() -> Self {
		Self::new()
	}
}
