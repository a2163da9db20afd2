//! Time sources.
//!
//! All protocol timing is in milliseconds since the UNIX epoch, taken from a
//! [Clock] that may not be synchronised yet.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the UNIX epoch.
pub type Timestamp = u64;

/// A network-synchronised clock.
pub trait Clock: Send + Sync + 'static {
	/// The current time, or [None] while the clock is not synchronised.
	fn now(&self) -> Option<Timestamp>;
}

/// The local system clock, assumed to be synchronised.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
	fn now(&self) -> Option<Timestamp> {
		Some(SystemTime::now().unix_millis())
	}
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
	millis: AtomicU64,
	synced: AtomicBool,
}

impl ManualClock {
	/// Create a synchronised clock at the given time.
	pub fn new(now: Timestamp) -> ManualClock {
		ManualClock {
			millis: AtomicU64::new(now),
			synced: AtomicBool::new(true),
		}
	}

	/// Create a clock that is not synchronised yet.
	pub fn unsynced() -> ManualClock {
		ManualClock {
			millis: AtomicU64::new(0),
			synced: AtomicBool::new(false),
		}
	}

	/// Set the time, marking the clock synchronised.
	pub fn set(&self, now: Timestamp) {
		self.millis.store(now, Ordering::SeqCst);
		self.synced.store(true, Ordering::SeqCst);
	}

	/// Move the clock forward.
	pub fn elapse(&self, duration: Duration) {
		self.millis.fetch_add(duration.as_millis_u64(), Ordering::SeqCst);
	}
}

impl Clock for ManualClock {
	fn now(&self) -> Option<Timestamp> {
		if self.synced.load(Ordering::SeqCst) {
			Some(self.millis.load(Ordering::SeqCst))
		} else {
			None
		}
	}
}

/// Extension trait for time types.
pub(crate) trait TimeExt {
	/// Milliseconds since the UNIX epoch, zero for times before it.
	fn unix_millis(&self) -> Timestamp;
}

impl TimeExt for SystemTime {
	fn unix_millis(&self) -> Timestamp {
		self.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis_u64()
	}
}

/// Extension trait for [Duration].
pub(crate) trait DurationExt {
	/// The duration in whole milliseconds, saturating at [u64::MAX].
	fn as_millis_u64(&self) -> u64;
}

impl DurationExt for Duration {
	fn as_millis_u64(&self) -> u64 {
		let ms = self.as_millis();
		if ms > u64::max_value() as u128 {
			u64::max_value()
		} else {
			ms as u64
		}
	}
}

/// Whether at least `period` has passed between `since` and `now`.
pub(crate) fn has_elapsed(since: Timestamp, now: Timestamp, period: Duration) -> bool {
	now.saturating_sub(since) >= period.as_millis_u64()
}
