//! A basic implementation of a thread wait group.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Enables a thread to wait for other threads to finish.
///
/// Add threads with Clone and remove with Drop.
pub struct WaitGroup {
	inner: Arc<WaitGroupInner>,
}

/// [WaitGroup] inner state.
struct WaitGroupInner {
	count: Mutex<usize>,
	condvar: Condvar,
}

impl WaitGroup {
	/// Create a new [WaitGroup].
	pub fn new() -> WaitGroup {
		WaitGroup {
			inner: Arc::new(WaitGroupInner {
				count: Mutex::new(1),
				condvar: Condvar::new(),
			}),
		}
	}

	/// Wait for at most `timeout` for all other threads in the waitgroup to
	/// finish.
	///
	/// Returns false if some were still running when the time ran out.
	pub fn wait_timeout(self, timeout: Duration) -> bool {
		let deadline = Instant::now() + timeout;
		let inner = self.inner.clone();
		drop(self);

		let mut count = inner.count.lock();
		while *count > 0 {
			if inner.condvar.wait_until(&mut count, deadline).timed_out() {
				return *count == 0;
			}
		}
		true
	}
}

impl Drop for WaitGroup {
	fn drop(&mut self) {
		let mut count = self.inner.count.lock();
		*count -= 1;

		if *count == 0 {
			self.inner.condvar.notify_all();
		}
	}
}

impl Clone for WaitGroup {
	fn clone(&self) -> WaitGroup {
		let mut count = self.inner.count.lock();
		*count += 1;

		WaitGroup {
			inner: self.inner.clone(),
		}
	}
}
