//! Ping bookkeeping.
//!
//! Detects dead peer connections. Once a peer is handshaked it is pinged on
//! its own interval, counted from the handshake, and a ping that isn't
//! answered within the response timeout ends the connection.

use std::collections::VecDeque;
use std::time::Duration;

use crate::time::Timestamp;

/// Round-trip times measured for a peer.
#[derive(Debug, Clone, Default)]
pub struct PingStats {
	latencies: VecDeque<Duration>,
}

impl PingStats {
	/// Calculate the average latency of this peer.
	pub fn latency(&self) -> Option<Duration> {
		if self.latencies.is_empty() {
			return None;
		}
		let sum = self.latencies.iter().sum::<Duration>();
		Some(sum / self.latencies.len() as u32)
	}

	/// The most recent round-trip time.
	pub fn last(&self) -> Option<Duration> {
		self.latencies.front().copied()
	}

	pub(crate) fn record_latency(&mut self, sample: Duration, limit: usize) {
		self.latencies.push_front(sample);
		self.latencies.truncate(limit);
	}
}

/// Ping schedule and statistics of one peer.
#[derive(Debug, Clone, Default)]
pub struct PingTimer {
	/// When the last ping was sent, or the handshake completed.
	pub(crate) last_sent: Option<Timestamp>,
	pub(crate) stats: PingStats,
}

impl PingTimer {
	/// Start pinging, counting the interval from `now`.
	pub fn start(&mut self, now: Timestamp) {
		self.last_sent = Some(now);
	}

	/// The peer's ping statistics.
	pub fn stats(&self) -> &PingStats {
		&self.stats
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn latency_average() {
		let mut stats = PingStats::default();
		assert_eq!(stats.latency(), None);

		for ms in &[10, 20, 30, 40] {
			stats.record_latency(Duration::from_millis(*ms), 3);
		}
		assert_eq!(stats.last(), Some(Duration::from_millis(40)));
		assert_eq!(stats.latency(), Some(Duration::from_millis(30)));
	}
}
