use std::time::Duration;

use crate::pingmgr::PingTimer;
use crate::time::{self, Timestamp};
use crate::wire::Message;

/// Handle a scheduled check whether to ping the peer.
///
/// Returns true and stamps the timer when a ping is due. Peers whose timer
/// hasn't been started are never due.
pub fn scheduled_ping(timer: &mut PingTimer, now: Timestamp, interval: Duration) -> bool {
	match timer.last_sent {
		Some(last) if time::has_elapsed(last, now, interval) => {
			timer.last_sent = Some(now);
			true
		}
		_ => false,
	}
}

/// The reply to a ping received from the peer.
pub fn handle_ping(id: u32) -> Message {
	trace!("Replying to ping {}", id);
	Message::Ping { id }
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn pings_are_peer_local() {
		let interval = Duration::from_secs(20);
		let mut a = PingTimer::default();
		let mut b = PingTimer::default();

		assert!(!scheduled_ping(&mut a, 0, interval));
		a.start(1_000);
		b.start(6_000);

		assert!(!scheduled_ping(&mut a, 20_999, interval));
		assert!(scheduled_ping(&mut a, 21_000, interval));
		assert!(!scheduled_ping(&mut b, 21_000, interval));
		assert!(!scheduled_ping(&mut a, 21_001, interval));
		assert!(scheduled_ping(&mut b, 26_000, interval));
	}
}
