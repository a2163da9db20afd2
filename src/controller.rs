//! The application side of the network.

use std::error;
use std::sync::Arc;

use crate::DisconnectReason;
use crate::peer::Peer;
use crate::wire::{ChainTip, Message};

/// Receives what the networking layer doesn't handle itself.
///
/// All methods are called from scheduler worker threads and must not block
/// for long.
pub trait Controller: Send + Sync + 'static {
	/// Our current chain tip, sent to peers after the handshake and with
	/// every peer-info broadcast.
	fn chain_tip(&self) -> Option<ChainTip> {
		None
	}

	/// Handle a message from a handshaked peer.
	///
	/// Errors are logged and otherwise ignored.
	fn on_message(
		&self,
		peer: &Arc<Peer>,
		msg: Message,
	) -> Result<(), Box<dyn error::Error + Send + Sync>>;

	/// A new connection was set up, before the handshake.
	fn on_connected(&self, _peer: &Arc<Peer>) {}

	/// The peer completed the handshake.
	fn on_handshake_completed(&self, _peer: &Arc<Peer>) {}

	/// The peer was disconnected. Called exactly once per peer.
	fn on_disconnect(&self, _peer: &Peer, _reason: &DisconnectReason) {}
}

/// Ignores all messages.
impl Controller for () {
	fn on_message(
		&self,
		peer: &Arc<Peer>,
		msg: Message,
	) -> Result<(), Box<dyn error::Error + Send + Sync>> {
		trace!("{}: ignoring {}", peer, msg.name());
		Ok(())
	}
}
