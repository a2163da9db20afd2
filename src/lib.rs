//! Peer networking layer of a proof-of-stake blockchain node.
//!
//! A [Network] owns the listening socket, keeps outbound connections up to a
//! configured minimum, authenticates every peer with a challenge/response
//! handshake and exchanges peer addresses. Messages the layer doesn't handle
//! itself are handed to a [controller::Controller].
//!
//! All socket work and message processing is done by a small elastic pool of
//! worker threads, see [scheduler].

#[macro_use]
extern crate log;

pub mod addrmgr;
pub mod constants;
pub mod controller;
pub mod identity;
pub mod logic;
pub mod peer;
pub mod pingmgr;
pub mod scheduler;
pub mod wire;

mod config;
pub use config::Config;

mod error;
pub use error::Error;

mod network;
pub use network::Network;

mod time;
pub use time::{Clock, ManualClock, SystemClock, Timestamp};

mod mio_io;
mod peermgr;
mod waitgroup;

use std::{fmt, io};
use std::sync::Arc;

use logic::handshake;

/// Identifies a live peer connection.
pub type PeerId = u64;

/// Link direction of the peer connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Link {
	/// Inbound connection.
	Inbound,
	/// Outbound connection.
	Outbound,
}

impl Link {
	/// Check whether the link is outbound.
	pub fn is_outbound(&self) -> bool {
		*self == Link::Outbound
	}

	/// Check whether the link is inbound.
	pub fn is_inbound(&self) -> bool {
		*self == Link::Inbound
	}
}

/// Disconnect reason.
#[derive(Debug, Clone)]
pub enum DisconnectReason {
	/// Peer connection failed.
	ConnectionError(Arc<io::Error>),
	/// The peer closed the connection.
	ConnectionClosed,
	/// The peer sent bytes we can't decode.
	DecodeError(wire::Error),
	/// The handshake failed.
	Handshake(handshake::Error),
	/// The handshake didn't complete in time.
	HandshakeTimeout(handshake::Status),
	/// A handshake message arrived after the handshake.
	UnexpectedHandshakeMessage,
	/// We already have a connection to the same node.
	ExistingConnection,
	/// The peer is ourselves.
	SelfConnection,
	/// We already have as many outbound peers as we want.
	OutboundLimit,
	/// Peer timed out.
	PeerTimeout(&'static str),
	/// The connection reached its maximum age.
	ConnectionAge,
	/// The peer's record was forgotten.
	Forgotten,
	/// Sending to the peer failed.
	SendFailed(Arc<Error>),
	/// The network is shutting down.
	Shutdown,
	/// Peer was disconnected by the user.
	Command,
	/// Peer was disconnected for another reason.
	Other(&'static str),
}

impl DisconnectReason {
	/// Whether the peer may be tried again after the usual backoff.
	///
	/// The other reasons are protocol violations and get the peer's record
	/// marked as misbehaved.
	pub fn is_transient(&self) -> bool {
		match self {
			DisconnectReason::DecodeError(_)
			| DisconnectReason::Handshake(_)
			| DisconnectReason::UnexpectedHandshakeMessage
			| DisconnectReason::ExistingConnection => false,
			_ => true,
		}
	}
}

impl fmt::Display for DisconnectReason {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			Self::ConnectionError(e) => write!(f, "connection error: {}", e),
			Self::ConnectionClosed => write!(f, "connection closed by peer"),
			Self::DecodeError(e) => write!(f, "message decode error: {}", e),
			Self::Handshake(e) => write!(f, "handshake failed: {}", e),
			Self::HandshakeTimeout(s) => write!(f, "handshake timeout in state {}", s),
			Self::UnexpectedHandshakeMessage => write!(f, "unexpected handshaking message"),
			Self::ExistingConnection => write!(f, "existing connection"),
			Self::SelfConnection => write!(f, "connected to self"),
			Self::OutboundLimit => write!(f, "outbound connection limit reached"),
			Self::PeerTimeout(s) => write!(f, "peer timed out: {}", s),
			Self::ConnectionAge => write!(f, "connection reached maximum age"),
			Self::Forgotten => write!(f, "peer forgotten"),
			Self::SendFailed(e) => write!(f, "send failed: {}", e),
			Self::Shutdown => write!(f, "shutting down"),
			Self::Command => write!(f, "received external command"),
			Self::Other(reason) => write!(f, "{}", reason),
		}
	}
}
