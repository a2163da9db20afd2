use std::{fmt, io};

use crate::PeerId;

#[derive(Debug)]
pub enum Error {
	/// An I/O error.
	Io(io::Error),
	/// Can't reach the peer.
	PeerUnreachable(io::Error),
	/// The peer has been disconnected.
	PeerDisconnected(PeerId),
	/// No reply arrived within the request timeout.
	Timeout,
	/// The peer's send buffer is over its limit.
	SendBufferFull(PeerId),
	/// The message type doesn't carry a correlation id.
	NotRequestable(u8),
	/// The network clock is not synchronised yet.
	NotSynced,
	/// Enough outbound peers are handshaked already.
	OutboundLimit,
	/// A peer address could not be parsed.
	InvalidAddress(String),
	/// Persisting peer records failed.
	Store(io::Error),
	/// The network is shutting down.
	Shutdown,
}

impl From<io::Error> for Error {
	fn from(e: io::Error) -> Error {
		Error::Io(e)
	}
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match *self {
			Error::Io(ref e) => write!(f, "I/O error: {}", e),
			Error::PeerUnreachable(ref e) => write!(f, "can't reach the peer: {}", e),
			Error::PeerDisconnected(id) => write!(f, "peer disconnected: {}", id),
			Error::Timeout => write!(f, "timed out waiting for a reply"),
			Error::SendBufferFull(id) => write!(f, "send buffer full for peer {}", id),
			Error::NotRequestable(kind) => {
				write!(f, "message type {} doesn't carry a correlation id", kind)
			}
			Error::NotSynced => write!(f, "network clock not synchronised"),
			Error::OutboundLimit => write!(f, "outbound connection limit reached"),
			Error::InvalidAddress(ref a) => write!(f, "invalid peer address: {}", a),
			Error::Store(ref e) => write!(f, "peer store error: {}", e),
			Error::Shutdown => write!(f, "network is shutting down"),
		}
	}
}

impl std::error::Error for Error {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match *self {
			Error::Io(ref e) | Error::PeerUnreachable(ref e) | Error::Store(ref e) => Some(e),
			_ => None,
		}
	}
}
