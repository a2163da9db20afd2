//! The handshake state machine.
//!
//! Both sides walk through the same states:
//!
//! 1. `Started`: nothing happened yet.
//! 2. `Hello`: waiting for the peer's HELLO.
//! 3. `Challenge`: waiting for the peer's public key and challenge.
//! 4. `Response`: waiting for the peer's proof over our challenge.
//! 5. `Completed`.
//!
//! Every state has a message it sends. The outbound side sends the message of
//! the state it moves into, so it always speaks first; the inbound side sends
//! the message of the state it leaves, answering in kind.
//!
//! [advance] is a pure function: it never touches sockets and leaves the
//! current state alone when it fails.

use std::fmt;
use std::time::Duration;

use crate::identity::{self, Identity};
use crate::time::{DurationExt, Timestamp};
use crate::wire::{Hello, Message};
use crate::Link;

/// A handshake state without its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Status {
	Started,
	Hello,
	Challenge,
	Response,
	Completed,
}

impl Status {
	/// Upper-case name, as used in logs.
	pub fn name(&self) -> &'static str {
		match self {
			Status::Started => "STARTED",
			Status::Hello => "HELLO",
			Status::Challenge => "CHALLENGE",
			Status::Response => "RESPONSE",
			Status::Completed => "COMPLETED",
		}
	}
}

impl fmt::Display for Status {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.name())
	}
}

/// Handshake state, carrying what we learned about the peer so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
	Started,
	Hello,
	Challenge {
		hello: Hello,
	},
	Response {
		hello: Hello,
		public_key: [u8; 32],
		/// The peer's challenge to us.
		challenge: [u8; 32],
	},
	Completed {
		hello: Hello,
		public_key: [u8; 32],
	},
}

impl Default for Handshake {
	fn default() -> Handshake {
		Handshake::Started
	}
}

impl Handshake {
	/// The status of this state.
	pub fn status(&self) -> Status {
		match self {
			Handshake::Started => Status::Started,
			Handshake::Hello => Status::Hello,
			Handshake::Challenge { .. } => Status::Challenge,
			Handshake::Response { .. } => Status::Response,
			Handshake::Completed { .. } => Status::Completed,
		}
	}

	/// Whether the handshake is completed.
	pub fn is_completed(&self) -> bool {
		self.status() == Status::Completed
	}

	/// The peer's HELLO, once received.
	pub fn hello(&self) -> Option<&Hello> {
		match self {
			Handshake::Started | Handshake::Hello => None,
			Handshake::Challenge { hello }
			| Handshake::Response { hello, .. }
			| Handshake::Completed { hello, .. } => Some(hello),
		}
	}

	/// The peer's public key, once received.
	pub fn public_key(&self) -> Option<&[u8; 32]> {
		match self {
			Handshake::Response { public_key, .. } | Handshake::Completed { public_key, .. } => {
				Some(public_key)
			}
			_ => None,
		}
	}
}

/// Handshake failures. All of them end the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
	/// The message is not the one the current state expects.
	Unexpected {
		/// Current state.
		state: Status,
		/// Type code of the received message, if any.
		got: Option<u8>,
	},
	/// The peer is ourselves.
	SelfConnection,
	/// The peer's protocol version is too old.
	ProtocolVersion(u32),
	/// The peer's clock is too far off ours, in milliseconds.
	ClockDrift(i64),
	/// The public key doesn't belong to the node id from HELLO.
	NodeIdMismatch,
	/// The public key is not a valid key.
	InvalidPublicKey,
	/// The proof over our challenge doesn't verify.
	InvalidProof,
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::Unexpected { state, got: Some(kind) } => {
				write!(f, "unexpected message type {} in state {}", kind, state)
			}
			Error::Unexpected { state, got: None } => {
				write!(f, "missing handshake message in state {}", state)
			}
			Error::SelfConnection => write!(f, "connected to ourselves"),
			Error::ProtocolVersion(v) => write!(f, "unsupported protocol version {}", v),
			Error::ClockDrift(ms) => write!(f, "peer clock off by {}ms", ms),
			Error::NodeIdMismatch => write!(f, "public key doesn't match node id"),
			Error::InvalidPublicKey => write!(f, "invalid public key"),
			Error::InvalidProof => write!(f, "challenge response doesn't verify"),
		}
	}
}

impl std::error::Error for Error {}

impl From<identity::InvalidPublicKey> for Error {
	fn from(_: identity::InvalidPublicKey) -> Error {
		Error::InvalidPublicKey
	}
}

/// Our side of the handshake.
#[derive(Debug)]
pub struct Context<'a> {
	pub identity: &'a Identity,
	/// The challenge we send this peer.
	pub challenge: &'a [u8; 32],
	/// The HELLO we send this peer.
	pub hello: &'a Hello,
	pub now: Timestamp,
	pub min_protocol_version: u32,
	pub max_clock_drift: Duration,
}

/// Advance the handshake with an incoming message, or with [None] to start it.
///
/// Returns the new state and the message to send, if any.
pub fn advance(
	state: &Handshake,
	link: Link,
	incoming: Option<&Message>,
	ctx: &Context,
) -> Result<(Handshake, Option<Message>), Error> {
	let next = receive(state, incoming, ctx)?;
	let outgoing = if link.is_outbound() {
		action(&next, ctx)?
	} else {
		action(state, ctx)?
	};
	Ok((next, outgoing))
}

/// The message a state sends.
fn action(state: &Handshake, ctx: &Context) -> Result<Option<Message>, Error> {
	Ok(match state {
		Handshake::Started | Handshake::Completed { .. } => None,
		Handshake::Hello => Some(Message::Hello(ctx.hello.clone())),
		Handshake::Challenge { .. } => Some(Message::Challenge {
			public_key: *ctx.identity.public_key(),
			challenge: *ctx.challenge,
		}),
		Handshake::Response { public_key, challenge, .. } => Some(Message::Response {
			signature: ctx.identity.prove(public_key, challenge)?,
		}),
	})
}

/// Validate an incoming message against the current state.
fn receive(state: &Handshake, incoming: Option<&Message>, ctx: &Context) -> Result<Handshake, Error> {
	match (state, incoming) {
		(Handshake::Started, None) => Ok(Handshake::Hello),
		(Handshake::Hello, Some(Message::Hello(hello))) => {
			if hello.node_id == ctx.identity.node_id() {
				return Err(Error::SelfConnection);
			}
			if hello.protocol_version < ctx.min_protocol_version {
				return Err(Error::ProtocolVersion(hello.protocol_version));
			}
			let drift = hello.timestamp.saturating_sub(ctx.now as i64);
			if drift.unsigned_abs() > ctx.max_clock_drift.as_millis_u64() {
				return Err(Error::ClockDrift(drift));
			}
			Ok(Handshake::Challenge { hello: hello.clone() })
		}
		(Handshake::Challenge { hello }, Some(Message::Challenge { public_key, challenge })) => {
			if public_key == ctx.identity.public_key() {
				return Err(Error::SelfConnection);
			}
			if identity::node_id(public_key) != hello.node_id {
				return Err(Error::NodeIdMismatch);
			}
			Ok(Handshake::Response {
				hello: hello.clone(),
				public_key: *public_key,
				challenge: *challenge,
			})
		}
		(Handshake::Response { hello, public_key, .. }, Some(Message::Response { signature })) => {
			if !ctx.identity.verify(public_key, ctx.challenge, signature) {
				return Err(Error::InvalidProof);
			}
			Ok(Handshake::Completed {
				hello: hello.clone(),
				public_key: *public_key,
			})
		}
		(state, incoming) => Err(Error::Unexpected {
			state: state.status(),
			got: incoming.map(Message::kind),
		}),
	}
}
