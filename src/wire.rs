//! Message framing.
//!
//! Every message travels in a frame of the form
//! `MAGIC(4) | TYPE(1) | LENGTH(4) | PAYLOAD(LENGTH)`. All integers are
//! little-endian. Correlation ids are part of the payload of the message
//! types that carry them.

use std::{fmt, io};
use std::io::Read;

use bitcoin::consensus::encode::{self, Decodable, Encodable, VarInt};

use crate::constants::{
	CHALLENGE_SIZE, HEADER_SIZE, MAX_ADDRESS_LEN, MAX_VERSION_LEN, MSG_CHALLENGE, MSG_GET_PEERS,
	MSG_HEIGHT_V2, MSG_HELLO, MSG_ID_FLAG, MSG_PEERS_V2, MSG_PING, MSG_RESPONSE,
};

/// Errors decoding a frame. All of them are fatal to the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
	/// The frame doesn't start with our network magic.
	BadMagic,
	/// The declared payload length is over the maximum.
	Oversized {
		/// Declared payload length.
		length: usize,
		/// Maximum payload length.
		max: usize,
	},
	/// The payload doesn't parse for its message type.
	Payload {
		/// Message type code.
		kind: u8,
		/// What went wrong.
		reason: String,
	},
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::BadMagic => write!(f, "bad network magic"),
			Error::Oversized { length, max } => {
				write!(f, "declared payload length {} over maximum {}", length, max)
			}
			Error::Payload { kind, reason } => {
				write!(f, "malformed payload for message type {}: {}", kind, reason)
			}
		}
	}
}

impl std::error::Error for Error {}

/// The HELLO handshake message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
	/// Sender's clock in milliseconds since the UNIX epoch.
	pub timestamp: i64,
	/// Sender's protocol version.
	pub protocol_version: u32,
	/// Sender's software version.
	pub version: String,
	/// The port the sender accepts connections on.
	pub listen_port: u16,
	/// Sender's node id.
	pub node_id: String,
}

/// A chain-tip summary, as sent in HEIGHT_V2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTip {
	/// Height of the tip block.
	pub height: u32,
	/// Signature of the tip block.
	pub signature: Vec<u8>,
	/// Timestamp of the tip block.
	pub timestamp: i64,
	/// Public key of the tip block's minter.
	pub minter_public_key: [u8; 32],
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
	Hello(Hello),
	Challenge {
		public_key: [u8; 32],
		challenge: [u8; CHALLENGE_SIZE],
	},
	Response {
		signature: [u8; 64],
	},
	/// A ping, answered with a ping carrying the same id.
	Ping {
		id: u32,
	},
	GetPeers,
	/// Peer addresses in `host:port` form.
	PeersV2(Vec<String>),
	Height(ChainTip),
	/// Any message type not handled by the networking layer.
	Other {
		kind: u8,
		/// Present for types with [MSG_ID_FLAG] set.
		id: Option<u32>,
		payload: Vec<u8>,
	},
}

impl Message {
	/// The message type code.
	pub fn kind(&self) -> u8 {
		match self {
			Message::Hello(_) => MSG_HELLO,
			Message::Challenge { .. } => MSG_CHALLENGE,
			Message::Response { .. } => MSG_RESPONSE,
			Message::Ping { .. } => MSG_PING,
			Message::GetPeers => MSG_GET_PEERS,
			Message::PeersV2(_) => MSG_PEERS_V2,
			Message::Height(_) => MSG_HEIGHT_V2,
			Message::Other { kind, .. } => *kind,
		}
	}

	/// A short name for logging.
	pub fn name(&self) -> &'static str {
		match self {
			Message::Hello(_) => "HELLO",
			Message::Challenge { .. } => "CHALLENGE",
			Message::Response { .. } => "RESPONSE",
			Message::Ping { .. } => "PING",
			Message::GetPeers => "GET_PEERS",
			Message::PeersV2(_) => "PEERS_V2",
			Message::Height(_) => "HEIGHT_V2",
			Message::Other { .. } => "OTHER",
		}
	}

	/// Whether this is one of the handshake messages.
	pub fn is_handshake(&self) -> bool {
		match self {
			Message::Hello(_) | Message::Challenge { .. } | Message::Response { .. } => true,
			_ => false,
		}
	}

	/// The correlation id, if this message type carries one.
	pub fn id(&self) -> Option<u32> {
		match self {
			Message::Ping { id } => Some(*id),
			Message::Other { id, .. } => *id,
			_ => None,
		}
	}

	/// Set the correlation id.
	///
	/// Returns false if this message type doesn't carry one.
	pub fn set_id(&mut self, new_id: u32) -> bool {
		match self {
			Message::Ping { id } => *id = new_id,
			Message::Other { kind, id, .. } if *kind & MSG_ID_FLAG != 0 => *id = Some(new_id),
			_ => return false,
		}
		true
	}

	fn encode_payload(&self, out: &mut Vec<u8>) {
		// Writing to a vec can't fail.
		fn put<T: Encodable + ?Sized>(v: &T, out: &mut Vec<u8>) {
			v.consensus_encode(&mut *out).expect("vecs don't error");
		}

		match self {
			Message::Hello(h) => {
				put(&h.timestamp, out);
				put(&h.protocol_version, out);
				put(&h.version, out);
				put(&h.listen_port, out);
				put(&h.node_id, out);
			}
			Message::Challenge { public_key, challenge } => {
				out.extend_from_slice(public_key);
				out.extend_from_slice(challenge);
			}
			Message::Response { signature } => out.extend_from_slice(signature),
			Message::Ping { id } => put(id, out),
			Message::GetPeers => {}
			Message::PeersV2(addrs) => {
				let addrs = addrs
					.iter()
					.filter(|a| a.len() <= MAX_ADDRESS_LEN)
					.collect::<Vec<_>>();
				put(&(addrs.len() as u32), out);
				for addr in addrs {
					out.push(addr.len() as u8);
					out.extend_from_slice(addr.as_bytes());
				}
			}
			Message::Height(tip) => {
				put(&tip.height, out);
				put(&tip.signature, out);
				put(&tip.timestamp, out);
				out.extend_from_slice(&tip.minter_public_key);
			}
			Message::Other { kind, id, payload } => {
				if kind & MSG_ID_FLAG != 0 {
					put(&id.unwrap_or(0), out);
				}
				out.extend_from_slice(payload);
			}
		}
	}

	fn decode_payload(kind: u8, payload: &[u8]) -> Result<Message, encode::Error> {
		let mut cur = io::Cursor::new(payload);
		let msg = match kind {
			MSG_HELLO => Message::Hello(Hello {
				timestamp: Decodable::consensus_decode(&mut cur)?,
				protocol_version: Decodable::consensus_decode(&mut cur)?,
				version: read_string(&mut cur, MAX_VERSION_LEN)?,
				listen_port: Decodable::consensus_decode(&mut cur)?,
				node_id: read_string(&mut cur, MAX_VERSION_LEN)?,
			}),
			MSG_CHALLENGE => Message::Challenge {
				public_key: read_array(&mut cur)?,
				challenge: read_array(&mut cur)?,
			},
			MSG_RESPONSE => Message::Response {
				signature: read_array(&mut cur)?,
			},
			MSG_PING => Message::Ping {
				id: Decodable::consensus_decode(&mut cur)?,
			},
			MSG_GET_PEERS => Message::GetPeers,
			MSG_PEERS_V2 => {
				let count = u32::consensus_decode(&mut cur)? as usize;
				if count > remaining(&cur) {
					return Err(encode::Error::ParseFailed("peer count over payload size"));
				}
				let mut addrs = Vec::with_capacity(count);
				for _ in 0..count {
					let len = u8::consensus_decode(&mut cur)? as usize;
					let mut raw = vec![0u8; len];
					cur.read_exact(&mut raw)?;
					let addr = String::from_utf8(raw)
						.map_err(|_| encode::Error::ParseFailed("address not UTF-8"))?;
					addrs.push(addr);
				}
				Message::PeersV2(addrs)
			}
			MSG_HEIGHT_V2 => Message::Height(ChainTip {
				height: Decodable::consensus_decode(&mut cur)?,
				signature: read_bytes(&mut cur, usize::max_value())?,
				timestamp: Decodable::consensus_decode(&mut cur)?,
				minter_public_key: read_array(&mut cur)?,
			}),
			_ if kind & MSG_ID_FLAG != 0 => {
				let id = u32::consensus_decode(&mut cur)?;
				Message::Other {
					kind,
					id: Some(id),
					payload: payload[4..].to_vec(),
				}
			}
			_ => Message::Other {
				kind,
				id: None,
				payload: payload.to_vec(),
			},
		};
		Ok(msg)
	}
}

fn remaining(cur: &io::Cursor<&[u8]>) -> usize {
	cur.get_ref().len().saturating_sub(cur.position() as usize)
}

fn read_array<const N: usize>(cur: &mut io::Cursor<&[u8]>) -> Result<[u8; N], encode::Error> {
	let mut ret = [0u8; N];
	cur.read_exact(&mut ret)?;
	Ok(ret)
}

/// Read length-prefixed bytes without trusting the prefix for allocation.
fn read_bytes(cur: &mut io::Cursor<&[u8]>, max: usize) -> Result<Vec<u8>, encode::Error> {
	let len = VarInt::consensus_decode(&mut *cur)?.0;
	if len > max as u64 || len > remaining(cur) as u64 {
		return Err(encode::Error::ParseFailed("length prefix out of bounds"));
	}
	let mut ret = vec![0u8; len as usize];
	cur.read_exact(&mut ret)?;
	Ok(ret)
}

fn read_string(cur: &mut io::Cursor<&[u8]>, max: usize) -> Result<String, encode::Error> {
	String::from_utf8(read_bytes(cur, max)?)
		.map_err(|_| encode::Error::ParseFailed("string not UTF-8"))
}

/// Encodes and decodes message frames for one network.
#[derive(Debug, Clone)]
pub struct Codec {
	magic: [u8; 4],
	max_message_size: usize,
}

impl Codec {
	/// Create a codec for the given magic and maximum frame size.
	pub fn new(magic: [u8; 4], max_message_size: usize) -> Codec {
		Codec {
			magic,
			max_message_size,
		}
	}

	/// The network magic.
	pub fn magic(&self) -> [u8; 4] {
		self.magic
	}

	fn max_payload(&self) -> usize {
		self.max_message_size.saturating_sub(HEADER_SIZE)
	}

	/// Append the frame for `msg` to `out`.
	pub fn encode(&self, msg: &Message, out: &mut Vec<u8>) {
		let start = out.len();
		out.extend_from_slice(&self.magic);
		out.push(msg.kind());
		out.extend_from_slice(&[0u8; 4]);
		msg.encode_payload(out);

		let len = (out.len() - start - HEADER_SIZE) as u32;
		out[start + 5..start + HEADER_SIZE].copy_from_slice(&len.to_le_bytes());
	}

	/// Encode a single message into a fresh buffer.
	pub fn serialize(&self, msg: &Message) -> Vec<u8> {
		let mut ret = Vec::new();
		self.encode(msg, &mut ret);
		ret
	}

	/// Try to decode one message from the start of `buf`.
	///
	/// Returns the message and the number of bytes it took, or [None] if
	/// `buf` doesn't hold a complete frame yet. `buf` is never modified.
	pub fn decode(&self, buf: &[u8]) -> Result<Option<(Message, usize)>, Error> {
		let magic_len = buf.len().min(self.magic.len());
		if buf[..magic_len] != self.magic[..magic_len] {
			return Err(Error::BadMagic);
		}
		if buf.len() < HEADER_SIZE {
			return Ok(None);
		}

		let kind = buf[4];
		let mut len_bytes = [0u8; 4];
		len_bytes.copy_from_slice(&buf[5..HEADER_SIZE]);
		let length = u32::from_le_bytes(len_bytes) as usize;
		if length > self.max_payload() {
			return Err(Error::Oversized {
				length,
				max: self.max_payload(),
			});
		}

		let end = HEADER_SIZE + length;
		if buf.len() < end {
			return Ok(None);
		}

		let msg = Message::decode_payload(kind, &buf[HEADER_SIZE..end]).map_err(|e| {
			Error::Payload {
				kind,
				reason: e.to_string(),
			}
		})?;
		Ok(Some((msg, end)))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::constants::{MAINNET_MAGIC, TESTNET_MAGIC};

	fn codec() -> Codec {
		Codec::new(MAINNET_MAGIC, 1024)
	}

	fn samples() -> Vec<Message> {
		vec![
			Message::Hello(Hello {
				timestamp: 1_600_000_000_000,
				protocol_version: 3,
				version: "chain-p2p-0.1.0".into(),
				listen_port: 12392,
				node_id: "00ff".into(),
			}),
			Message::Challenge {
				public_key: [7; 32],
				challenge: [9; 32],
			},
			Message::Response { signature: [3; 64] },
			Message::Ping { id: 0xdead_beef },
			Message::GetPeers,
			Message::PeersV2(vec!["0.0.0.0:12392".into(), "[::1]:9084".into(), "node.example.org:12392".into()]),
			Message::Height(ChainTip {
				height: 1234,
				signature: vec![1, 2, 3, 4],
				timestamp: -5,
				minter_public_key: [4; 32],
			}),
			Message::Other { kind: 0x91, id: Some(42), payload: vec![5, 6] },
			Message::Other { kind: 50, id: None, payload: vec![] },
		]
	}

	/// Drain all complete messages from the buffer like a peer does.
	fn drain(codec: &Codec, buf: &mut Vec<u8>, out: &mut Vec<Message>) {
		let mut start = 0;
		while let Some((msg, used)) = codec.decode(&buf[start..]).unwrap() {
			out.push(msg);
			start += used;
		}
		buf.copy_within(start.., 0);
		buf.truncate(buf.len() - start);
	}

	#[test]
	fn reassembly_independent_of_split_points() {
		let codec = codec();
		let msgs = samples();
		let mut stream = Vec::new();
		for m in &msgs {
			codec.encode(m, &mut stream);
		}

		for chunk in 1..=stream.len() {
			let mut buf = Vec::new();
			let mut decoded = Vec::new();
			for piece in stream.chunks(chunk) {
				buf.extend_from_slice(piece);
				drain(&codec, &mut buf, &mut decoded);
			}
			assert_eq!(decoded, msgs, "chunk size {}", chunk);
			assert!(buf.is_empty());
		}
	}

	#[test]
	fn decode_is_non_destructive() {
		let codec = codec();
		let frame = codec.serialize(&Message::Ping { id: 1 });
		let partial = &frame[..frame.len() - 1];
		assert_eq!(codec.decode(partial), Ok(None));
		assert_eq!(codec.decode(partial), Ok(None));
		assert_eq!(codec.decode(&frame), Ok(Some((Message::Ping { id: 1 }, frame.len()))));
	}

	#[test]
	fn oversized_length_rejected_from_header() {
		let codec = codec();
		let mut header = MAINNET_MAGIC.to_vec();
		header.push(MSG_PING);
		header.extend_from_slice(&u32::max_value().to_le_bytes());
		match codec.decode(&header) {
			Err(Error::Oversized { length, max }) => {
				assert_eq!(length, u32::max_value() as usize);
				assert_eq!(max, 1024 - HEADER_SIZE);
			}
			r => panic!("unexpected: {:?}", r),
		}
	}

	#[test]
	fn foreign_magic_rejected_early() {
		let codec = codec();
		assert_eq!(codec.decode(&TESTNET_MAGIC[..1]), Err(Error::BadMagic));
		assert_eq!(codec.decode(&MAINNET_MAGIC[..2]), Ok(None));

		let frame = Codec::new(TESTNET_MAGIC, 1024).serialize(&Message::GetPeers);
		assert_eq!(codec.decode(&frame), Err(Error::BadMagic));
	}

	#[test]
	fn malformed_payload() {
		let codec = codec();
		let mut frame = codec.serialize(&Message::Ping { id: 1 });
		// Chop the id in half and fix up the length.
		frame.truncate(frame.len() - 2);
		frame[5..9].copy_from_slice(&2u32.to_le_bytes());
		match codec.decode(&frame) {
			Err(Error::Payload { kind, .. }) => assert_eq!(kind, MSG_PING),
			r => panic!("unexpected: {:?}", r),
		}
	}

	#[test]
	fn long_addresses_skipped() {
		let codec = codec();
		let long = "a".repeat(MAX_ADDRESS_LEN + 1);
		let frame = codec.serialize(&Message::PeersV2(vec![long, "b:1".into()]));
		let (msg, _) = codec.decode(&frame).unwrap().unwrap();
		assert_eq!(msg, Message::PeersV2(vec!["b:1".into()]));
	}

	#[test]
	fn correlation_ids() {
		let mut ping = Message::Ping { id: 0 };
		assert!(ping.set_id(5));
		assert_eq!(ping.id(), Some(5));

		let mut other = Message::Other { kind: MSG_ID_FLAG | 3, id: None, payload: vec![] };
		assert!(other.set_id(6));
		assert_eq!(other.id(), Some(6));

		let mut plain = Message::Other { kind: 3, id: None, payload: vec![] };
		assert!(!plain.set_id(7));
		assert!(!Message::GetPeers.set_id(8));
	}
}
