//! A live connection to a peer.
//!
//! A [Peer] owns its socket and its buffers. Reading and writing are driven
//! by scheduler tasks: a read task drains the socket and queues decoded
//! messages, a write task flushes what [Peer::send] couldn't write right
//! away. At most one task of each kind runs per peer at a time.

use std::{fmt, io, net};
use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel as chan;
use mio::net::TcpStream;
use parking_lot::{Mutex, RwLock};
use rand::Rng;

use crate::{DisconnectReason, Error, Link, PeerId};
use crate::addrmgr::PeerAddress;
use crate::logic::handshake::{self, Handshake, Status};
use crate::logic::pingpong;
use crate::mio_io::Multiplexer;
use crate::pingmgr::{PingStats, PingTimer};
use crate::time::Timestamp;
use crate::wire::{ChainTip, Codec, Message};

/// Bytes read from the socket per call.
const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Callbacks from peers into the connection registry.
pub(crate) trait Hooks: Send + Sync + 'static {
	/// Called exactly once per peer, when it's torn down.
	fn peer_disconnected(&self, peer: &Peer, reason: &DisconnectReason);

	/// A message was queued for dispatch.
	fn message_queued(&self, peer: &Peer);
}

/// What all peers share.
pub(crate) struct PeerContext {
	pub codec: Codec,
	pub mux: Arc<Multiplexer>,
	pub hooks: Weak<dyn Hooks>,
	/// Sending fails once this many bytes are waiting to be written.
	pub max_send_buffer: usize,
	/// The input buffer is shrunk to this size after use.
	pub in_buf_size_limit: usize,
	/// Received messages waiting for dispatch beyond this are dropped.
	pub max_pending_messages: usize,
}

/// What we learned about a peer.
#[derive(Debug, Clone, Default)]
pub struct PeerInfo {
	pub public_key: Option<[u8; 32]>,
	pub node_id: Option<String>,
	/// Software version from HELLO.
	pub version: Option<String>,
	pub protocol_version: Option<u32>,
	/// The port the peer accepts connections on.
	pub listen_port: Option<u16>,
	/// The last chain tip the peer told us about.
	pub chain_tip: Option<ChainTip>,
	pub handshaked_at: Option<Timestamp>,
}

pub struct Peer {
	id: PeerId,
	link: Link,
	address: PeerAddress,
	socket_addr: net::SocketAddr,
	token: mio::Token,
	ctx: Arc<PeerContext>,

	/// Read-locked for I/O, write-locked to change the registration.
	stream: RwLock<TcpStream>,
	/// Held from choosing the socket interest until it's registered.
	interest: Mutex<()>,
	in_buf: Mutex<Vec<u8>>,
	out_buf: Mutex<Vec<u8>>,
	/// Reply slots of outstanding requests, by correlation id.
	replies: Mutex<HashMap<u32, chan::Sender<Message>>>,
	/// Received messages waiting for dispatch.
	pending: Mutex<VecDeque<Message>>,

	handshake: Mutex<Handshake>,
	/// The challenge we send this peer.
	challenge: [u8; 32],
	handshaked: AtomicBool,
	handshake_message_pending: AtomicBool,

	reading: AtomicBool,
	write_pending: AtomicBool,
	stopping: AtomicBool,
	/// Connected on request rather than by the outbound peer maintenance.
	requested: AtomicBool,

	connected_at: Timestamp,
	max_age: Option<Duration>,
	info: RwLock<PeerInfo>,
	ping: Mutex<PingTimer>,
}

impl Peer {
	/// Open a connection to the address.
	///
	/// Blocks for at most `timeout`. No handshake is done.
	pub fn connect(address: &PeerAddress, timeout: Duration) -> Result<TcpStream, Error> {
		let addr = address.to_socket_addr().map_err(Error::PeerUnreachable)?;
		let stream = net::TcpStream::connect_timeout(&addr, timeout)
			.map_err(Error::PeerUnreachable)?;
		stream.set_nonblocking(true)?;
		stream.set_nodelay(true)?;
		Ok(TcpStream::from_std(stream))
	}

	#[allow(clippy::too_many_arguments)]
	pub(crate) fn new(
		ctx: Arc<PeerContext>,
		id: PeerId,
		link: Link,
		address: PeerAddress,
		socket_addr: net::SocketAddr,
		stream: TcpStream,
		token: mio::Token,
		connected_at: Timestamp,
		max_age: Option<Duration>,
	) -> Peer {
		Peer {
			id,
			link,
			address,
			socket_addr,
			token,
			ctx,
			stream: RwLock::new(stream),
			interest: Mutex::new(()),
			in_buf: Mutex::new(Vec::new()),
			out_buf: Mutex::new(Vec::new()),
			replies: Mutex::new(HashMap::new()),
			pending: Mutex::new(VecDeque::new()),
			handshake: Mutex::new(Handshake::default()),
			challenge: rand::random(),
			handshaked: AtomicBool::new(false),
			handshake_message_pending: AtomicBool::new(false),
			reading: AtomicBool::new(false),
			write_pending: AtomicBool::new(false),
			stopping: AtomicBool::new(false),
			requested: AtomicBool::new(false),
			connected_at,
			max_age,
			info: RwLock::new(PeerInfo::default()),
			ping: Mutex::new(PingTimer::default()),
		}
	}

	pub fn id(&self) -> PeerId {
		self.id
	}

	pub fn link(&self) -> Link {
		self.link
	}

	/// The address we know the peer by.
	///
	/// For inbound peers this is the remote end of the socket.
	pub fn address(&self) -> &PeerAddress {
		&self.address
	}

	pub fn socket_addr(&self) -> net::SocketAddr {
		self.socket_addr
	}

	/// Our end of the socket.
	pub fn local_addr(&self) -> Option<net::SocketAddr> {
		self.stream.read().local_addr().ok()
	}

	pub(crate) fn token(&self) -> mio::Token {
		self.token
	}

	/// When the connection was set up.
	pub fn connected_at(&self) -> Timestamp {
		self.connected_at
	}

	/// The age after which the connection is recycled, if any.
	pub fn max_age(&self) -> Option<Duration> {
		self.max_age
	}

	pub fn info(&self) -> PeerInfo {
		self.info.read().clone()
	}

	/// The peer's authenticated public key, once the handshake got that far.
	pub fn public_key(&self) -> Option<[u8; 32]> {
		self.info.read().public_key
	}

	pub fn chain_tip(&self) -> Option<ChainTip> {
		self.info.read().chain_tip.clone()
	}

	pub(crate) fn set_chain_tip(&self, tip: ChainTip) {
		self.info.write().chain_tip = Some(tip);
	}

	pub fn ping_stats(&self) -> PingStats {
		self.ping.lock().stats().clone()
	}

	/// Whether this connection was asked for explicitly.
	///
	/// Such outbound peers don't count against the outbound peer limit when
	/// they complete the handshake.
	pub fn is_requested(&self) -> bool {
		self.requested.load(Ordering::Acquire)
	}

	pub(crate) fn set_requested(&self) {
		self.requested.store(true, Ordering::Release);
	}

	/// Whether the peer is being torn down.
	pub fn is_stopping(&self) -> bool {
		self.stopping.load(Ordering::Acquire)
	}

	// Handshake ///////////////////////////////////////////////////////////////

	pub fn handshake_status(&self) -> Status {
		self.handshake.lock().status()
	}

	pub fn is_handshaked(&self) -> bool {
		self.handshaked.load(Ordering::Acquire)
	}

	pub(crate) fn challenge(&self) -> &[u8; 32] {
		&self.challenge
	}

	/// Feed a message into the handshake, or [None] to start it.
	///
	/// Returns the message to send and the new status. On error the state is
	/// left alone and the caller is expected to disconnect.
	pub(crate) fn advance_handshake(
		&self,
		incoming: Option<&Message>,
		ctx: &handshake::Context,
	) -> Result<(Option<Message>, Status), handshake::Error> {
		let mut state = self.handshake.lock();
		let (next, outgoing) = handshake::advance(&state, self.link, incoming, ctx)?;
		let status = next.status();
		if status != state.status() {
			debug!("{}: handshake {} -> {}", self, state.status(), status);
		}

		if let Some(hello) = next.hello() {
			let mut info = self.info.write();
			info.node_id = Some(hello.node_id.clone());
			info.version = Some(hello.version.clone());
			info.protocol_version = Some(hello.protocol_version);
			info.listen_port = Some(hello.listen_port);
			if next.is_completed() {
				info.public_key = next.public_key().copied();
				info.handshaked_at = Some(ctx.now);
			}
		}
		*state = next;
		if status == Status::Completed {
			self.handshaked.store(true, Ordering::Release);
		}
		Ok((outgoing, status))
	}

	// Dispatch ////////////////////////////////////////////////////////////////

	/// Take the next received message for dispatch.
	///
	/// While handshaking only one message is handed out at a time, until
	/// [Peer::message_done] is called.
	pub(crate) fn next_message(&self) -> Option<Message> {
		let mut pending = self.pending.lock();
		if pending.is_empty() {
			return None;
		}
		if !self.is_handshaked() && self.handshake_message_pending.swap(true, Ordering::AcqRel) {
			return None;
		}
		pending.pop_front()
	}

	/// Mark the message handed out by [Peer::next_message] as handled.
	pub(crate) fn message_done(&self) {
		self.handshake_message_pending.store(false, Ordering::Release);
	}

	/// Number of received messages waiting for dispatch.
	pub fn pending_messages(&self) -> usize {
		self.pending.lock().len()
	}

	/// Route a decoded message, returning whether it was queued for dispatch.
	fn deliver(&self, msg: Message) -> bool {
		if let Some(id) = msg.id() {
			if let Some(slot) = self.replies.lock().get(&id) {
				trace!("{}: reply {} for request {}", self, msg.name(), id);
				// A full slot means a duplicate reply.
				let _ = slot.try_send(msg);
				return false;
			}
		}

		let mut pending = self.pending.lock();
		if pending.len() >= self.ctx.max_pending_messages {
			debug!("{}: dropping {}, too many pending messages", self, msg.name());
			return false;
		}
		trace!("{}: received {}", self, msg.name());
		pending.push_back(msg);
		true
	}

	// Reading /////////////////////////////////////////////////////////////////

	/// Drain the socket and queue every complete message.
	///
	/// Disconnects the peer on EOF, I/O errors and undecodable data.
	pub fn read_available(&self) -> Result<(), DisconnectReason> {
		let res = self.try_read();
		let queued = match res {
			Ok(queued) => queued,
			Err((queued, reason)) => {
				self.notify_queued(queued);
				self.disconnect_with_reason(reason.clone());
				return Err(reason);
			}
		};
		self.notify_queued(queued);
		Ok(())
	}

	fn notify_queued(&self, queued: bool) {
		if queued {
			if let Some(hooks) = self.ctx.hooks.upgrade() {
				hooks.message_queued(self);
			}
		}
	}

	/// Returns whether any message was queued, also on error.
	fn try_read(&self) -> Result<bool, (bool, DisconnectReason)> {
		let mut in_buf = self.in_buf.lock();
		let mut queued = false;
		loop {
			let start = in_buf.len();
			in_buf.resize(start + READ_CHUNK_SIZE, 0);
			let res = {
				let stream = self.stream.read();
				(&*stream).read(&mut in_buf[start..])
			};
			match res {
				Ok(0) => {
					in_buf.truncate(start);
					return Err((queued, DisconnectReason::ConnectionClosed));
				}
				Ok(n) => in_buf.truncate(start + n),
				Err(e) => {
					in_buf.truncate(start);
					match e.kind() {
						io::ErrorKind::WouldBlock => break,
						io::ErrorKind::Interrupted => continue,
						_ => return Err((queued, DisconnectReason::ConnectionError(Arc::new(e)))),
					}
				}
			}

			match self.extract_messages(&mut in_buf) {
				Ok(q) => queued |= q,
				Err(reason) => return Err((queued, reason)),
			}
		}

		if in_buf.is_empty() {
			*in_buf = Vec::new();
		} else {
			in_buf.shrink_to(self.ctx.in_buf_size_limit);
		}
		Ok(queued)
	}

	fn extract_messages(&self, in_buf: &mut Vec<u8>) -> Result<bool, DisconnectReason> {
		let mut start = 0;
		let mut queued = false;
		loop {
			match self.ctx.codec.decode(&in_buf[start..]) {
				Ok(Some((msg, len))) => {
					start += len;
					queued |= self.deliver(msg);
				}
				Ok(None) => break,
				Err(e) => return Err(DisconnectReason::DecodeError(e)),
			}
		}

		if start > 0 {
			in_buf.copy_within(start.., 0);
			let len = in_buf.len();
			in_buf.truncate(len - start);
		}
		Ok(queued)
	}

	// Writing /////////////////////////////////////////////////////////////////

	/// Send a message to the peer.
	///
	/// Whatever can't be written right away is queued and flushed by a write
	/// task. A failure means the peer should be disconnected.
	pub fn send(&self, msg: &Message) -> Result<(), Error> {
		if self.is_stopping() {
			return Err(Error::PeerDisconnected(self.id));
		}

		let more = {
			let mut out_buf = self.out_buf.lock();
			if out_buf.len() > self.ctx.max_send_buffer {
				return Err(Error::SendBufferFull(self.id));
			}
			let try_write = out_buf.is_empty();
			trace!("{}: sending {}", self, msg.name());
			self.ctx.codec.encode(msg, &mut out_buf);

			if !try_write {
				false
			} else {
				match self.try_write(&mut out_buf) {
					Ok(more) => more,
					Err(e) => {
						drop(out_buf);
						self.disconnect_with_reason(DisconnectReason::ConnectionError(Arc::new(e)));
						return Err(Error::PeerDisconnected(self.id));
					}
				}
			}
		};

		if more {
			self.update_interest();
		}
		Ok(())
	}

	/// Flush the send queue.
	pub fn write_available(&self) -> Result<(), DisconnectReason> {
		let res = {
			let mut out_buf = self.out_buf.lock();
			self.try_write(&mut out_buf)
		};
		match res {
			Ok(_) => Ok(()),
			Err(e) => {
				let reason = DisconnectReason::ConnectionError(Arc::new(e));
				self.disconnect_with_reason(reason.clone());
				Err(reason)
			}
		}
	}

	/// Try to write to the socket.
	///
	/// Returns true if there is more to send to the peer and false otherwise.
	fn try_write(&self, out_buf: &mut Vec<u8>) -> io::Result<bool> {
		while !out_buf.is_empty() {
			let res = {
				let stream = self.stream.read();
				(&*stream).write(&out_buf[..])
			};
			match res {
				Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
				Ok(n) => {
					out_buf.copy_within(n.., 0);
					let len = out_buf.len();
					out_buf.truncate(len - n);
				}
				Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
				Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
				Err(e) => return Err(e),
			}
		}
		*out_buf = Vec::new();
		Ok(false)
	}

	// Scheduling //////////////////////////////////////////////////////////////

	pub(crate) fn register(&self) -> io::Result<()> {
		let mut stream = self.stream.write();
		self.ctx.mux.register(&mut *stream, self.token, mio::Interest::READABLE)
	}

	/// Re-arm the socket, asking for write readiness if there is something
	/// to write.
	///
	/// Must not be called with `out_buf` locked.
	fn update_interest(&self) {
		if self.is_stopping() {
			return;
		}
		// A stale choice must not overwrite a newer one.
		let _interest = self.interest.lock();
		let interest = if self.out_buf.lock().is_empty() {
			mio::Interest::READABLE
		} else {
			mio::Interest::READABLE | mio::Interest::WRITABLE
		};
		let mut stream = self.stream.write();
		if let Err(e) = self.ctx.mux.reregister(&mut *stream, self.token, interest) {
			// The peer is being torn down concurrently.
			trace!("{}: failed to reregister: {}", self, e);
		}
	}

	/// Claim the read turn, returning false if a read task is in flight.
	pub(crate) fn begin_read(&self) -> bool {
		!self.reading.swap(true, Ordering::AcqRel)
	}

	pub(crate) fn end_read(&self) {
		self.reading.store(false, Ordering::Release);
		self.update_interest();
	}

	/// Claim the write turn, returning false if a write task is in flight.
	pub(crate) fn begin_write(&self) -> bool {
		!self.write_pending.swap(true, Ordering::AcqRel)
	}

	pub(crate) fn end_write(&self) {
		self.write_pending.store(false, Ordering::Release);
		self.update_interest();
	}

	// Requests ////////////////////////////////////////////////////////////////

	/// Send a request and wait up to `timeout` for the reply carrying the
	/// same correlation id.
	pub fn request(&self, mut msg: Message, timeout: Duration) -> Result<Message, Error> {
		let (tx, rx) = chan::bounded(1);
		let id = {
			let mut replies = self.replies.lock();
			let id = loop {
				let id = rand::thread_rng().gen_range(1, u32::max_value());
				if !replies.contains_key(&id) {
					break id;
				}
			};
			if !msg.set_id(id) {
				return Err(Error::NotRequestable(msg.kind()));
			}
			replies.insert(id, tx);
			id
		};

		let res = self.send(&msg).and_then(|()| match rx.recv_timeout(timeout) {
			Ok(reply) => Ok(reply),
			Err(chan::RecvTimeoutError::Timeout) => Err(Error::Timeout),
			Err(chan::RecvTimeoutError::Disconnected) => Err(Error::PeerDisconnected(self.id)),
		});
		self.replies.lock().remove(&id);
		res
	}

	/// Number of requests waiting for a reply.
	pub fn pending_requests(&self) -> usize {
		self.replies.lock().len()
	}

	// Pings ///////////////////////////////////////////////////////////////////

	pub(crate) fn start_pinging(&self, now: Timestamp) {
		self.ping.lock().start(now);
	}

	pub(crate) fn ping_due(&self, now: Timestamp, interval: Duration) -> bool {
		pingpong::scheduled_ping(&mut self.ping.lock(), now, interval)
	}

	pub(crate) fn record_ping(&self, rtt: Duration, limit: usize) {
		self.ping.lock().stats.record_latency(rtt, limit);
	}

	// Teardown ////////////////////////////////////////////////////////////////

	/// Start disconnecting this peer for the specified reason.
	///
	/// Only the first call has an effect.
	pub fn disconnect_with_reason(&self, reason: DisconnectReason) {
		if self.stopping.swap(true, Ordering::AcqRel) {
			return;
		}
		debug!("{}: disconnecting: {}", self, reason);

		{
			let mut stream = self.stream.write();
			let _ = stream.shutdown(net::Shutdown::Both);
			let _ = self.ctx.mux.deregister(&mut *stream);
		}
		// Dropping the reply slots wakes up waiting requests.
		self.replies.lock().clear();
		self.pending.lock().clear();

		if let Some(hooks) = self.ctx.hooks.upgrade() {
			hooks.peer_disconnected(self, &reason);
		}
	}

	/// Start disconnecting this peer.
	pub fn disconnect(&self) {
		self.disconnect_with_reason(DisconnectReason::Command);
	}

	/// Disconnect because the network is shutting down.
	pub fn shutdown(&self) {
		self.disconnect_with_reason(DisconnectReason::Shutdown);
	}
}

impl fmt::Display for Peer {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "peer {} ({})", self.id, self.address)
	}
}

impl fmt::Debug for Peer {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		fmt::Display::fmt(self, f)
	}
}
