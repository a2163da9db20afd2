//! The connection registry.
//!
//! [Network] accepts inbound connections, keeps enough outbound connections
//! open, drives the handshake of every new peer and handles the messages the
//! networking layer understands itself. Everything runs as tasks on a
//! [Scheduler], produced in this order:
//!
//!  1. dispatching a message a peer received,
//!  2. pinging a peer whose ping interval elapsed,
//!  3. connecting to a new outbound peer,
//!  4. broadcasting our peer info,
//!  5. maintenance: dropping stuck handshakes and old peer records,
//!  6. accepting, reading or writing whatever socket became ready.
//!
//! Steps 2 to 5 are skipped while the clock is not synchronised.

use std::{io, net};
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use parking_lot::Mutex;
use rand::Rng;

use crate::{Config, DisconnectReason, Error, Link};
use crate::addrmgr::{KnownPeers, PeerAddress, PeerRecord, Store};
use crate::constants::{ADDED_BY_FIXED_NETWORK, ADDED_BY_INITIAL, ADDED_BY_PEER_EXCHANGE};
use crate::controller::Controller;
use crate::identity::Identity;
use crate::logic::handshake::{self, Status};
use crate::logic::pingpong;
use crate::mio_io::{Multiplexer, LISTENER_TOKEN};
use crate::peer::{Hooks, Peer, PeerContext};
use crate::peermgr::{PeerViews, Rejection};
use crate::scheduler::{self, Producer, Scheduler, Task};
use crate::time::{self, Clock, DurationExt, Timestamp};
use crate::wire::{Codec, Hello, Message};

/// Host of the first PEERS_V2 entry, which stands for the sender itself.
const SELF_ENTRY_HOST: &str = "0.0.0.0";

struct Listener {
	socket: TcpListener,
	registered: bool,
}

struct Inner {
	me: Weak<Inner>,
	config: Config,
	identity: Identity,
	clock: Arc<dyn Clock>,
	controller: Arc<dyn Controller>,
	mux: Arc<Multiplexer>,

	listener: Mutex<Listener>,
	local_addr: net::SocketAddr,
	/// An accept task is in flight.
	accepting: AtomicBool,

	known: KnownPeers,
	peers: PeerViews,
	peer_ctx: Arc<PeerContext>,
	peer_seq: AtomicU64,
	/// Where the next dispatch scan starts.
	dispatch_cursor: AtomicUsize,

	next_connect: Mutex<Timestamp>,
	next_broadcast: Mutex<Timestamp>,
	next_maintenance: Mutex<Timestamp>,

	shutting_down: AtomicBool,
}

/// Claim a periodic job, returning false if it's not due yet.
fn claim(next: &Mutex<Timestamp>, now: Timestamp, period: Duration) -> bool {
	let mut next = next.lock();
	if now < *next {
		return false;
	}
	*next = now + period.as_millis_u64();
	true
}

impl Inner {
	fn now(&self) -> Option<Timestamp> {
		self.clock.now()
	}

	fn hello(&self, now: Timestamp) -> Hello {
		Hello {
			timestamp: now as i64,
			protocol_version: self.config.protocol_version,
			version: self.config.version_string.clone(),
			listen_port: self.local_addr.port(),
			node_id: self.identity.node_id().to_owned(),
		}
	}

	fn is_connected_to(&self, address: &PeerAddress) -> bool {
		self.peers.connected().iter().any(|p| p.address() == address)
	}

	/// Send to the peer, disconnecting it on failure.
	fn send(&self, peer: &Peer, msg: &Message) -> bool {
		match peer.send(msg) {
			Ok(()) => true,
			Err(Error::PeerDisconnected(_)) => false,
			Err(e) => {
				peer.disconnect_with_reason(DisconnectReason::SendFailed(Arc::new(e)));
				false
			}
		}
	}

	// Accepting ///////////////////////////////////////////////////////////////

	fn set_accepting(&self, enabled: bool) {
		if enabled && self.shutting_down.load(Ordering::SeqCst) {
			return;
		}
		let mut guard = self.listener.lock();
		let listener = &mut *guard;
		let res = if enabled && !listener.registered {
			debug!("Accepting inbound connections");
			self.mux.register(&mut listener.socket, LISTENER_TOKEN, mio::Interest::READABLE)
		} else if !enabled && listener.registered {
			debug!("No longer accepting inbound connections");
			self.mux.deregister(&mut listener.socket)
		} else {
			return;
		};
		match res {
			Ok(()) => listener.registered = enabled,
			Err(e) => warn!("Failed to update listener registration: {}", e),
		}
	}

	fn rearm_listener(&self) {
		let mut guard = self.listener.lock();
		let listener = &mut *guard;
		if listener.registered {
			let res = self.mux.reregister(&mut listener.socket, LISTENER_TOKEN, mio::Interest::READABLE);
			if let Err(e) = res {
				warn!("Failed to rearm listener: {}", e);
			}
		}
	}

	/// Why we won't take a connection from this address, if we won't.
	fn refuse_inbound(&self, addr: &net::SocketAddr) -> Option<&'static str> {
		if self.now().is_none() {
			return Some("clock not synchronised");
		}
		if self.peers.connected().len() >= self.config.max_peers {
			self.set_accepting(false);
			return Some("connection limit reached");
		}
		if self.config.is_fixed_network() {
			let ip = addr.ip();
			let allowed = self.config.fixed_network.iter().any(|a| {
				a.host() == ip.to_string() || a.to_socket_addr().map_or(false, |s| s.ip() == ip)
			});
			if !allowed {
				return Some("not in fixed network");
			}
		}
		None
	}

	fn accept(self: &Arc<Self>) {
		loop {
			let res = self.listener.lock().socket.accept();
			let (stream, addr) = match res {
				Ok(s) => s,
				Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
				Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
				Err(e) => {
					warn!("Failed to accept connection: {}", e);
					break;
				}
			};

			if let Some(reason) = self.refuse_inbound(&addr) {
				debug!("Refusing connection from {}: {}", addr, reason);
				drop(stream);
				if !self.listener.lock().registered {
					break;
				}
				continue;
			}

			debug!("Accepted connection from {}", addr);
			let address = PeerAddress::from_socket_addr(addr);
			if let Err(e) = self.new_peer(stream, Link::Inbound, address, addr, false) {
				debug!("Failed to set up peer {}: {}", addr, e);
			}
		}

		self.accepting.store(false, Ordering::Release);
		self.rearm_listener();
	}

	// Connecting //////////////////////////////////////////////////////////////

	/// Dial a peer. Unless `requested`, nothing is dialed once enough
	/// outbound peers are handshaked.
	fn connect_peer(self: &Arc<Self>, address: PeerAddress, requested: bool) -> Result<Arc<Peer>, Error> {
		if self.shutting_down.load(Ordering::SeqCst) {
			return Err(Error::Shutdown);
		}
		if !requested && self.peers.outbound_handshaked().len() >= self.config.min_outbound_peers {
			return Err(Error::OutboundLimit);
		}
		let now = self.now().ok_or(Error::NotSynced)?;
		self.known.mark_attempted(&address, now);

		debug!("Connecting to peer {}", address);
		let stream = Peer::connect(&address, self.config.connect_timeout)?;
		let addr = stream.peer_addr()?;
		self.new_peer(stream, Link::Outbound, address, addr, requested)
	}

	/// Set up a new connection and start its handshake.
	fn new_peer(
		self: &Arc<Self>,
		stream: TcpStream,
		link: Link,
		address: PeerAddress,
		addr: net::SocketAddr,
		requested: bool,
	) -> Result<Arc<Peer>, Error> {
		let now = self.now().ok_or(Error::NotSynced)?;
		let id = self.peer_seq.fetch_add(1, Ordering::Relaxed) + 1;
		let max_age = self.config.max_connection_age.map(|max| {
			let max = max.as_millis_u64().max(2);
			Duration::from_millis(rand::thread_rng().gen_range(max / 2, max + 1))
		});

		let peer = Arc::new(Peer::new(
			self.peer_ctx.clone(),
			id,
			link,
			address,
			addr,
			stream,
			self.mux.next_token(),
			now,
			max_age,
		));
		if requested {
			peer.set_requested();
		}
		self.peers.add_connected(peer.clone());

		let hello = self.hello(now);
		let ctx = self.handshake_context(&peer, &hello, now);
		let outgoing = match peer.advance_handshake(None, &ctx) {
			Ok((outgoing, _)) => outgoing,
			Err(e) => {
				peer.disconnect_with_reason(DisconnectReason::Handshake(e));
				return Err(Error::PeerDisconnected(id));
			}
		};

		if let Err(e) = peer.register() {
			peer.disconnect_with_reason(DisconnectReason::ConnectionError(Arc::new(e)));
			return Err(Error::PeerDisconnected(id));
		}
		if let Some(msg) = outgoing {
			if !self.send(&peer, &msg) {
				return Err(Error::PeerDisconnected(id));
			}
		}

		debug!("{}: connected ({:?})", peer, link);
		self.controller.on_connected(&peer);
		Ok(peer)
	}

	fn handshake_context<'a>(
		&'a self,
		peer: &'a Peer,
		hello: &'a Hello,
		now: Timestamp,
	) -> handshake::Context<'a> {
		handshake::Context {
			identity: &self.identity,
			challenge: peer.challenge(),
			hello,
			now,
			min_protocol_version: self.config.min_protocol_version,
			max_clock_drift: self.config.max_clock_drift,
		}
	}

	// Dispatch ////////////////////////////////////////////////////////////////

	fn dispatch(self: &Arc<Self>, peer: &Arc<Peer>, msg: Message) {
		if peer.is_handshaked() {
			self.on_message(peer, msg);
		} else {
			self.on_handshake_message(peer, msg);
		}
		peer.message_done();
	}

	fn on_handshake_message(&self, peer: &Arc<Peer>, msg: Message) {
		let now = match self.now() {
			Some(now) => now,
			None => {
				peer.disconnect_with_reason(DisconnectReason::Other("clock not synchronised"));
				return;
			}
		};

		let hello = self.hello(now);
		let ctx = self.handshake_context(peer, &hello, now);
		match peer.advance_handshake(Some(&msg), &ctx) {
			Ok((outgoing, status)) => {
				if let Some(reply) = outgoing {
					if !self.send(peer, &reply) {
						return;
					}
				}
				if status == Status::Completed {
					self.on_handshake_completed(peer, now);
				}
			}
			Err(handshake::Error::SelfConnection) => {
				if peer.link().is_outbound() {
					self.known.note_self(peer.address().clone());
				} else {
					self.drop_self_dialer(peer);
				}
				peer.disconnect_with_reason(DisconnectReason::SelfConnection);
			}
			Err(handshake::Error::Unexpected { state, got }) => {
				debug!("{}: unexpected message type {:?} in state {}", peer, got, state);
				peer.disconnect_with_reason(DisconnectReason::UnexpectedHandshakeMessage);
			}
			Err(e) => peer.disconnect_with_reason(DisconnectReason::Handshake(e)),
		}
	}

	/// The inbound end of a connection to ourselves was detected, find and
	/// drop the outbound end.
	fn drop_self_dialer(&self, inbound: &Peer) {
		let dialer = self.peers.connected().iter()
			.find(|p| p.link().is_outbound() && p.local_addr() == Some(inbound.socket_addr()))
			.cloned();
		if let Some(dialer) = dialer {
			self.known.note_self(dialer.address().clone());
			dialer.disconnect_with_reason(DisconnectReason::SelfConnection);
		}
	}

	fn on_handshake_completed(&self, peer: &Arc<Peer>, now: Timestamp) {
		match self.peers.add_handshaked(peer, self.config.min_outbound_peers) {
			Ok(true) => {}
			Ok(false) => return,
			Err(Rejection::Duplicate(existing)) => {
				debug!("{}: same node as {}", peer, existing);
				peer.disconnect_with_reason(DisconnectReason::ExistingConnection);
				return;
			}
			Err(Rejection::OutboundFull) => {
				peer.disconnect_with_reason(DisconnectReason::OutboundLimit);
				return;
			}
		}

		info!("{}: handshake completed", peer);
		peer.start_pinging(now);

		if peer.link().is_outbound() {
			self.known.mark_connected(peer.address(), now);

			if let Some(tip) = self.controller.chain_tip() {
				if !self.send(peer, &Message::Height(tip)) {
					return;
				}
			}
			if !self.send(peer, &self.build_peers_message(peer)) {
				return;
			}
			if !self.send(peer, &Message::GetPeers) {
				return;
			}
		}

		self.controller.on_handshake_completed(peer);
	}

	fn on_message(&self, peer: &Arc<Peer>, msg: Message) {
		match msg {
			Message::Hello(_) | Message::Challenge { .. } | Message::Response { .. } => {
				peer.disconnect_with_reason(DisconnectReason::UnexpectedHandshakeMessage);
			}
			Message::Ping { id } => {
				self.send(peer, &pingpong::handle_ping(id));
			}
			Message::GetPeers => {
				self.send(peer, &self.build_peers_message(peer));
			}
			Message::PeersV2(entries) => self.on_peers(peer, &entries),
			Message::Height(tip) => {
				trace!("{}: chain tip at height {}", peer, tip.height);
				peer.set_chain_tip(tip.clone());
				self.forward(peer, Message::Height(tip));
			}
			msg => self.forward(peer, msg),
		}
	}

	/// Hand a message to the controller.
	fn forward(&self, peer: &Arc<Peer>, msg: Message) {
		let name = msg.name();
		if let Err(e) = self.controller.on_message(peer, msg) {
			warn!("{}: controller failed to handle {}: {}", peer, name, e);
		}
	}

	fn on_peers(&self, peer: &Peer, entries: &[String]) {
		if self.config.is_fixed_network() {
			return;
		}

		let mut addresses = Vec::with_capacity(entries.len());
		for (i, entry) in entries.iter().enumerate() {
			let address = match entry.parse::<PeerAddress>() {
				Ok(a) => a,
				Err(e) => {
					trace!("{}: skipping peer entry: {}", peer, e);
					continue;
				}
			};

			if i == 0 && address.host() == SELF_ENTRY_HOST {
				// We dialed this peer, so we know it already.
				if peer.link().is_inbound() {
					let host = peer.socket_addr().ip().to_string();
					addresses.push(PeerAddress::new(host, address.port()));
				}
				continue;
			}
			addresses.push(address);
		}

		let res = self.known.merge(ADDED_BY_PEER_EXCHANGE, self.now(), addresses, false);
		if let Err(e) = res {
			warn!("{}: failed to merge peers: {}", peer, e);
		}
	}

	/// The PEERS_V2 message for the peer: ourselves, then the peers we
	/// recently connected to.
	fn build_peers_message(&self, peer: &Peer) -> Message {
		let mut entries = vec![format!("{}:{}", SELF_ENTRY_HOST, self.local_addr.port())];
		if let Some(now) = self.now() {
			let include_local = peer.address().is_local();
			let recent = self.known.recent_addresses(
				now,
				self.config.recent_connection_threshold,
				include_local,
			);
			entries.extend(recent.iter().map(ToString::to_string));
		}
		Message::PeersV2(entries)
	}

	// Periodic jobs ///////////////////////////////////////////////////////////

	fn ping(&self, peer: &Peer) {
		let start = Instant::now();
		match peer.request(Message::Ping { id: 0 }, self.config.response_timeout) {
			Ok(_) => {
				let rtt = start.elapsed();
				trace!("{}: ping took {:?}", peer, rtt);
				peer.record_ping(rtt, self.config.max_recorded_latencies);
			}
			Err(Error::PeerDisconnected(_)) => {}
			Err(e) => {
				debug!("{}: ping failed: {}", peer, e);
				peer.disconnect_with_reason(DisconnectReason::PeerTimeout("ping"));
			}
		}
	}

	fn broadcast(&self, f: impl Fn(&Arc<Peer>) -> Option<Message>) {
		for peer in self.peers.handshaked().iter() {
			if let Some(msg) = f(peer) {
				// A failing peer is disconnected, the others still get theirs.
				self.send(peer, &msg);
			}
		}
	}

	fn broadcast_peer_info(&self) {
		let tip = self.controller.chain_tip();
		self.broadcast(|peer| Some(self.build_peers_message(peer)));
		if let Some(tip) = tip {
			self.broadcast(|_| Some(Message::Height(tip.clone())));
		}
	}

	fn maintain(&self, now: Timestamp) {
		for peer in self.peers.connected().iter() {
			if !peer.is_handshaked() {
				if time::has_elapsed(peer.connected_at(), now, self.config.handshake_timeout) {
					let status = peer.handshake_status();
					peer.disconnect_with_reason(DisconnectReason::HandshakeTimeout(status));
				}
			} else if let Some(max_age) = peer.max_age() {
				if time::has_elapsed(peer.connected_at(), now, max_age) {
					peer.disconnect_with_reason(DisconnectReason::ConnectionAge);
				}
			}
		}

		let pruned = self.prune_peers();
		if pruned > 0 {
			debug!("Pruned {} old peer(s)", pruned);
		}
	}

	fn prune_peers(&self) -> usize {
		if self.config.is_fixed_network() {
			return 0;
		}
		match self.now() {
			Some(now) => self.known.prune(
				now,
				self.config.old_peer_attempted_period,
				self.config.old_peer_connection_period,
				|a| self.is_connected_to(a),
			),
			None => 0,
		}
	}

	fn peer_misbehaved(&self, peer: &Peer) {
		if let Some(now) = self.now() {
			debug!("{}: marking misbehaved", peer);
			self.known.mark_misbehaved(peer.address(), now);
		}
	}

	// Task production /////////////////////////////////////////////////////////

	fn produce_dispatch(self: &Arc<Self>) -> Option<Task> {
		let peers = self.peers.connected();
		if peers.is_empty() {
			return None;
		}
		let start = self.dispatch_cursor.fetch_add(1, Ordering::Relaxed) % peers.len();
		for i in 0..peers.len() {
			let peer = &peers[(start + i) % peers.len()];
			if let Some(msg) = peer.next_message() {
				let inner = self.clone();
				let peer = peer.clone();
				return Some(Task::new("dispatch", move || inner.dispatch(&peer, msg)));
			}
		}
		None
	}

	fn produce_ping(self: &Arc<Self>, now: Timestamp) -> Option<Task> {
		let peers = self.peers.handshaked();
		let peer = peers.iter().find(|p| p.ping_due(now, self.config.ping_interval))?.clone();
		let inner = self.clone();
		Some(Task::new("ping", move || inner.ping(&peer)))
	}

	fn produce_connect(self: &Arc<Self>, now: Timestamp) -> Option<Task> {
		if self.peers.outbound_handshaked().len() >= self.config.min_outbound_peers
			|| self.peers.connected().len() >= self.config.max_peers
		{
			return None;
		}
		if !claim(&self.next_connect, now, self.config.connect_retry_delay) {
			return None;
		}

		let record = self.known.select_candidate(now, self.config.connect_backoff, |a| {
			self.is_connected_to(a)
		})?;
		let inner = self.clone();
		Some(Task::new("connect", move || {
			if let Err(e) = inner.connect_peer(record.address.clone(), false) {
				debug!("Failed to connect to {}: {}", record.address, e);
			}
		}))
	}

	fn produce_broadcast(self: &Arc<Self>, now: Timestamp) -> Option<Task> {
		if !claim(&self.next_broadcast, now, self.config.broadcast_interval) {
			return None;
		}
		let inner = self.clone();
		Some(Task::new("broadcast", move || inner.broadcast_peer_info()))
	}

	fn produce_maintenance(self: &Arc<Self>, now: Timestamp) -> Option<Task> {
		if !claim(&self.next_maintenance, now, self.config.maintenance_interval) {
			return None;
		}
		let inner = self.clone();
		Some(Task::new("maintenance", move || inner.maintain(now)))
	}

	fn produce_io(self: &Arc<Self>, can_block: bool) -> Option<Task> {
		let timeout = if can_block {
			self.config.poll_timeout
		} else {
			Duration::from_millis(0)
		};
		let ready = match self.mux.try_next(timeout) {
			Ok(Some(r)) => r,
			Ok(None) => return None,
			Err(e) => {
				warn!("Polling sockets failed: {}", e);
				return None;
			}
		};

		if ready.token == LISTENER_TOKEN {
			if self.accepting.swap(true, Ordering::AcqRel) {
				return None;
			}
			let inner = self.clone();
			return Some(Task::new("accept", move || inner.accept()));
		}

		// Events for peers that are gone are dropped. Whatever an event is
		// dropped for here, the task in flight re-arms the socket when done.
		let peer = self.peers.find_by_token(ready.token)?;
		if ready.writable && peer.begin_write() {
			return Some(Task::new("write", move || {
				let _ = peer.write_available();
				peer.end_write();
			}));
		}
		if ready.readable && peer.begin_read() {
			return Some(Task::new("read", move || {
				let _ = peer.read_available();
				peer.end_read();
			}));
		}
		None
	}
}

impl Producer for Inner {
	fn produce_task(&self, can_block: bool) -> Option<Task> {
		if self.shutting_down.load(Ordering::SeqCst) {
			return None;
		}
		let inner = self.me.upgrade()?;

		if let Some(task) = inner.produce_dispatch() {
			return Some(task);
		}
		if let Some(now) = self.now() {
			let task = inner
				.produce_ping(now)
				.or_else(|| inner.produce_connect(now))
				.or_else(|| inner.produce_broadcast(now))
				.or_else(|| inner.produce_maintenance(now));
			if task.is_some() {
				return task;
			}
		}
		inner.produce_io(can_block)
	}

	fn wake(&self) {
		if let Err(e) = self.mux.wake() {
			warn!("Failed to wake poller: {}", e);
		}
	}
}

impl Hooks for Inner {
	fn peer_disconnected(&self, peer: &Peer, reason: &DisconnectReason) {
		self.peers.remove(peer.id());
		if !reason.is_transient() {
			self.peer_misbehaved(peer);
		}
		if self.peers.connected().len() < self.config.max_peers {
			self.set_accepting(true);
		}
		self.controller.on_disconnect(peer, reason);
	}

	fn message_queued(&self, _peer: &Peer) {
		self.wake();
	}
}

/// The peer-to-peer network.
pub struct Network {
	inner: Arc<Inner>,
	scheduler: Scheduler<Arc<Inner>>,
}

impl Network {
	/// Set up the network and bind the listening socket.
	///
	/// Known peers are loaded from the store, or taken from the fixed network
	/// if one is configured. No threads run until [Network::start].
	pub fn new(
		config: Config,
		identity: Identity,
		store: Arc<dyn Store>,
		controller: Arc<dyn Controller>,
		clock: Arc<dyn Clock>,
	) -> Result<Network, Error> {
		let mux = Arc::new(Multiplexer::new()?);
		let mut socket = TcpListener::bind(config.bind_address)?;
		let local_addr = socket.local_addr()?;
		mux.register(&mut socket, LISTENER_TOKEN, mio::Interest::READABLE)?;

		let known = KnownPeers::new(store, config.max_self_peers);
		let now = clock.now();
		if config.is_fixed_network() {
			known.seed(&config.fixed_network, now, ADDED_BY_FIXED_NETWORK);
		} else {
			let loaded = known.load()?;
			debug!("Loaded {} known peer(s)", loaded);
			if loaded == 0 && !config.initial_peers.is_empty() {
				known.merge(ADDED_BY_INITIAL, now, config.initial_peers.iter().cloned(), true)?;
			}
		}

		let codec = Codec::new(config.magic, config.max_message_size);
		let max_worker_threads = config.max_worker_threads;
		let inner = Arc::new_cyclic(|me: &Weak<Inner>| {
			let hooks: Weak<dyn Hooks> = me.clone();
			let peer_ctx = Arc::new(PeerContext {
				codec,
				mux: mux.clone(),
				hooks,
				max_send_buffer: config.max_send_buffer,
				in_buf_size_limit: config.in_buf_size_limit,
				max_pending_messages: config.max_pending_messages,
			});
			Inner {
				me: me.clone(),
				config,
				identity,
				clock,
				controller,
				mux,
				listener: Mutex::new(Listener {
					socket,
					registered: true,
				}),
				local_addr,
				accepting: AtomicBool::new(false),
				known,
				peers: PeerViews::new(),
				peer_ctx,
				peer_seq: AtomicU64::new(0),
				dispatch_cursor: AtomicUsize::new(0),
				next_connect: Mutex::new(0),
				next_broadcast: Mutex::new(0),
				next_maintenance: Mutex::new(0),
				shutting_down: AtomicBool::new(false),
			}
		});

		let scheduler = Scheduler::new("p2p", inner.clone(), max_worker_threads);
		Ok(Network { inner, scheduler })
	}

	/// Start the worker threads.
	pub fn start(&self) -> Result<(), Error> {
		info!("Listening on {} as node {}", self.inner.local_addr, self.inner.identity.node_id());
		self.scheduler.start()?;
		Ok(())
	}

	/// Stop accepting, let running tasks finish for the configured grace
	/// period and close all connections.
	pub fn shutdown(&self) {
		if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
			return;
		}
		info!("Shutting down network");
		self.inner.set_accepting(false);
		if !self.scheduler.shutdown(self.inner.config.shutdown_grace) {
			warn!("Some tasks didn't finish within {:?}", self.inner.config.shutdown_grace);
		}
		for peer in self.inner.peers.connected().iter() {
			peer.shutdown();
		}
	}

	/// The address we accept connections on.
	pub fn local_addr(&self) -> net::SocketAddr {
		self.inner.local_addr
	}

	pub fn node_id(&self) -> &str {
		self.inner.identity.node_id()
	}

	pub fn public_key(&self) -> &[u8; 32] {
		self.inner.identity.public_key()
	}

	pub fn config(&self) -> &Config {
		&self.inner.config
	}

	pub fn known_peers(&self) -> Arc<Vec<PeerRecord>> {
		self.inner.known.snapshot()
	}

	pub fn connected_peers(&self) -> Arc<Vec<Arc<Peer>>> {
		self.inner.peers.connected()
	}

	pub fn handshaked_peers(&self) -> Arc<Vec<Arc<Peer>>> {
		self.inner.peers.handshaked()
	}

	pub fn outbound_handshaked_peers(&self) -> Arc<Vec<Arc<Peer>>> {
		self.inner.peers.outbound_handshaked()
	}

	/// Addresses that turned out to lead to ourselves.
	pub fn self_peers(&self) -> Vec<PeerAddress> {
		self.inner.known.self_peers()
	}

	/// Connect to a peer right away.
	///
	/// Returns once the connection is set up; the handshake continues in the
	/// background. The connection is kept even when it takes the number of
	/// outbound handshaked peers over [Config::min_outbound_peers], see
	/// [Peer::is_requested].
	pub fn connect_peer(&self, address: PeerAddress) -> Result<Arc<Peer>, Error> {
		self.inner.connect_peer(address, true)
	}

	/// Add peers we don't know yet, returning whether any were new.
	///
	/// Nothing is merged while a fixed network is configured.
	pub fn merge_peers(&self, added_by: &str, addresses: Vec<PeerAddress>) -> Result<bool, Error> {
		if self.inner.config.is_fixed_network() {
			return Ok(false);
		}
		self.inner.known.merge(added_by, self.inner.now(), addresses, true)
	}

	/// Forget a peer and drop our connections to it.
	pub fn forget_peer(&self, address: &PeerAddress) -> Result<bool, Error> {
		let known = self.inner.known.forget(address)?;
		for peer in self.inner.peers.connected().iter().filter(|p| p.address() == address) {
			peer.disconnect_with_reason(DisconnectReason::Forgotten);
		}
		Ok(known)
	}

	/// Forget all peers and drop all connections.
	pub fn forget_all_peers(&self) -> Result<usize, Error> {
		let n = self.inner.known.forget_all()?;
		for peer in self.inner.peers.connected().iter() {
			peer.disconnect_with_reason(DisconnectReason::Forgotten);
		}
		Ok(n)
	}

	/// Delete old records of peers we keep failing to connect to.
	pub fn prune_peers(&self) -> usize {
		self.inner.prune_peers()
	}

	/// Stamp the peer's record as misbehaved.
	pub fn peer_misbehaved(&self, peer: &Peer) {
		self.inner.peer_misbehaved(peer)
	}

	/// The PEERS_V2 message we'd send to the peer.
	pub fn build_peers_message(&self, peer: &Peer) -> Message {
		self.inner.build_peers_message(peer)
	}

	/// Send a message to every handshaked peer, as built by `f`.
	///
	/// Peers that fail are disconnected without affecting the others.
	pub fn broadcast(&self, f: impl Fn(&Arc<Peer>) -> Option<Message>) {
		self.inner.broadcast(f)
	}

	pub fn stats(&self) -> scheduler::Stats {
		self.scheduler.stats()
	}
}

impl Drop for Network {
	fn drop(&mut self) {
		self.shutdown();
	}
}
