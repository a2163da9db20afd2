#![allow(dead_code)]

pub mod prelude;
use prelude::*;

use std::error;
use std::sync::Once;

use chain_p2p::constants::PROTOCOL_VERSION;
use chain_p2p::controller::Controller;
use chain_p2p::peer::Peer;
use parking_lot::Mutex;

static LOGGER: Once = Once::new();

pub fn setup_logger() {
	LOGGER.call_once(|| {
		fern::Dispatch::new()
			.format(|out, message, record| {
				out.finish(format_args!(
					"{}[{}][{}] {}",
					chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S%.3f]"),
					record.target(),
					record.level(),
					message
				))
			})
			.level(log::LevelFilter::Debug)
			.level_for("mio", log::LevelFilter::Info)
			.chain(std::io::stdout())
			.apply()
			.expect("logger");
	});
}

/// A config for a node on localhost that doesn't reach out by itself.
pub fn test_config() -> Config {
	Config {
		bind_address: "127.0.0.1:0".parse().unwrap(),
		min_outbound_peers: 0,
		connect_retry_delay: Duration::from_millis(100),
		poll_timeout: Duration::from_millis(100),
		maintenance_interval: Duration::from_millis(200),
		max_worker_threads: 8,
		shutdown_grace: Duration::from_secs(2),
		..Default::default()
	}
}

/// Records what the network tells it and echoes application requests.
#[derive(Default)]
pub struct TestController {
	pub handshakes: Mutex<usize>,
	pub disconnects: Mutex<Vec<String>>,
	pub messages: Mutex<Vec<Message>>,
}

impl TestController {
	/// Whether some peer was disconnected for a reason starting with `reason`.
	pub fn disconnected_with(&self, reason: &str) -> bool {
		self.disconnects.lock().iter().any(|r| r.starts_with(reason))
	}
}

impl Controller for TestController {
	fn on_message(
		&self,
		peer: &Arc<Peer>,
		msg: Message,
	) -> Result<(), Box<dyn error::Error + Send + Sync>> {
		self.messages.lock().push(msg.clone());
		if let Message::Other { kind, id: Some(id), payload } = msg {
			peer.send(&Message::Other { kind, id: Some(id), payload })?;
		}
		Ok(())
	}

	fn on_handshake_completed(&self, _peer: &Arc<Peer>) {
		*self.handshakes.lock() += 1;
	}

	fn on_disconnect(&self, _peer: &Peer, reason: &DisconnectReason) {
		self.disconnects.lock().push(reason.to_string());
	}
}

pub struct Node {
	pub network: Network,
	pub controller: Arc<TestController>,
	pub store: MemoryStore,
}

impl Node {
	pub fn address(&self) -> PeerAddress {
		PeerAddress::from_socket_addr(self.network.local_addr())
	}
}

pub fn start_node(config: Config, store: MemoryStore, clock: Arc<dyn Clock>) -> Node {
	setup_logger();
	let controller = Arc::new(TestController::default());
	let network = Network::new(
		config,
		Identity::generate(),
		Arc::new(store.clone()),
		controller.clone(),
		clock,
	).unwrap();
	network.start().unwrap();
	Node { network, controller, store }
}

pub fn start_default_node() -> Node {
	start_node(test_config(), MemoryStore::new(), Arc::new(SystemClock))
}

/// Wait up to ten seconds for the condition to hold.
pub fn wait_until(f: impl Fn() -> bool) -> bool {
	let start = Instant::now();
	while start.elapsed() < Duration::from_secs(10) {
		if f() {
			return true;
		}
		thread::sleep(Duration::from_millis(20));
	}
	false
}

pub fn now() -> u64 {
	SystemClock.now().unwrap()
}

/// Connect `from` to `to` and wait for both sides to complete the handshake.
pub fn connect_nodes(from: &Node, to: &Node) {
	from.network.connect_peer(to.address()).unwrap();
	assert!(wait_until(|| {
		from.network.handshaked_peers().len() == 1 && to.network.handshaked_peers().len() == 1
	}));
}

/// A HELLO from the node with the given id.
pub fn hello(node_id: &str, timestamp: u64) -> Message {
	Message::Hello(Hello {
		timestamp: timestamp as i64,
		protocol_version: PROTOCOL_VERSION,
		version: "raw-client".into(),
		listen_port: 0,
		node_id: node_id.to_owned(),
	})
}

/// A bare TCP client speaking the wire protocol by hand.
pub struct RawClient {
	pub stream: net::TcpStream,
	codec: Codec,
	buf: Vec<u8>,
}

impl RawClient {
	pub fn connect(addr: net::SocketAddr) -> RawClient {
		let stream = net::TcpStream::connect(addr).unwrap();
		stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
		RawClient {
			stream,
			codec: Codec::new(Config::default().magic, 1024 * 1024),
			buf: Vec::new(),
		}
	}

	pub fn send(&mut self, msg: &Message) {
		let bytes = self.codec.serialize(msg);
		self.stream.write_all(&bytes).unwrap();
	}

	/// Complete the handshake as the dialing side, returning the node's
	/// public key.
	pub fn handshake(&mut self, identity: &Identity, now: u64) -> [u8; 32] {
		self.send(&hello(identity.node_id(), now));
		match self.recv() {
			Some(Message::Hello(_)) => {}
			m => panic!("expected HELLO, got {:?}", m),
		}

		let challenge: [u8; 32] = rand::random();
		self.send(&Message::Challenge {
			public_key: *identity.public_key(),
			challenge,
		});
		let (public_key, their_challenge) = match self.recv() {
			Some(Message::Challenge { public_key, challenge }) => (public_key, challenge),
			m => panic!("expected CHALLENGE, got {:?}", m),
		};

		let signature = identity.prove(&public_key, &their_challenge).unwrap();
		self.send(&Message::Response { signature });
		match self.recv() {
			Some(Message::Response { signature }) => {
				assert!(identity.verify(&public_key, &challenge, &signature));
			}
			m => panic!("expected RESPONSE, got {:?}", m),
		}
		public_key
	}

	/// Read the next message, or [None] when the connection is closed.
	pub fn recv(&mut self) -> Option<Message> {
		loop {
			if let Some((msg, len)) = self.codec.decode(&self.buf).unwrap() {
				self.buf.drain(..len);
				return Some(msg);
			}
			let mut chunk = [0u8; 4096];
			match self.stream.read(&mut chunk) {
				Ok(0) | Err(_) => return None,
				Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
			}
		}
	}
}
