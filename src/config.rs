use std::net;
use std::time::Duration;

use crate::addrmgr::PeerAddress;
use crate::constants;

/// Configuration options for the peer network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
	/// The message magic identifying the network.
	///
	/// Default value: [constants::MAINNET_MAGIC].
	pub magic: [u8; 4],

	/// The address to listen on for inbound connections.
	///
	/// Default value: 0.0.0.0:12392.
	pub bind_address: net::SocketAddr,

	/// The protocol version to advertise to peers.
	///
	/// Default value: [constants::PROTOCOL_VERSION].
	pub protocol_version: u32,

	/// The oldest protocol version accepted from peers.
	///
	/// Default value: [constants::MIN_PROTOCOL_VERSION].
	pub min_protocol_version: u32,

	/// The version string to advertise to peers.
	///
	/// Default value: "chain-p2p-" followed by the crate version.
	pub version_string: String,

	/// The maximum number of connected peers, inbound and outbound.
	///
	/// Default value: 32.
	pub max_peers: usize,

	/// The number of outbound handshaked peers we try to maintain.
	///
	/// Default value: 16.
	pub min_outbound_peers: usize,

	/// When not empty, only these peers are connected to or accepted and
	/// peer-exchange gossip is ignored.
	///
	/// Default value: empty.
	pub fixed_network: Vec<PeerAddress>,

	/// Peers to seed the known-peer list with when it is empty.
	///
	/// Default value: empty.
	pub initial_peers: Vec<PeerAddress>,

	/// Timeout for outbound connection attempts.
	///
	/// Default value: 2 seconds.
	pub connect_timeout: Duration,

	/// Timeout for replies to requests, including pings.
	///
	/// Default value: 3 seconds.
	pub response_timeout: Duration,

	/// The interval at which to ping handshaked peers.
	///
	/// Default value: 20 seconds.
	pub ping_interval: Duration,

	/// Time allowed from connection to a completed handshake.
	///
	/// Default value: 60 seconds.
	pub handshake_timeout: Duration,

	/// Maximum difference between a peer's HELLO timestamp and our clock.
	///
	/// Default value: 30 seconds.
	pub max_clock_drift: Duration,

	/// The interval at which we broadcast our chain tip and peers.
	///
	/// Default value: 1 minute.
	pub broadcast_interval: Duration,

	/// How long a peer whose last connection attempt failed is skipped.
	///
	/// Default value: 5 minutes.
	pub connect_backoff: Duration,

	/// Minimum delay between outbound connection attempts.
	///
	/// Default value: 1 second.
	pub connect_retry_delay: Duration,

	/// Peers connected to within this period are shared in peer-exchange.
	///
	/// Default value: 24 hours.
	pub recent_connection_threshold: Duration,

	/// Known peers attempted within this period but not connected to within
	/// `old_peer_connection_period` are pruned.
	///
	/// Default value: 24 hours.
	pub old_peer_attempted_period: Duration,

	/// See `old_peer_attempted_period`.
	///
	/// Default value: 7 days.
	pub old_peer_connection_period: Duration,

	/// The interval at which stuck handshakes and old peers are pruned.
	///
	/// Default value: 10 seconds.
	pub maintenance_interval: Duration,

	/// The maximum size of a message frame, header included.
	///
	/// Default value: 10 MiB.
	pub max_message_size: usize,

	/// The maximum number of unsent bytes we queue for a peer.
	///
	/// Default value: 16 MiB.
	pub max_send_buffer: usize,

	/// Read buffers are shrunk to this size when they grow over it.
	///
	/// Default value: 1 MiB.
	pub in_buf_size_limit: usize,

	/// The maximum size of the pending messages queue for each peer.
	///
	/// Default value: 25.
	pub max_pending_messages: usize,

	/// The maximum number of worker threads.
	///
	/// Default value: 32.
	pub max_worker_threads: usize,

	/// The number of self-connection addresses we remember.
	///
	/// Default value: 64.
	pub max_self_peers: usize,

	/// The number of latencies to keep track of when calculating
	/// average peer latencies.
	///
	/// Default value: 64.
	pub max_recorded_latencies: usize,

	/// When set, handshaked peers are disconnected after a random age
	/// between half this value and this value.
	///
	/// Default value: [None].
	pub max_connection_age: Option<Duration>,

	/// How long a worker may block waiting for socket readiness.
	///
	/// Default value: 1 second.
	pub poll_timeout: Duration,

	/// How long in-flight tasks get to finish on shutdown.
	///
	/// Default value: 5 seconds.
	pub shutdown_grace: Duration,
}

impl Config {
	/// The default configuration for the test network.
	pub fn testnet() -> Config {
		Config {
			magic: constants::TESTNET_MAGIC,
			..Default::default()
		}
	}

	/// Whether a fixed network is configured.
	pub fn is_fixed_network(&self) -> bool {
		!self.fixed_network.is_empty()
	}
}

impl Default for Config {
	fn default() -> Config {
		Config {
			magic: constants::MAINNET_MAGIC,
			bind_address: net::SocketAddr::from(([0, 0, 0, 0], constants::DEFAULT_PORT)),
			protocol_version: constants::PROTOCOL_VERSION,
			min_protocol_version: constants::MIN_PROTOCOL_VERSION,
			version_string: concat!("chain-p2p-", env!("CARGO_PKG_VERSION")).to_owned(),
			max_peers: 32,
			min_outbound_peers: 16,
			fixed_network: Vec::new(),
			initial_peers: Vec::new(),
			connect_timeout: Duration::from_secs(2),
			response_timeout: Duration::from_secs(3),
			ping_interval: Duration::from_secs(20),
			handshake_timeout: Duration::from_secs(60),
			max_clock_drift: Duration::from_secs(30),
			broadcast_interval: Duration::from_secs(60),
			connect_backoff: Duration::from_secs(5 * 60),
			connect_retry_delay: Duration::from_secs(1),
			recent_connection_threshold: Duration::from_secs(24 * 60 * 60),
			old_peer_attempted_period: Duration::from_secs(24 * 60 * 60),
			old_peer_connection_period: Duration::from_secs(7 * 24 * 60 * 60),
			maintenance_interval: Duration::from_secs(10),
			max_message_size: 10 * 1024 * 1024,
			max_send_buffer: 16 * 1024 * 1024,
			in_buf_size_limit: 1024 * 1024,
			max_pending_messages: 25,
			max_worker_threads: 32,
			max_self_peers: 64,
			max_recorded_latencies: 64,
			max_connection_age: None,
			poll_timeout: Duration::from_secs(1),
			shutdown_grace: Duration::from_secs(5),
		}
	}
}
