
mod common;
use common::*;
use common::prelude::*;

/// Accept a connection within the timeout.
fn accept(listener: &net::TcpListener, timeout: Duration) -> Option<net::TcpStream> {
	let start = Instant::now();
	while start.elapsed() < timeout {
		match listener.accept() {
			Ok((stream, _)) => return Some(stream),
			Err(_) => thread::sleep(Duration::from_millis(10)),
		}
	}
	None
}

#[test]
fn fixed_network() {
	let listener = net::TcpListener::bind("127.0.0.1:0").unwrap();
	listener.set_nonblocking(true).unwrap();
	let fixed = PeerAddress::from_socket_addr(listener.local_addr().unwrap());

	let mut config = test_config();
	config.min_outbound_peers = 1;
	config.fixed_network = vec![fixed.clone()];
	// Stored peers are ignored in favour of the fixed network.
	let store = MemoryStore::with_records(vec![
		PeerRecord::new(PeerAddress::new("203.0.113.5", 12392), None, "test"),
	]);
	let node = start_node(config, store, Arc::new(SystemClock));

	let known = node.network.known_peers();
	assert_eq!(known.len(), 1);
	assert_eq!(known[0].address, fixed);

	// One attempt, and the silent peer is kept while its handshake runs.
	let _conn = accept(&listener, Duration::from_secs(5)).expect("no connection attempt");
	assert!(wait_until(|| node.network.known_peers()[0].last_attempted.is_some()));
	assert!(accept(&listener, Duration::from_millis(500)).is_none());
	assert_eq!(node.network.connected_peers().len(), 1);

	// Gossip and manual additions don't change the list.
	let merged = node.network.merge_peers("test", vec![PeerAddress::new("198.51.100.7", 12392)]);
	assert_eq!(merged.unwrap(), false);
	assert_eq!(node.network.known_peers().len(), 1);
	assert_eq!(node.network.prune_peers(), 0);
}
