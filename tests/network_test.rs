
mod common;
use common::*;
use common::prelude::*;

#[test]
fn request_reply() {
	let a = start_default_node();
	let b = start_default_node();
	connect_nodes(&a, &b);

	let peer = a.network.handshaked_peers()[0].clone();
	assert!(peer.link().is_outbound());
	assert_eq!(peer.public_key(), Some(*b.network.public_key()));

	let request = Message::Other { kind: 0x80 | 50, id: None, payload: vec![1, 2, 3] };
	let reply = peer.request(request, Duration::from_secs(3)).unwrap();
	match reply {
		Message::Other { kind, id, payload } => {
			assert_eq!(kind, 0x80 | 50);
			assert!(id.is_some());
			assert_eq!(payload, vec![1, 2, 3]);
		}
		m => panic!("unexpected reply {:?}", m),
	}
	// Replies are routed to the requester, not to the controller.
	assert!(a.controller.messages.lock().iter().all(|m| m.kind() != 0x80 | 50));
	assert_eq!(peer.pending_requests(), 0);

	// Without the id flag there's no correlation.
	let plain = Message::Other { kind: 50, id: None, payload: vec![] };
	assert!(peer.request(plain, Duration::from_secs(1)).is_err());
}

#[test]
fn duplicate_connection() {
	let a = start_default_node();
	let b = start_default_node();
	connect_nodes(&a, &b);

	a.network.connect_peer(b.address()).unwrap();
	assert!(wait_until(|| {
		a.controller.disconnected_with("existing connection")
			|| b.controller.disconnected_with("existing connection")
	}));
	assert!(wait_until(|| {
		a.network.connected_peers().len() == 1 && b.network.connected_peers().len() == 1
	}));
	assert_eq!(a.network.handshaked_peers().len(), 1);
	assert_eq!(b.network.handshaked_peers().len(), 1);
}

#[test]
fn self_connection() {
	let a = start_default_node();
	a.network.connect_peer(a.address()).unwrap();

	assert!(wait_until(|| a.network.self_peers().contains(&a.address())));
	assert!(wait_until(|| a.network.connected_peers().is_empty()));
	assert!(a.controller.disconnected_with("connected to self"));
	assert_eq!(*a.controller.handshakes.lock(), 0);
}

#[test]
fn peer_exchange() {
	let now = now();
	let hour = 60 * 60 * 1000;

	let far = PeerAddress::new("203.0.113.5", 12392);
	let mut record = PeerRecord::new(far.clone(), Some(now - 2 * hour), "test");
	record.last_attempted = Some(now - hour);
	record.last_connected = Some(now - hour);
	let b = start_node(test_config(), MemoryStore::with_records(vec![record]), Arc::new(SystemClock));

	let mut config = test_config();
	config.min_outbound_peers = 1;
	let a_store = MemoryStore::with_records(vec![PeerRecord::new(b.address(), Some(now), "test")]);
	let a = start_node(config, a_store, Arc::new(SystemClock));

	assert!(wait_until(|| a.network.known_peers().iter().any(|r| r.address == far)));
	assert!(a.store.get(&far).is_some());
	assert_eq!(a.network.outbound_handshaked_peers().len(), 1);

	// The dialing side was stamped as connected.
	let record = a.store.get(&b.address()).unwrap();
	assert!(record.last_connected.is_some());
	assert!(record.last_connected >= record.last_attempted);

	// B learned where A listens from the self entry.
	let a_listen = PeerAddress::new("127.0.0.1", a.network.local_addr().port());
	assert!(wait_until(|| b.network.known_peers().iter().any(|r| r.address == a_listen)));
}

#[test]
fn forget_disconnects() {
	let a = start_default_node();
	let b = start_default_node();
	a.network.merge_peers("test", vec![b.address()]).unwrap();
	connect_nodes(&a, &b);

	assert!(a.network.forget_peer(&b.address()).unwrap());
	assert!(wait_until(|| a.network.connected_peers().is_empty()));
	assert!(a.controller.disconnected_with("peer forgotten"));
	assert!(a.network.known_peers().is_empty());
}

#[test]
fn shutdown_closes_connections() {
	let a = start_default_node();
	let b = start_default_node();
	connect_nodes(&a, &b);

	a.network.shutdown();
	assert!(a.network.connected_peers().is_empty());
	assert!(wait_until(|| b.network.connected_peers().is_empty()));
	assert_eq!(a.network.stats().active_threads, 0);
	assert!(a.network.connect_peer(b.address()).is_err());
}

#[test]
fn outbound_limit() {
	let targets = (0..3).map(|_| start_default_node()).collect::<Vec<_>>();
	let now = now();
	let store = MemoryStore::with_records(
		targets.iter().map(|n| PeerRecord::new(n.address(), Some(now), "test")),
	);

	// Dial as fast as possible so that several handshakes race.
	let mut config = test_config();
	config.min_outbound_peers = 1;
	config.connect_retry_delay = Duration::from_millis(0);
	let a = start_node(config, store, Arc::new(SystemClock));

	assert!(wait_until(|| a.network.outbound_handshaked_peers().len() == 1));
	for _ in 0..50 {
		assert!(a.network.outbound_handshaked_peers().len() <= 1);
		thread::sleep(Duration::from_millis(20));
	}
	assert_eq!(a.network.outbound_handshaked_peers().len(), 1);
	let losers = a.controller.disconnects.lock().clone();
	assert!(losers.iter().all(|r| r == "outbound connection limit reached"), "{:?}", losers);

	// Explicitly requested connections don't count against the limit.
	let extra = start_default_node();
	let peer = a.network.connect_peer(extra.address()).unwrap();
	assert!(peer.is_requested());
	assert!(wait_until(|| a.network.outbound_handshaked_peers().len() == 2));
	assert!(peer.is_handshaked());
}

#[test]
fn inbound_capacity() {
	let mut config = test_config();
	config.max_peers = 1;
	let node = start_node(config, MemoryStore::new(), Arc::new(SystemClock));
	let addr = node.network.local_addr();

	let first = RawClient::connect(addr);
	assert!(wait_until(|| node.network.connected_peers().len() == 1));

	// Full, the connection is closed right away.
	let mut second = RawClient::connect(addr);
	let start = Instant::now();
	assert!(second.recv().is_none());
	assert!(start.elapsed() < Duration::from_secs(4));
	assert_eq!(node.network.connected_peers().len(), 1);

	// A free slot opens the door again.
	drop(first);
	assert!(wait_until(|| node.network.connected_peers().is_empty()));
	let mut third = RawClient::connect(addr);
	third.send(&hello(Identity::generate().node_id(), now()));
	match third.recv() {
		Some(Message::Hello(_)) => {}
		m => panic!("expected HELLO, got {:?}", m),
	}
	assert_eq!(node.network.connected_peers().len(), 1);
}
