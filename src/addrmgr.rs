//!
//! The known-peer address manager.
//!
//! Keeps the persisted [PeerRecord]s, picks outbound connection candidates,
//! merges peer-exchange gossip and remembers addresses that turned out to be
//! ourselves.
//!

use std::{fmt, io, net};
use std::collections::{HashMap, HashSet};
use std::net::ToSocketAddrs;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use rand::seq::SliceRandom;

use crate::constants::{DEFAULT_PORT, MAX_ADDRESS_LEN};
use crate::peermgr::View;
use crate::time::{self, Timestamp};
use crate::Error;

/// Whether an IP address is loopback, link-local or site-local.
pub fn is_local_ip(ip: &net::IpAddr) -> bool {
	match ip {
		net::IpAddr::V4(ip) => ip.is_loopback() || ip.is_link_local() || ip.is_private(),
		net::IpAddr::V6(ip) => {
			let prefix = ip.segments()[0];
			ip.is_loopback()
				|| prefix & 0xffc0 == 0xfe80 // link-local
				|| prefix & 0xffc0 == 0xfec0 // site-local
				|| prefix & 0xfe00 == 0xfc00 // unique local
		}
	}
}

/// A peer's host and port.
///
/// Equality is textual, no name resolution is involved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddress {
	host: String,
	port: u16,
}

impl PeerAddress {
	/// Create a new address.
	pub fn new(host: impl Into<String>, port: u16) -> PeerAddress {
		PeerAddress {
			host: host.into(),
			port,
		}
	}

	/// The address for a socket address.
	pub fn from_socket_addr(addr: net::SocketAddr) -> PeerAddress {
		PeerAddress::new(addr.ip().to_string(), addr.port())
	}

	/// The host name or IP literal.
	pub fn host(&self) -> &str {
		&self.host
	}

	/// The port.
	pub fn port(&self) -> u16 {
		self.port
	}

	/// Resolve to a socket address, which may block on DNS.
	pub fn to_socket_addr(&self) -> io::Result<net::SocketAddr> {
		(self.host.as_str(), self.port).to_socket_addrs()?.next().ok_or_else(|| {
			io::Error::new(io::ErrorKind::NotFound, format!("can't resolve {}", self))
		})
	}

	/// Whether this is a loopback, link-local or site-local address.
	///
	/// Host names other than `localhost` are not resolved and count as
	/// non-local.
	pub fn is_local(&self) -> bool {
		if self.host.eq_ignore_ascii_case("localhost") {
			return true;
		}
		match self.host.parse::<net::IpAddr>() {
			Ok(ip) => is_local_ip(&ip),
			Err(_) => false,
		}
	}
}

impl fmt::Display for PeerAddress {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.host.contains(':') {
			write!(f, "[{}]:{}", self.host, self.port)
		} else {
			write!(f, "{}:{}", self.host, self.port)
		}
	}
}

impl FromStr for PeerAddress {
	type Err = Error;

	/// Parse `host`, `host:port`, `[ipv6]`, `[ipv6]:port` or a bare IPv6
	/// literal. A missing port means [DEFAULT_PORT].
	fn from_str(s: &str) -> Result<PeerAddress, Error> {
		let invalid = || Error::InvalidAddress(s.to_owned());
		let parse_port = |p: &str| p.parse::<u16>().map_err(|_| invalid());

		let (host, port) = if s.starts_with('[') {
			let end = s.find(']').ok_or_else(invalid)?;
			let rest = &s[end + 1..];
			let port = if rest.is_empty() {
				DEFAULT_PORT
			} else if rest.starts_with(':') {
				parse_port(&rest[1..])?
			} else {
				return Err(invalid());
			};
			(&s[1..end], port)
		} else if s.matches(':').count() > 1 {
			(s, DEFAULT_PORT)
		} else if let Some(i) = s.rfind(':') {
			(&s[..i], parse_port(&s[i + 1..])?)
		} else {
			(s, DEFAULT_PORT)
		};

		if host.is_empty() || host.len() > MAX_ADDRESS_LEN || host.contains(char::is_whitespace) {
			return Err(invalid());
		}
		Ok(PeerAddress::new(host, port))
	}
}

/// Everything we persist about a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
	pub address: PeerAddress,
	/// When we first learned about the peer.
	pub added_when: Option<Timestamp>,
	/// Where we learned about the peer.
	pub added_by: Option<String>,
	pub last_attempted: Option<Timestamp>,
	pub last_connected: Option<Timestamp>,
	pub last_misbehaved: Option<Timestamp>,
}

impl PeerRecord {
	/// A record for a newly learned peer.
	pub fn new(address: PeerAddress, added_when: Option<Timestamp>, added_by: &str) -> PeerRecord {
		PeerRecord {
			address,
			added_when,
			added_by: Some(added_by.to_owned()),
			last_attempted: None,
			last_connected: None,
			last_misbehaved: None,
		}
	}

	/// Whether our last attempt didn't lead to a connection and was made
	/// less than `backoff` ago.
	pub fn recently_failed(&self, now: Timestamp, backoff: Duration) -> bool {
		match self.last_attempted {
			Some(attempted) => {
				let failed = self.last_connected.map_or(true, |c| c < attempted);
				failed && !time::has_elapsed(attempted, now, backoff)
			}
			None => false,
		}
	}

	/// Whether our last attempt succeeded and was within `threshold`.
	pub fn recently_connected(&self, now: Timestamp, threshold: Duration) -> bool {
		match (self.last_attempted, self.last_connected) {
			(Some(attempted), Some(connected)) => {
				connected >= attempted && !time::has_elapsed(connected, now, threshold)
			}
			_ => false,
		}
	}

	/// Whether we keep trying this peer without getting through: attempted
	/// within `attempted_period`, while both the record and the last
	/// connection are older than `connection_period`.
	pub fn is_old(&self, now: Timestamp, attempted_period: Duration, connection_period: Duration) -> bool {
		let attempted_recently = match self.last_attempted {
			Some(a) => !time::has_elapsed(a, now, attempted_period),
			None => false,
		};
		let connected_recently = match self.last_connected {
			Some(c) => !time::has_elapsed(c, now, connection_period),
			None => false,
		};
		let added_long_ago = match self.added_when {
			Some(a) => time::has_elapsed(a, now, connection_period),
			None => true,
		};
		attempted_recently && !connected_recently && added_long_ago
	}
}

/// Persistent storage for [PeerRecord]s.
pub trait Store: Send + Sync + 'static {
	/// Load all records.
	fn load(&self) -> io::Result<Vec<PeerRecord>>;

	/// Insert or replace the record for its address.
	fn save(&self, record: &PeerRecord) -> io::Result<()>;

	/// Delete the record for the address, returning whether there was one.
	fn delete(&self, address: &PeerAddress) -> io::Result<bool>;

	/// Delete all records, returning how many there were.
	fn delete_all(&self) -> io::Result<usize>;
}

/// A [Store] that keeps records in memory.
///
/// Clones share the same records.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
	records: Arc<Mutex<HashMap<PeerAddress, PeerRecord>>>,
}

impl MemoryStore {
	/// Create an empty store.
	pub fn new() -> MemoryStore {
		MemoryStore::default()
	}

	/// Create a store holding the given records.
	pub fn with_records(records: impl IntoIterator<Item = PeerRecord>) -> MemoryStore {
		let map = records.into_iter().map(|r| (r.address.clone(), r)).collect();
		MemoryStore {
			records: Arc::new(Mutex::new(map)),
		}
	}

	/// The stored record for the address.
	pub fn get(&self, address: &PeerAddress) -> Option<PeerRecord> {
		self.records.lock().get(address).cloned()
	}

	/// The number of stored records.
	pub fn len(&self) -> usize {
		self.records.lock().len()
	}
}

impl Store for MemoryStore {
	fn load(&self) -> io::Result<Vec<PeerRecord>> {
		Ok(self.records.lock().values().cloned().collect())
	}

	fn save(&self, record: &PeerRecord) -> io::Result<()> {
		self.records.lock().insert(record.address.clone(), record.clone());
		Ok(())
	}

	fn delete(&self, address: &PeerAddress) -> io::Result<bool> {
		Ok(self.records.lock().remove(address).is_some())
	}

	fn delete_all(&self) -> io::Result<usize> {
		let mut records = self.records.lock();
		let n = records.len();
		records.clear();
		Ok(n)
	}
}

/// All peers we know about.
pub struct KnownPeers {
	records: View<PeerRecord>,
	store: Arc<dyn Store>,
	self_peers: Mutex<LruCache<PeerAddress, ()>>,
	/// Serializes merges, separate from the record list lock.
	merge_lock: Mutex<()>,
}

impl KnownPeers {
	/// Create an empty set backed by `store`.
	pub fn new(store: Arc<dyn Store>, max_self_peers: usize) -> KnownPeers {
		KnownPeers {
			records: View::new(),
			store,
			self_peers: Mutex::new(LruCache::new(max_self_peers.max(1))),
			merge_lock: Mutex::new(()),
		}
	}

	/// Replace the in-memory records with those from the store.
	pub fn load(&self) -> Result<usize, Error> {
		let loaded = self.store.load().map_err(Error::Store)?;
		Ok(self.records.update(|list| {
			*list = loaded;
			list.len()
		}))
	}

	/// Replace the in-memory records with a fixed list, without persisting it.
	pub fn seed(&self, addresses: &[PeerAddress], now: Option<Timestamp>, added_by: &str) {
		let records = dedup(addresses.iter().cloned())
			.into_iter()
			.map(|a| PeerRecord::new(a, now, added_by))
			.collect();
		self.records.update(|list| *list = records);
	}

	/// The current records.
	pub fn snapshot(&self) -> Arc<Vec<PeerRecord>> {
		self.records.snapshot()
	}

	/// The record for the address, if known.
	pub fn get(&self, address: &PeerAddress) -> Option<PeerRecord> {
		self.snapshot().iter().find(|r| &r.address == address).cloned()
	}

	fn save(&self, record: &PeerRecord) {
		if let Err(e) = self.store.save(record) {
			warn!("Failed to save peer {}: {}", record.address, e);
		}
	}

	/// Modify the record for the address and persist it.
	fn modify(&self, address: &PeerAddress, f: impl FnOnce(&mut PeerRecord)) -> bool {
		let modified = self.records.update(|list| {
			list.iter_mut().find(|r| &r.address == address).map(|r| {
				f(r);
				r.clone()
			})
		});
		match modified {
			Some(record) => {
				self.save(&record);
				true
			}
			None => false,
		}
	}

	/// Pick a random peer to connect to and stamp the attempt.
	///
	/// Peers that are ourselves, already connected or failed within
	/// `backoff` are never picked.
	pub fn select_candidate(
		&self,
		now: Timestamp,
		backoff: Duration,
		is_connected: impl Fn(&PeerAddress) -> bool,
	) -> Option<PeerRecord> {
		let self_peers = self.self_peers();
		let picked = self.records.update(|list| {
			let candidates = list
				.iter()
				.enumerate()
				.filter(|(_, r)| !self_peers.contains(&r.address))
				.filter(|(_, r)| !is_connected(&r.address))
				.filter(|(_, r)| !r.recently_failed(now, backoff))
				.map(|(i, _)| i)
				.collect::<Vec<_>>();

			candidates.choose(&mut rand::thread_rng()).map(|&i| {
				list[i].last_attempted = Some(now);
				list[i].clone()
			})
		});

		if let Some(ref record) = picked {
			self.save(record);
		}
		picked
	}

	/// Stamp a connection attempt.
	pub fn mark_attempted(&self, address: &PeerAddress, now: Timestamp) -> bool {
		self.modify(address, |r| r.last_attempted = Some(now))
	}

	/// Stamp a successful connection.
	pub fn mark_connected(&self, address: &PeerAddress, now: Timestamp) -> bool {
		self.modify(address, |r| r.last_connected = Some(now))
	}

	/// Stamp a protocol violation.
	pub fn mark_misbehaved(&self, address: &PeerAddress, now: Timestamp) -> bool {
		self.modify(address, |r| r.last_misbehaved = Some(now))
	}

	/// Add the addresses we don't know yet, returning whether any were new.
	///
	/// When `blocking` is false and another merge is in progress, nothing
	/// is merged and false is returned.
	pub fn merge(
		&self,
		added_by: &str,
		now: Option<Timestamp>,
		addresses: impl IntoIterator<Item = PeerAddress>,
		blocking: bool,
	) -> Result<bool, Error> {
		let _guard = if blocking {
			self.merge_lock.lock()
		} else {
			match self.merge_lock.try_lock() {
				Some(g) => g,
				None => {
					trace!("Skipping peer merge, another one is in progress");
					return Ok(false);
				}
			}
		};

		let known = self.snapshot().iter().map(|r| r.address.clone()).collect::<HashSet<_>>();
		let fresh = dedup(addresses.into_iter().filter(|a| !known.contains(a)))
			.into_iter()
			.map(|a| PeerRecord::new(a, now, added_by))
			.collect::<Vec<_>>();
		if fresh.is_empty() {
			return Ok(false);
		}

		for record in &fresh {
			self.store.save(record).map_err(Error::Store)?;
		}
		debug!("Merged {} new peer(s) from {}", fresh.len(), added_by);
		self.records.update(|list| list.extend(fresh));
		Ok(true)
	}

	/// Delete old records of peers we're not connected to, returning how
	/// many were deleted.
	pub fn prune(
		&self,
		now: Timestamp,
		attempted_period: Duration,
		connection_period: Duration,
		is_connected: impl Fn(&PeerAddress) -> bool,
	) -> usize {
		let stale = self.records.update(|list| {
			let (stale, keep) = list.drain(..).partition::<Vec<_>, _>(|r| {
				r.is_old(now, attempted_period, connection_period) && !is_connected(&r.address)
			});
			*list = keep;
			stale
		});

		for record in &stale {
			debug!("Deleting old peer {}", record.address);
			if let Err(e) = self.store.delete(&record.address) {
				warn!("Failed to delete peer {}: {}", record.address, e);
			}
		}
		stale.len()
	}

	/// Forget a peer, returning whether it was known.
	pub fn forget(&self, address: &PeerAddress) -> Result<bool, Error> {
		let stored = self.store.delete(address).map_err(Error::Store)?;
		let known = self.records.update(|list| {
			let before = list.len();
			list.retain(|r| &r.address != address);
			list.len() != before
		});
		Ok(stored || known)
	}

	/// Forget all peers, returning how many were known.
	pub fn forget_all(&self) -> Result<usize, Error> {
		self.store.delete_all().map_err(Error::Store)?;
		Ok(self.records.update(|list| list.drain(..).count()))
	}

	/// Remember that the address leads to ourselves.
	pub fn note_self(&self, address: PeerAddress) {
		debug!("Remembering {} as a self-connection", address);
		self.self_peers.lock().put(address, ());
	}

	/// Whether the address is known to lead to ourselves.
	pub fn is_self(&self, address: &PeerAddress) -> bool {
		self.self_peers.lock().contains(address)
	}

	/// Addresses known to lead to ourselves, most recent first.
	pub fn self_peers(&self) -> Vec<PeerAddress> {
		self.self_peers.lock().iter().map(|(a, _)| a.clone()).collect()
	}

	/// Addresses of peers we recently connected to, for peer-exchange.
	pub fn recent_addresses(
		&self,
		now: Timestamp,
		threshold: Duration,
		include_local: bool,
	) -> Vec<PeerAddress> {
		self.snapshot()
			.iter()
			.filter(|r| r.recently_connected(now, threshold))
			.filter(|r| include_local || !r.address.is_local())
			.map(|r| r.address.clone())
			.collect()
	}
}

/// Remove duplicates, keeping the first occurrence.
fn dedup(addresses: impl IntoIterator<Item = PeerAddress>) -> Vec<PeerAddress> {
	let mut seen = HashSet::new();
	addresses.into_iter().filter(|a| seen.insert(a.clone())).collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	const NOW: Timestamp = 1_600_000_000_000;
	const DAY: u64 = 24 * 60 * 60 * 1000;

	fn addr(s: &str) -> PeerAddress {
		s.parse().unwrap()
	}

	fn record(s: &str) -> PeerRecord {
		PeerRecord::new(addr(s), Some(NOW - 30 * DAY), "test")
	}

	fn known(records: Vec<PeerRecord>) -> (KnownPeers, MemoryStore) {
		let store = MemoryStore::with_records(records);
		let known = KnownPeers::new(Arc::new(store.clone()), 8);
		known.load().unwrap();
		(known, store)
	}

	#[test]
	fn parse_addresses() {
		assert_eq!(addr("1.2.3.4:9084"), PeerAddress::new("1.2.3.4", 9084));
		assert_eq!(addr("[::1]:9084"), PeerAddress::new("::1", 9084));
		assert_eq!(addr("[::1]"), PeerAddress::new("::1", DEFAULT_PORT));
		assert_eq!(addr("::1"), PeerAddress::new("::1", DEFAULT_PORT));
		assert_eq!(addr("node.example.org"), PeerAddress::new("node.example.org", DEFAULT_PORT));

		for bad in &["", ":12392", "host:port", "[::1", "[::1]x", "host:70000", "a b:1"] {
			assert!(bad.parse::<PeerAddress>().is_err(), "{}", bad);
		}
	}

	#[test]
	fn display_roundtrips() {
		for s in &["1.2.3.4:9084", "[2001:db8::1]:12392", "node.example.org:1"] {
			assert_eq!(addr(s).to_string(), *s);
		}
	}

	#[test]
	fn equality_is_textual() {
		assert_ne!(addr("localhost:1"), addr("127.0.0.1:1"));
		assert_ne!(addr("1.2.3.4:1"), addr("1.2.3.4:2"));
	}

	#[test]
	fn local_addresses() {
		for s in &["127.0.0.1", "10.1.2.3", "192.168.1.1", "172.16.0.1", "169.254.1.1", "[::1]", "[fe80::1]", "[fd00::1]", "localhost"] {
			assert!(addr(s).is_local(), "{}", s);
		}
		for s in &["8.8.8.8", "[2001:db8::1]", "node.example.org"] {
			assert!(!addr(s).is_local(), "{}", s);
		}
	}

	#[test]
	fn candidate_selection_filters() {
		let backoff = Duration::from_secs(5 * 60);

		let fresh = record("1.1.1.1:1");
		let mut failed = record("2.2.2.2:1");
		failed.last_attempted = Some(NOW - 1000);
		let mut retry = record("3.3.3.3:1");
		retry.last_attempted = Some(NOW - 10 * 60 * 1000);
		let mut good = record("4.4.4.4:1");
		good.last_attempted = Some(NOW - 1000);
		good.last_connected = Some(NOW - 500);
		let connected = record("5.5.5.5:1");
		let myself = record("6.6.6.6:1");

		let (known, store) = known(vec![fresh, failed, retry, good, connected, myself]);
		known.note_self(addr("6.6.6.6:1"));
		let is_connected = |a: &PeerAddress| a == &addr("5.5.5.5:1");

		let mut picked = HashSet::new();
		while let Some(r) = known.select_candidate(NOW, backoff, is_connected) {
			assert_eq!(r.last_attempted, Some(NOW));
			assert_eq!(store.get(&r.address).unwrap().last_attempted, Some(NOW));
			assert!(picked.insert(r.address));
		}

		let expected: HashSet<_> = ["1.1.1.1:1", "3.3.3.3:1", "4.4.4.4:1"].iter().map(|s| addr(s)).collect();
		assert_eq!(picked, expected);
	}

	#[test]
	fn merge_dedups_and_persists() {
		let (known, store) = known(vec![record("1.1.1.1:1")]);

		let merged = known.merge(
			"peer-exchange",
			Some(NOW),
			vec![addr("1.1.1.1:1"), addr("2.2.2.2:1"), addr("2.2.2.2:1")],
			true,
		).unwrap();
		assert!(merged);
		assert_eq!(known.snapshot().len(), 2);
		assert_eq!(store.len(), 2);
		assert_eq!(store.get(&addr("2.2.2.2:1")).unwrap().added_by.as_deref(), Some("peer-exchange"));

		assert!(!known.merge("peer-exchange", Some(NOW), vec![addr("2.2.2.2:1")], true).unwrap());
	}

	#[test]
	fn opportunistic_merge_skips_when_busy() {
		let (known, _) = known(vec![]);

		let guard = known.merge_lock.lock();
		assert!(!known.merge("gossip", Some(NOW), vec![addr("2.2.2.2:1")], false).unwrap());
		drop(guard);

		assert!(known.merge("gossip", Some(NOW), vec![addr("2.2.2.2:1")], false).unwrap());
	}

	#[test]
	fn prune_old_peers() {
		let attempted = Duration::from_millis(DAY);
		let connection = Duration::from_millis(7 * DAY);

		let mut stale = record("1.1.1.1:1");
		stale.last_attempted = Some(NOW - 1000);
		stale.last_connected = Some(NOW - 8 * DAY);
		let mut never = record("2.2.2.2:1");
		never.last_attempted = Some(NOW - 1000);
		let mut young = record("3.3.3.3:1");
		young.added_when = Some(NOW - DAY);
		young.last_attempted = Some(NOW - 1000);
		let mut fine = record("4.4.4.4:1");
		fine.last_attempted = Some(NOW - 1000);
		fine.last_connected = Some(NOW - 500);
		let mut idle = record("5.5.5.5:1");
		idle.last_attempted = Some(NOW - 2 * DAY);
		let mut connected = record("6.6.6.6:1");
		connected.last_attempted = Some(NOW - 1000);

		let (known, store) = known(vec![stale, never, young, fine, idle, connected]);
		let pruned = known.prune(NOW, attempted, connection, |a| a == &addr("6.6.6.6:1"));
		assert_eq!(pruned, 2);
		assert!(known.get(&addr("1.1.1.1:1")).is_none());
		assert!(known.get(&addr("2.2.2.2:1")).is_none());
		assert!(store.get(&addr("2.2.2.2:1")).is_none());
		assert_eq!(known.snapshot().len(), 4);
	}

	#[test]
	fn recent_addresses_for_exchange() {
		let threshold = Duration::from_millis(DAY);

		let mut public = record("8.8.8.8:1");
		public.last_attempted = Some(NOW - 2000);
		public.last_connected = Some(NOW - 1000);
		let mut local = record("192.168.1.7:1");
		local.last_attempted = Some(NOW - 2000);
		local.last_connected = Some(NOW - 1000);
		let mut failed = record("9.9.9.9:1");
		failed.last_attempted = Some(NOW - 1000);
		failed.last_connected = Some(NOW - 2000);
		let mut ancient = record("7.7.7.7:1");
		ancient.last_attempted = Some(NOW - 3 * DAY);
		ancient.last_connected = Some(NOW - 2 * DAY);

		let (known, _) = known(vec![public, local, failed, ancient]);

		let mut all = known.recent_addresses(NOW, threshold, true);
		all.sort();
		assert_eq!(all, vec![addr("192.168.1.7:1"), addr("8.8.8.8:1")]);
		assert_eq!(known.recent_addresses(NOW, threshold, false), vec![addr("8.8.8.8:1")]);
	}

	#[test]
	fn self_peers_are_bounded() {
		let known = KnownPeers::new(Arc::new(MemoryStore::new()), 2);
		known.note_self(addr("1.1.1.1:1"));
		known.note_self(addr("2.2.2.2:1"));
		known.note_self(addr("3.3.3.3:1"));

		assert_eq!(known.self_peers(), vec![addr("3.3.3.3:1"), addr("2.2.2.2:1")]);
		assert!(!known.is_self(&addr("1.1.1.1:1")));
	}

	#[test]
	fn forget_peers() {
		let (known, store) = known(vec![record("1.1.1.1:1"), record("2.2.2.2:1")]);
		assert!(known.forget(&addr("1.1.1.1:1")).unwrap());
		assert!(!known.forget(&addr("1.1.1.1:1")).unwrap());
		assert_eq!(store.len(), 1);
		assert_eq!(known.forget_all().unwrap(), 1);
		assert!(known.snapshot().is_empty());
		assert_eq!(store.len(), 0);
	}
}
