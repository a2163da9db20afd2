//! Peer views.
//!
//! The live peers are kept in three views: all connected peers, peers that
//! completed the handshake and outbound peers that completed the handshake.
//! Each view is a locked list paired with an immutable snapshot that is
//! republished after every mutation, so readers never block on writers and
//! never see a half-applied change.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::peer::Peer;
use crate::PeerId;

/// A list that is mutated under a lock and read through snapshots.
pub struct View<T> {
	list: Mutex<Vec<T>>,
	snapshot: RwLock<Arc<Vec<T>>>,
}

impl<T: Clone> View<T> {
	/// Create an empty view.
	pub fn new() -> View<T> {
		View {
			list: Mutex::new(Vec::new()),
			snapshot: RwLock::new(Arc::new(Vec::new())),
		}
	}

	/// The latest published snapshot.
	pub fn snapshot(&self) -> Arc<Vec<T>> {
		self.snapshot.read().clone()
	}

	/// Mutate the list and publish a new snapshot.
	pub fn update<R>(&self, f: impl FnOnce(&mut Vec<T>) -> R) -> R {
		let mut list = self.list.lock();
		let ret = f(&mut list);
		*self.snapshot.write() = Arc::new(list.clone());
		ret
	}
}

impl<T: Clone> Default for View<T> {
	fn default() -> View<T> {
		View::new()
	}
}

/// Why a handshaked peer was turned away.
#[derive(Debug)]
pub enum Rejection {
	/// A different peer already authenticated with the same public key.
	Duplicate(Arc<Peer>),
	/// Enough outbound peers are handshaked.
	OutboundFull,
}

/// The views over our live peers.
#[derive(Default)]
pub struct PeerViews {
	connected: View<Arc<Peer>>,
	handshaked: View<Arc<Peer>>,
	outbound_handshaked: View<Arc<Peer>>,
}

impl PeerViews {
	pub fn new() -> PeerViews {
		PeerViews::default()
	}

	pub fn add_connected(&self, peer: Arc<Peer>) {
		self.connected.update(|list| list.push(peer));
	}

	/// Add a peer that completed its handshake.
	///
	/// Outbound peers we dialed by ourselves are only added while fewer than
	/// `outbound_cap` outbound peers are handshaked. Returns false if the
	/// peer is going away.
	pub fn add_handshaked(&self, peer: &Arc<Peer>, outbound_cap: usize) -> Result<bool, Rejection> {
		let public_key = match peer.public_key() {
			Some(pk) => pk,
			None => return Ok(false),
		};

		let added = self.handshaked.update(|list| {
			if let Some(existing) = list
				.iter()
				.find(|p| !Arc::ptr_eq(p, peer) && p.public_key() == Some(public_key))
			{
				return Err(Rejection::Duplicate(existing.clone()));
			}
			// Checked under the lock, the teardown path takes it to remove the peer.
			if peer.is_stopping() {
				return Ok(false);
			}
			if !list.iter().any(|p| Arc::ptr_eq(p, peer)) {
				list.push(peer.clone());
			}
			Ok(true)
		})?;
		if !added || !peer.link().is_outbound() {
			return Ok(added);
		}

		let admitted = self.outbound_handshaked.update(|list| {
			if !peer.is_requested() && list.len() >= outbound_cap {
				return false;
			}
			list.push(peer.clone());
			true
		});
		if !admitted {
			self.handshaked.update(|list| list.retain(|p| !Arc::ptr_eq(p, peer)));
			return Err(Rejection::OutboundFull);
		}
		// Lost a race with the teardown path.
		if peer.is_stopping() {
			self.outbound_handshaked.update(|list| list.retain(|p| !Arc::ptr_eq(p, peer)));
		}
		Ok(true)
	}

	/// Remove the peer from all views, returning whether it was connected.
	pub fn remove(&self, id: PeerId) -> bool {
		self.outbound_handshaked.update(|list| list.retain(|p| p.id() != id));
		self.handshaked.update(|list| list.retain(|p| p.id() != id));
		self.connected.update(|list| {
			let before = list.len();
			list.retain(|p| p.id() != id);
			list.len() != before
		})
	}

	pub fn connected(&self) -> Arc<Vec<Arc<Peer>>> {
		self.connected.snapshot()
	}

	pub fn handshaked(&self) -> Arc<Vec<Arc<Peer>>> {
		self.handshaked.snapshot()
	}

	pub fn outbound_handshaked(&self) -> Arc<Vec<Arc<Peer>>> {
		self.outbound_handshaked.snapshot()
	}

	/// Find the connected peer registered with the token.
	pub fn find_by_token(&self, token: mio::Token) -> Option<Arc<Peer>> {
		self.connected().iter().find(|p| p.token() == token).cloned()
	}
}
