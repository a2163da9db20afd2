//! Node identity.
//!
//! Each node holds an Ed25519 keypair. Its node id is the hex encoding of the
//! first 20 bytes of the SHA-256 of its public key.
//!
//! During the handshake each side proves it holds the key it advertised by
//! signing `SHA256(shared_secret || challenge)`, where `challenge` was chosen
//! by the other side and `shared_secret` is the X25519 product of both keys.
//! Both sides derive the same secret, so the verifier can recompute the digest.

use std::fmt;

use bitcoin::hashes::hex::ToHex;
use bitcoin::hashes::{sha256, Hash, HashEngine};
use curve25519_dalek::montgomery::MontgomeryPoint;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};

/// Number of public key hash bytes in a node id.
const NODE_ID_LEN: usize = 20;

/// The advertised public key is not a valid Ed25519 point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidPublicKey;

impl fmt::Display for InvalidPublicKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "invalid public key")
	}
}

impl std::error::Error for InvalidPublicKey {}

/// Derive the node id belonging to a public key.
pub fn node_id(public_key: &[u8; 32]) -> String {
	let hash = sha256::Hash::hash(public_key).into_inner();
	hash[..NODE_ID_LEN].to_hex()
}

fn proof_digest(shared_secret: &MontgomeryPoint, challenge: &[u8; 32]) -> [u8; 32] {
	let mut engine = sha256::Hash::engine();
	engine.input(shared_secret.as_bytes());
	engine.input(challenge);
	sha256::Hash::from_engine(engine).into_inner()
}

/// A node's keypair.
pub struct Identity {
	signing_key: SigningKey,
	public_key: [u8; 32],
	node_id: String,
}

impl Identity {
	/// Generate a fresh random identity.
	pub fn generate() -> Identity {
		Identity::from_secret(rand::random())
	}

	/// Create the identity for a 32-byte secret key.
	pub fn from_secret(secret: [u8; 32]) -> Identity {
		let signing_key = SigningKey::from_bytes(&secret);
		let public_key = signing_key.verifying_key().to_bytes();
		Identity {
			node_id: node_id(&public_key),
			signing_key,
			public_key,
		}
	}

	/// Our public key.
	pub fn public_key(&self) -> &[u8; 32] {
		&self.public_key
	}

	/// Our node id.
	pub fn node_id(&self) -> &str {
		&self.node_id
	}

	fn shared_secret(&self, their_public_key: &[u8; 32]) -> Result<MontgomeryPoint, InvalidPublicKey> {
		let key = VerifyingKey::from_bytes(their_public_key).map_err(|_| InvalidPublicKey)?;
		Ok(key.to_montgomery().mul_clamped(self.signing_key.to_scalar_bytes()))
	}

	/// Answer a challenge sent by the owner of `their_public_key`.
	pub fn prove(
		&self,
		their_public_key: &[u8; 32],
		challenge: &[u8; 32],
	) -> Result<[u8; 64], InvalidPublicKey> {
		let secret = self.shared_secret(their_public_key)?;
		let digest = proof_digest(&secret, challenge);
		Ok(self.signing_key.sign(&digest).to_bytes())
	}

	/// Check that `signature` answers `our_challenge` and was made by the
	/// owner of `their_public_key`.
	pub fn verify(
		&self,
		their_public_key: &[u8; 32],
		our_challenge: &[u8; 32],
		signature: &[u8; 64],
	) -> bool {
		let key = match VerifyingKey::from_bytes(their_public_key) {
			Ok(k) => k,
			Err(_) => return false,
		};
		let secret = match self.shared_secret(their_public_key) {
			Ok(s) => s,
			Err(_) => return false,
		};
		let digest = proof_digest(&secret, our_challenge);
		key.verify_strict(&digest, &Signature::from_bytes(signature)).is_ok()
	}
}

impl fmt::Debug for Identity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Identity").field("node_id", &self.node_id).finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn proof_roundtrip() {
		let alice = Identity::generate();
		let bob = Identity::generate();
		let challenge = [42u8; 32];

		let proof = alice.prove(bob.public_key(), &challenge).unwrap();
		assert!(bob.verify(alice.public_key(), &challenge, &proof));

		// Wrong challenge, wrong signer or a third party's key all fail.
		assert!(!bob.verify(alice.public_key(), &[0u8; 32], &proof));
		let mallory = Identity::generate();
		let forged = mallory.prove(bob.public_key(), &challenge).unwrap();
		assert!(!bob.verify(alice.public_key(), &challenge, &forged));
		assert!(!mallory.verify(alice.public_key(), &challenge, &proof));
	}

	#[test]
	fn node_ids() {
		let id = Identity::from_secret([1u8; 32]);
		assert_eq!(id.node_id().len(), NODE_ID_LEN * 2);
		assert_eq!(id.node_id(), node_id(id.public_key()));
		assert_ne!(id.node_id(), Identity::from_secret([2u8; 32]).node_id());
	}
}
