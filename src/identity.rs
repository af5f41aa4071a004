//! # Peer Identity
//!
//! A peer is identified by its 32-byte Ed25519 public key. There is no separate
//! identity layer: whoever can sign with the matching secret key *is* the peer.
//!
//! - [`PeerId`]: the public identity, used as the key of every peer relation
//! - [`Keypair`]: the local signing key, never leaves the process

use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch.
#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from_bytes(self.signing_key.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// Whether the bytes decode to a usable Ed25519 verifying key.
    ///
    /// The all-zero and all-0xFF patterns are rejected up front: zero decodes
    /// to a small-order point, and neither comes out of [`Keypair::generate`].
    /// Checked on every Hello before its signature.
    pub fn is_valid(&self) -> bool {
        if self.0 == [0u8; 32] || self.0 == [0xFFu8; 32] {
            return false;
        }
        VerifyingKey::from_bytes(&self.0).is_ok()
    }

    /// First eight bytes as hex, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.short())
    }
}

impl From<[u8; 32]> for PeerId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_peer_id_is_public_key() {
        let keypair = Keypair::from_secret_key_bytes(&[7u8; 32]);
        let again = Keypair::from_secret_key_bytes(&[7u8; 32]);
        assert_eq!(keypair.peer_id(), again.peer_id());
        assert_eq!(keypair.peer_id().as_bytes(), keypair.signing_key.verifying_key().as_bytes());
        assert!(keypair.peer_id().is_valid());
    }

    #[test]
    fn hex_is_full_key() {
        let id = Keypair::generate().peer_id();
        assert_eq!(id.to_hex().len(), 64);
        assert!(id.to_hex().starts_with(&id.short()));
    }

    #[test]
    fn degenerate_ids_are_invalid() {
        assert!(!PeerId::from_bytes([0u8; 32]).is_valid());
        assert!(!PeerId::from_bytes([0xFFu8; 32]).is_valid());
    }

    #[test]
    fn display_is_short_hex() {
        let id = PeerId::from_bytes([0xAB; 32]);
        assert_eq!(id.to_string(), "abababababababab");
        assert_eq!(format!("{:?}", id), "PeerId(abababababababab)");
    }
}
