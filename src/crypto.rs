//! # Signatures
//!
//! Domain-separated Ed25519 signing for everything murmur puts on the wire:
//! gossip messages and the session handshake. Each signed record type has its
//! own prefix so a signature over one can never be replayed as the other.

use ed25519_dalek::{Signature, VerifyingKey};
use thiserror::Error;

use crate::identity::{Keypair, PeerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("signature is missing")]
    Missing,
    #[error("signature has invalid length")]
    InvalidLength,
    #[error("signature verification failed")]
    VerificationFailed,
    #[error("invalid public key")]
    InvalidPublicKey,
}

/// Prefix for gossip message signatures.
pub const MESSAGE_SIGNATURE_DOMAIN: &[u8] = b"murmur-message-v1:";

/// Prefix for session handshake signatures.
pub const HELLO_SIGNATURE_DOMAIN: &[u8] = b"murmur-hello-v1:";

fn prefixed(domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(domain.len() + data.len());
    buf.extend_from_slice(domain);
    buf.extend_from_slice(data);
    buf
}

/// Sign `data` under `domain`. Returns the 64-byte signature.
pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> Vec<u8> {
    keypair.sign(&prefixed(domain, data)).to_bytes().to_vec()
}

/// Verify a signature produced by [`sign_with_domain`] with the same domain.
pub fn verify_with_domain(
    signer: &PeerId,
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;

    let verifying_key =
        VerifyingKey::from_bytes(signer.as_bytes()).map_err(|_| SignatureError::InvalidPublicKey)?;
    let sig = Signature::from_bytes(&sig_bytes);

    verifying_key
        .verify_strict(&prefixed(domain, data), &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}
