//! # Wire Protocol Messages
//!
//! Every unit exchanged between peers is a [`Frame`]. Frames are serialized with
//! bincode under a size limit and carried length-prefixed by the session layer.
//!
//! | Frame | Purpose |
//! |-------|---------|
//! | `Hello` | Signed handshake, first frame in each direction |
//! | `Data` | A full [`GossipMessage`] |
//! | `Subscribe` / `Unsubscribe` | Topic interest announcements |
//! | `Graft` / `Prune` | Mesh membership signals |
//! | `IHave` / `IWant` | Lazy gossip of recent message ids |
//! | `Ping` / `Pong` | Keepalive |
//!
//! ## Message IDs
//!
//! `MessageId = blake3(source || seqno || topic)`. The payload is excluded, so a
//! source can never mint two different messages under the same id without also
//! reusing a seqno, and receivers recompute the id instead of trusting the wire.

use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::crypto::{
    HELLO_SIGNATURE_DOMAIN, MESSAGE_SIGNATURE_DOMAIN, SignatureError, sign_with_domain,
    verify_with_domain,
};
use crate::identity::{Keypair, PeerId};

pub type MessageId = [u8; 32];

/// Maximum encoded frame size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Maximum topic name length in bytes.
pub const MAX_TOPIC_LENGTH: usize = 256;

/// Returns bincode options with size limits enforced.
/// SECURITY: used for both directions so encodings always agree.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_FRAME_SIZE as u64)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(frame)
}

pub fn decode_frame(bytes: &[u8]) -> Result<Frame, bincode::Error> {
    deserialize_bounded(bytes)
}

/// Topics are non-empty printable ASCII (spaces allowed) up to [`MAX_TOPIC_LENGTH`].
pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty()
        && topic.len() <= MAX_TOPIC_LENGTH
        && topic.chars().all(|c| c.is_ascii_graphic() || c == ' ')
}

pub fn message_id(source: &PeerId, seqno: u64, topic: &str) -> MessageId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(source.as_bytes());
    hasher.update(&seqno.to_be_bytes());
    hasher.update(topic.as_bytes());
    *hasher.finalize().as_bytes()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipMessage {
    pub source: PeerId,
    pub seqno: u64,
    pub topic: String,
    pub data: Vec<u8>,
    pub timestamp_ms: u64,
    pub signature: Vec<u8>,
}

impl GossipMessage {
    pub fn new_signed(
        keypair: &Keypair,
        seqno: u64,
        topic: impl Into<String>,
        data: Vec<u8>,
        timestamp_ms: u64,
    ) -> Self {
        let mut msg = Self {
            source: keypair.peer_id(),
            seqno,
            topic: topic.into(),
            data,
            timestamp_ms,
            signature: Vec::new(),
        };
        msg.signature = sign_with_domain(keypair, MESSAGE_SIGNATURE_DOMAIN, &msg.signed_payload());
        msg
    }

    pub fn id(&self) -> MessageId {
        message_id(&self.source, self.seqno, &self.topic)
    }

    fn signed_payload(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(24 + self.topic.len() + self.data.len());
        buf.extend_from_slice(&self.seqno.to_be_bytes());
        buf.extend_from_slice(&self.timestamp_ms.to_be_bytes());
        buf.extend_from_slice(&(self.topic.len() as u64).to_be_bytes());
        buf.extend_from_slice(self.topic.as_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }

    pub fn verify_signature(&self) -> Result<(), SignatureError> {
        verify_with_domain(&self.source, MESSAGE_SIGNATURE_DOMAIN, &self.signed_payload(), &self.signature)
    }
}

/// Handshake record proving control of the claimed [`PeerId`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub peer_id: PeerId,
    pub timestamp_ms: u64,
    pub signature: Vec<u8>,
}

impl Hello {
    pub fn new_signed(keypair: &Keypair, timestamp_ms: u64) -> Self {
        let peer_id = keypair.peer_id();
        let signature = sign_with_domain(keypair, HELLO_SIGNATURE_DOMAIN, &Self::signed_payload(&peer_id, timestamp_ms));
        Self { peer_id, timestamp_ms, signature }
    }

    fn signed_payload(peer_id: &PeerId, timestamp_ms: u64) -> Vec<u8> {
        let mut buf = Vec::with_capacity(40);
        buf.extend_from_slice(peer_id.as_bytes());
        buf.extend_from_slice(&timestamp_ms.to_be_bytes());
        buf
    }

    pub fn verify(&self) -> Result<(), SignatureError> {
        verify_with_domain(
            &self.peer_id,
            HELLO_SIGNATURE_DOMAIN,
            &Self::signed_payload(&self.peer_id, self.timestamp_ms),
            &self.signature,
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    Hello(Hello),
    Data(GossipMessage),
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Graft { topic: String },
    Prune { topic: String, backoff_secs: u64 },
    IHave { topic: String, ids: Vec<MessageId> },
    IWant { ids: Vec<MessageId> },
    Ping(u64),
    Pong(u64),
}

impl Frame {
    /// Short name for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello(_) => "hello",
            Frame::Data(_) => "data",
            Frame::Subscribe { .. } => "subscribe",
            Frame::Unsubscribe { .. } => "unsubscribe",
            Frame::Graft { .. } => "graft",
            Frame::Prune { .. } => "prune",
            Frame::IHave { .. } => "ihave",
            Frame::IWant { .. } => "iwant",
            Frame::Ping(_) => "ping",
            Frame::Pong(_) => "pong",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> Keypair {
        Keypair::from_secret_key_bytes(&[3u8; 32])
    }

    #[test]
    fn message_id_ignores_payload() {
        let kp = keypair();
        let a = GossipMessage::new_signed(&kp, 7, "alpha", b"one".to_vec(), 1_000);
        let b = GossipMessage::new_signed(&kp, 7, "alpha", b"two".to_vec(), 2_000);
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn message_id_separates_seqno_topic_and_source() {
        let kp = keypair();
        let other = Keypair::from_secret_key_bytes(&[4u8; 32]);
        let base = message_id(&kp.peer_id(), 1, "alpha");
        assert_ne!(base, message_id(&kp.peer_id(), 2, "alpha"));
        assert_ne!(base, message_id(&kp.peer_id(), 1, "beta"));
        assert_ne!(base, message_id(&other.peer_id(), 1, "alpha"));
    }

    #[test]
    fn tampered_message_fails_verification() {
        let mut msg = GossipMessage::new_signed(&keypair(), 1, "alpha", b"payload".to_vec(), 5);
        assert!(msg.verify_signature().is_ok());

        msg.data = b"forged".to_vec();
        assert_eq!(msg.verify_signature(), Err(SignatureError::VerificationFailed));
    }

    #[test]
    fn hello_verifies_and_detects_substitution() {
        let hello = Hello::new_signed(&keypair(), 42);
        assert!(hello.verify().is_ok());

        let mut spoofed = hello.clone();
        spoofed.peer_id = Keypair::from_secret_key_bytes(&[9u8; 32]).peer_id();
        assert!(spoofed.verify().is_err());
    }

    #[test]
    fn frames_survive_the_codec() {
        let msg = GossipMessage::new_signed(&keypair(), 1, "alpha", vec![1, 2, 3], 5);
        let frames = vec![
            Frame::Data(msg),
            Frame::Prune { topic: "alpha".into(), backoff_secs: 60 },
            Frame::IHave { topic: "alpha".into(), ids: vec![[1u8; 32], [2u8; 32]] },
        ];
        for frame in frames {
            let bytes = encode_frame(&frame).unwrap();
            assert_eq!(decode_frame(&bytes).unwrap(), frame);
        }
    }

    #[test]
    fn malformed_data_rejected() {
        assert!(decode_frame(&[]).is_err());
        assert!(decode_frame(&[0xFF; 16]).is_err());

        // Data variant claiming a topic longer than the frame limit.
        let mut bytes = 1u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 32]);
        bytes.extend_from_slice(&0u64.to_le_bytes());
        bytes.extend_from_slice(&u64::MAX.to_le_bytes());
        assert!(decode_frame(&bytes).is_err());
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut bytes = encode_frame(&Frame::Ping(1)).unwrap();
        bytes.push(0);
        assert!(decode_frame(&bytes).is_err());
    }

    #[test]
    fn topic_validation() {
        assert!(is_valid_topic("alpha"));
        assert!(is_valid_topic("beacon block"));
        assert!(!is_valid_topic(""));
        assert!(!is_valid_topic("tab\there"));
        assert!(!is_valid_topic("ünïcode"));
        assert!(!is_valid_topic(&"x".repeat(MAX_TOPIC_LENGTH + 1)));
    }

    #[test]
    fn frame_kind_names() {
        assert_eq!(Frame::Graft { topic: "t".into() }.kind(), "graft");
        assert_eq!(Frame::IWant { ids: vec![] }.kind(), "iwant");
        assert_eq!(Frame::Ping(0).kind(), "ping");
    }
}
