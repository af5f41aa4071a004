//! Error taxonomy shared by every layer of the gossip core.
//!
//! Per-peer errors ([`GossipError::UnknownPeer`], [`GossipError::MalformedFrame`],
//! [`GossipError::ValidationFailed`], [`GossipError::TransportFailure`]) are
//! handled where they occur and never tear down the node. Only
//! [`GossipError::StartupFailure`] is fatal.

use thiserror::Error;

use crate::crypto::SignatureError;
use crate::identity::PeerId;

/// Why a message was refused by validation, either on publish or on receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MessageRejection {
    #[error("message size exceeds maximum allowed")]
    MessageTooLarge,
    #[error("topic name exceeds maximum length")]
    TopicTooLong,
    #[error("topic name is invalid (empty or contains non-ASCII characters)")]
    InvalidTopic,
    #[error("message timestamp is outside the accepted window")]
    Expired,
    #[error("message timestamp is too far in the future")]
    FromFuture,
    #[error("invalid message signature: {0}")]
    InvalidSignature(SignatureError),
    #[error("local publish rate limit exceeded")]
    RateLimited,
    #[error("sender is graylisted")]
    Graylisted,
}

#[derive(Debug, Error)]
pub enum GossipError {
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("validation failed: {0}")]
    ValidationFailed(#[from] MessageRejection),

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("startup failure: {0}")]
    StartupFailure(String),

    #[error("peer {peer} exceeded {limit} subscriptions")]
    SubscriptionLimit { peer: PeerId, limit: usize },

    #[error("node is shut down")]
    Closed,
}

impl From<std::io::Error> for GossipError {
    fn from(err: std::io::Error) -> Self {
        GossipError::TransportFailure(err.to_string())
    }
}

impl From<bincode::Error> for GossipError {
    fn from(err: bincode::Error) -> Self {
        GossipError::MalformedFrame(err.to_string())
    }
}
