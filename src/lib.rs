//! # Murmur - Gossip Network Core
//!
//! Murmur propagates application messages across a changing set of peers with
//! a publish/subscribe epidemic broadcast, and exposes that propagation to a
//! host through three calls: start the network, publish a message, receive a
//! message.
//!
//! - **Identity**: Ed25519 keys; a peer's id is its 32-byte public key
//! - **Propagation**: per-topic meshes forward full messages eagerly, IHAVE/IWANT
//!   gossip repairs gaps lazily
//! - **Deduplication**: a bounded, time-windowed cache of message ids guarantees
//!   each message reaches the host at most once per retention window
//! - **Transport**: length-prefixed bincode frames over TCP, one session per peer
//!
//! ## Architecture
//!
//! The [`Node`] runs an actor for host commands and the heartbeat, an accept
//! loop, and one task per peer session. All of them share a single
//! propagation engine whose state sits behind fine-grained locks, so delivery
//! on one session never waits for another.
//!
//! ## Security Model
//!
//! - Every message is signed by its source; receivers recompute ids and verify
//! - Sessions start with a signed Hello, so a peer cannot claim another's id
//! - Invalid messages, malformed frames and protocol violations cost score;
//!   graylisted peers are ignored and disconnected
//! - Every table is bounded: caches, backoff, scores, queues, frame sizes
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | Node assembly: listener, sessions, heartbeat actor, shutdown |
//! | `boundary` | Process-wide `start` / `send_gossip` for embedding hosts |
//! | `engine` | Propagation engine: validate, deduplicate, deliver, forward |
//! | `session` | Per-peer framing, handshake, session lifecycle, reader/writer tasks |
//! | `registry` | Active peers and their topic subscriptions |
//! | `mesh` | Per-topic mesh membership, rebalance, backoff |
//! | `cache` | Deduplication cache and recent-message history |
//! | `score` | Peer penalties and graylisting |
//! | `messages` | Wire frames and bounded codec |
//! | `identity` | Keypairs and peer ids |
//! | `crypto` | Domain-separated signatures |
//! | `protocols` | Trait seams: frame sink, host receiver |
//! | `config` | Command-line arguments and protocol tunables |
//! | `error` | Error taxonomy |

mod boundary;
mod cache;
mod config;
mod crypto;
mod engine;
mod error;
mod identity;
mod mesh;
mod messages;
mod node;
mod protocols;
mod registry;
mod score;
mod session;

pub use boundary::{is_running, send_gossip, start, start_until};
pub use cache::{MessageCache, MessageHistory};
pub use config::{DEFAULT_PORT, DEFAULT_TOPIC, GossipConfig, NetworkArgs, NetworkConfig};
pub use crypto::SignatureError;
pub use engine::{Delivery, EngineSnapshot, GossipEngine};
pub use error::{GossipError, MessageRejection};
pub use identity::{Keypair, PeerId};
pub use mesh::{MeshManager, Rebalance};
pub use messages::{
    Frame, GossipMessage, Hello, MAX_FRAME_SIZE, MAX_TOPIC_LENGTH, MessageId, decode_frame, encode_frame,
};
pub use node::{GossipHandle, Node};
pub use protocols::{FrameSink, GossipReceiver};
pub use registry::PeerRegistry;
pub use score::{ScoreBook, ScoreParams};
pub use session::{PeerSessionState, ReadOutcome, SessionEvent, SessionTable, read_frame, write_frame};
