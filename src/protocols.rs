//! # Protocol Seams
//!
//! The propagation engine talks to the outside world through two traits:
//!
//! - [`FrameSink`]: hands a frame to the session of a connected peer
//!   (implemented by the session table; tests substitute a recorder)
//! - [`GossipReceiver`]: the host capability invoked once per novel message

use crate::error::GossipError;
use crate::identity::PeerId;
use crate::messages::Frame;

pub trait FrameSink: Send + Sync + 'static {
    /// Queue `frame` for `to` without blocking.
    ///
    /// A full or missing session is reported as an error and the frame is
    /// dropped; the engine never waits on a single slow peer.
    fn send_frame(&self, to: &PeerId, frame: Frame) -> Result<(), GossipError>;

    /// Ask the session of `peer` to tear itself down.
    fn disconnect(&self, peer: &PeerId);
}

/// Host callback for delivered messages.
///
/// Runs inline on the session task that detected novelty, possibly
/// concurrently for different peers or topics. Implementations must return
/// promptly; blocking here stalls that peer's session.
pub trait GossipReceiver: Send + Sync + 'static {
    fn receive_gossip(&self, topic: &str, payload: &[u8]);
}

impl<F> GossipReceiver for F
where
    F: Fn(&str, &[u8]) + Send + Sync + 'static,
{
    fn receive_gossip(&self, topic: &str, payload: &[u8]) {
        self(topic, payload)
    }
}
