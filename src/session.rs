//! # Session Adapter
//!
//! One [`Session`] per connected peer, bridging a byte stream to the
//! [`GossipEngine`].
//!
//! ## Wire Format
//!
//! ```text
//! ┌──────────────┬──────────────────────────┐
//! │ len: u32 BE  │ bincode(Frame), len bytes│
//! └──────────────┴──────────────────────────┘
//! ```
//!
//! A length above [`MAX_FRAME_SIZE`] cannot be resynchronised and ends the
//! session. A body that fails to decode is skipped and counted; only when the
//! count inside the decode-error window passes the limit is the session closed
//! and the peer penalised.
//!
//! ## Lifecycle
//!
//! ```text
//! Hello⇄Hello ──> Connecting ──queue open──> Active ──error/idle/disconnect/shutdown──> Draining ──writer done──> Closed
//! ```
//!
//! [`SessionTable`] owns the state of every session and publishes each
//! transition as a [`SessionEvent`]. A peer is in the engine's registry
//! exactly while its session is Active. Each Active session runs a reader
//! (this task) and a writer task draining a bounded queue. The engine only ever reaches a session through
//! [`SessionTable`]'s non-blocking [`FrameSink`] implementation, so a slow peer
//! loses frames instead of stalling anyone else.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::engine::GossipEngine;
use crate::error::GossipError;
use crate::identity::{Keypair, PeerId, now_ms};
use crate::messages::{Frame, Hello, MAX_FRAME_SIZE, decode_frame, encode_frame};
use crate::protocols::FrameSink;
use crate::score::SlidingWindow;

/// How long teardown waits for the writer to flush before aborting it.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle transitions buffered per observer before it starts lagging.
const SESSION_EVENT_CAPACITY: usize = 256;

/// Engine type driven by real sessions.
pub type SessionEngine = GossipEngine<SessionTable>;

// ============================================================================
// Framing
// ============================================================================

/// Result of reading one length-prefixed frame.
#[derive(Debug)]
pub enum ReadOutcome {
    Frame(Frame),
    /// The body was read in full but did not decode; the stream is still aligned.
    Malformed(bincode::Error),
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), GossipError>
where
    W: AsyncWrite + Unpin,
{
    let body = encode_frame(frame)?;
    let mut buf = Vec::with_capacity(4 + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&body);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. I/O errors and oversized length prefixes are fatal.
pub async fn read_frame<R>(reader: &mut R) -> Result<ReadOutcome, GossipError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_FRAME_SIZE {
        return Err(GossipError::MalformedFrame(format!(
            "frame too large: {} bytes (max {})",
            len, MAX_FRAME_SIZE
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(match decode_frame(&body) {
        Ok(frame) => ReadOutcome::Frame(frame),
        Err(e) => ReadOutcome::Malformed(e),
    })
}

// ============================================================================
// Session Table
// ============================================================================

/// Lifecycle of a peer session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PeerSessionState {
    /// Hello verified and the peer's slot reserved; no outbound queue yet.
    Connecting,
    /// Queue open and the peer registered with the engine.
    Active,
    /// Removed from the engine; the writer is flushing what is left.
    Draining,
    /// Gone from the table.
    Closed,
}

/// One state transition of one session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionEvent {
    pub peer: PeerId,
    pub state: PeerSessionState,
}

struct SessionHandle {
    id: u64,
    state: PeerSessionState,
    /// Only set while Active. Dropping it lets the writer drain and exit.
    tx: Option<mpsc::Sender<Frame>>,
    close: Arc<Notify>,
}

/// State and outbound queue of every session, keyed by peer.
pub struct SessionTable {
    sessions: RwLock<HashMap<PeerId, SessionHandle>>,
    next_id: AtomicU64,
    events: broadcast::Sender<SessionEvent>,
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTable {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            events,
        }
    }

    /// Every transition from now on, in order per peer.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    // Sent under the table lock so observers see one peer's transitions in order.
    fn emit(&self, peer: PeerId, state: PeerSessionState) {
        let _ = self.events.send(SessionEvent { peer, state });
    }

    /// Claim the slot for `peer` in Connecting. At most one session per peer
    /// in any state; a second one is refused.
    fn reserve(&self, peer: PeerId) -> Result<(u64, Arc<Notify>), GossipError> {
        let mut sessions = self.sessions.write();
        if let Some(existing) = sessions.get(&peer) {
            return Err(GossipError::TransportFailure(format!(
                "already connected to {peer} ({:?})",
                existing.state
            )));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let close = Arc::new(Notify::new());
        sessions.insert(
            peer,
            SessionHandle {
                id,
                state: PeerSessionState::Connecting,
                tx: None,
                close: close.clone(),
            },
        );
        self.emit(peer, PeerSessionState::Connecting);
        Ok((id, close))
    }

    fn activate(&self, peer: &PeerId, id: u64, tx: mpsc::Sender<Frame>) {
        let mut sessions = self.sessions.write();
        if let Some(handle) = sessions.get_mut(peer).filter(|h| h.id == id) {
            handle.state = PeerSessionState::Active;
            handle.tx = Some(tx);
            self.emit(*peer, PeerSessionState::Active);
        }
    }

    fn drain(&self, peer: &PeerId, id: u64) {
        let mut sessions = self.sessions.write();
        if let Some(handle) = sessions.get_mut(peer).filter(|h| h.id == id) {
            handle.state = PeerSessionState::Draining;
            handle.tx = None;
            self.emit(*peer, PeerSessionState::Draining);
        }
    }

    fn unregister(&self, peer: &PeerId, id: u64) {
        let mut sessions = self.sessions.write();
        if sessions.get(peer).is_some_and(|h| h.id == id) {
            sessions.remove(peer);
            self.emit(*peer, PeerSessionState::Closed);
        }
    }

    /// Current state, or `None` once the session is Closed or never existed.
    pub fn state(&self, peer: &PeerId) -> Option<PeerSessionState> {
        self.sessions.read().get(peer).map(|h| h.state)
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.sessions.read().contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

impl FrameSink for SessionTable {
    fn send_frame(&self, to: &PeerId, frame: Frame) -> Result<(), GossipError> {
        let sessions = self.sessions.read();
        let handle = sessions.get(to).ok_or(GossipError::UnknownPeer(*to))?;
        let tx = handle
            .tx
            .as_ref()
            .ok_or_else(|| GossipError::TransportFailure(format!("session is {:?}", handle.state)))?;
        tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => GossipError::TransportFailure("outbound queue full".into()),
            TrySendError::Closed(_) => GossipError::TransportFailure("session closed".into()),
        })
    }

    fn disconnect(&self, peer: &PeerId) {
        if let Some(handle) = self.sessions.read().get(peer) {
            // Stores a permit, so a reader not yet waiting still sees it.
            handle.close.notify_one();
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// A handshaken connection, registered with the engine but not yet running.
pub struct Session<T> {
    peer: PeerId,
    id: u64,
    stream: T,
    engine: Arc<SessionEngine>,
    sessions: Arc<SessionTable>,
    rx: mpsc::Receiver<Frame>,
    close: Arc<Notify>,
    shutdown: watch::Receiver<bool>,
}

impl<T> Session<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Exchange Hello frames, then take the peer through Connecting to Active.
    pub async fn establish(
        mut stream: T,
        engine: Arc<SessionEngine>,
        sessions: Arc<SessionTable>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, GossipError> {
        let config = engine.config();
        let peer = tokio::time::timeout(
            config.handshake_timeout,
            exchange_hello(&mut stream, engine.keypair(), config.max_clock_skew),
        )
        .await
        .map_err(|_| GossipError::TransportFailure("handshake timed out".into()))??;

        let (id, close) = sessions.reserve(peer)?;
        let (tx, rx) = mpsc::channel(config.outbound_queue_size);
        // Activated first so the subscription announcements land in the queue.
        sessions.activate(&peer, id, tx);
        engine.add_peer(peer);
        debug!(peer = %peer, "session established");

        Ok(Self {
            peer,
            id,
            stream,
            engine,
            sessions,
            rx,
            close,
            shutdown,
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer
    }

    /// Drive the session until the peer goes away, misbehaves, or the node stops.
    pub async fn run(self) {
        let Session {
            peer,
            id,
            stream,
            engine,
            sessions,
            rx,
            close,
            mut shutdown,
        } = self;
        let config = engine.config().clone();

        let (mut reader, writer) = tokio::io::split(stream);
        let mut writer_task: JoinHandle<Result<(), GossipError>> =
            tokio::spawn(write_loop(writer, rx, shutdown.clone(), config.ping_interval));
        let mut writer_done = false;

        let mut decode_errors = SlidingWindow::new(config.decode_error_window);
        let reason: String = loop {
            let read = tokio::select! {
                _ = shutdown.changed() => break "node shutting down".into(),
                _ = close.notified() => break "disconnected".into(),
                res = &mut writer_task, if !writer_done => {
                    writer_done = true;
                    break match res {
                        Ok(Err(e)) => format!("write failed: {e}"),
                        _ => "writer stopped".into(),
                    };
                }
                read = tokio::time::timeout(config.idle_timeout, read_frame(&mut reader)) => read,
            };

            let frame = match read {
                Err(_) => break "idle timeout".into(),
                Ok(Err(e)) => break e.to_string(),
                Ok(Ok(ReadOutcome::Malformed(e))) => {
                    let recent = decode_errors.record(Instant::now());
                    debug!(peer = %peer, error = %e, recent = recent, "undecodable frame");
                    if recent > config.max_decode_errors {
                        engine.report_malformed_flood(&peer);
                        warn!(
                            peer = %peer,
                            errors = recent,
                            window_secs = config.decode_error_window.as_secs(),
                            "too many malformed frames, closing session"
                        );
                        break "malformed frame flood".into();
                    }
                    continue;
                }
                Ok(Ok(ReadOutcome::Frame(frame))) => frame,
            };

            match frame {
                Frame::Ping(nonce) => {
                    let _ = sessions.send_frame(&peer, Frame::Pong(nonce));
                }
                frame => {
                    let kind = frame.kind();
                    if let Err(e) = engine.handle_frame(&peer, frame) {
                        debug!(peer = %peer, kind = kind, error = %e, "frame rejected");
                    }
                }
            }
        };

        sessions.drain(&peer, id);
        engine.remove_peer(&peer);

        // Draining dropped the only sender, so the writer flushes and exits.
        if !writer_done && tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer_task).await.is_err() {
            writer_task.abort();
        }
        sessions.unregister(&peer, id);
        debug!(peer = %peer, reason = %reason, "session closed");
    }
}

async fn exchange_hello<T>(stream: &mut T, keypair: &Keypair, max_skew: Duration) -> Result<PeerId, GossipError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    write_frame(stream, &Frame::Hello(Hello::new_signed(keypair, now_ms()))).await?;

    let hello = match read_frame(stream).await? {
        ReadOutcome::Frame(Frame::Hello(hello)) => hello,
        ReadOutcome::Frame(other) => {
            return Err(GossipError::MalformedFrame(format!("expected hello, got {}", other.kind())));
        }
        ReadOutcome::Malformed(e) => return Err(e.into()),
    };

    if !hello.peer_id.is_valid() {
        return Err(GossipError::MalformedFrame(format!("hello from invalid peer id {}", hello.peer_id)));
    }
    hello
        .verify()
        .map_err(|e| GossipError::MalformedFrame(format!("hello signature: {e}")))?;

    let skew = now_ms().abs_diff(hello.timestamp_ms);
    if skew > max_skew.as_millis() as u64 {
        return Err(GossipError::MalformedFrame(format!("hello timestamp off by {skew} ms")));
    }
    if hello.peer_id == keypair.peer_id() {
        return Err(GossipError::TransportFailure("refusing connection to self".into()));
    }
    Ok(hello.peer_id)
}

async fn write_loop<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<Frame>,
    mut shutdown: watch::Receiver<bool>,
    ping_interval: Duration,
) -> Result<(), GossipError>
where
    W: AsyncWrite + Unpin,
{
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + ping_interval, ping_interval);
    let mut nonce = 0u64;

    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => {
                    write_frame(&mut writer, &frame).await?;
                    ping.reset();
                }
                None => break,
            },
            _ = ping.tick() => {
                nonce = nonce.wrapping_add(1);
                write_frame(&mut writer, &Frame::Ping(nonce)).await?;
            }
            _ = shutdown.changed() => break,
        }
    }

    let _ = writer.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GossipConfig;
    use parking_lot::Mutex;
    use tokio::io::DuplexStream;

    type Delivered = Arc<Mutex<Vec<(String, Vec<u8>)>>>;

    fn engine(seed: u8, config: GossipConfig) -> (Arc<SessionEngine>, Arc<SessionTable>, Delivered) {
        let sessions = Arc::new(SessionTable::new());
        let delivered: Delivered = Arc::default();
        let log = delivered.clone();
        let receiver = move |topic: &str, payload: &[u8]| {
            log.lock().push((topic.to_string(), payload.to_vec()));
        };
        let engine = Arc::new(GossipEngine::new(
            Keypair::from_secret_key_bytes(&[seed; 32]),
            config,
            sessions.clone(),
            Arc::new(receiver),
        ));
        (engine, sessions, delivered)
    }

    async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    /// Handshake from a bare stream, as a peer that does not run an engine.
    async fn raw_handshake(stream: &mut DuplexStream, seed: u8) -> PeerId {
        let kp = Keypair::from_secret_key_bytes(&[seed; 32]);
        exchange_hello(stream, &kp, Duration::from_secs(30)).await.unwrap()
    }

    #[tokio::test]
    async fn frames_survive_framing() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let frame = Frame::Prune { topic: "alpha".into(), backoff_secs: 60 };
        write_frame(&mut a, &frame).await.unwrap();
        assert!(matches!(read_frame(&mut b).await.unwrap(), ReadOutcome::Frame(f) if f == frame));
    }

    #[tokio::test]
    async fn oversized_length_is_fatal() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes()).await.unwrap();
        assert!(matches!(read_frame(&mut b).await, Err(GossipError::MalformedFrame(_))));
    }

    #[tokio::test]
    async fn garbage_body_keeps_stream_aligned() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&4u32.to_be_bytes()).await.unwrap();
        a.write_all(&[0xff; 4]).await.unwrap();
        write_frame(&mut a, &Frame::Ping(3)).await.unwrap();

        assert!(matches!(read_frame(&mut b).await.unwrap(), ReadOutcome::Malformed(_)));
        assert!(matches!(read_frame(&mut b).await.unwrap(), ReadOutcome::Frame(Frame::Ping(3))));
    }

    #[tokio::test]
    async fn sessions_carry_gossip_between_engines() {
        let (a_engine, a_sessions, _) = engine(1, GossipConfig::default());
        let (b_engine, b_sessions, b_delivered) = engine(2, GossipConfig::default());
        a_engine.subscribe("alpha").unwrap();
        b_engine.subscribe("alpha").unwrap();

        let (_tx, shutdown) = watch::channel(false);
        let (a_stream, b_stream) = tokio::io::duplex(64 * 1024);
        let (a, b) = tokio::join!(
            Session::establish(a_stream, a_engine.clone(), a_sessions.clone(), shutdown.clone()),
            Session::establish(b_stream, b_engine.clone(), b_sessions.clone(), shutdown.clone()),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.peer_id(), b_engine.local_id());
        assert_eq!(b.peer_id(), a_engine.local_id());
        tokio::spawn(a.run());
        tokio::spawn(b.run());

        let b_id = b_engine.local_id();
        assert!(wait_until(|| a_engine.mesh_for("alpha").contains(&b_id)).await);

        a_engine.publish("alpha", b"hello".to_vec()).unwrap();
        assert!(wait_until(|| !b_delivered.lock().is_empty()).await);
        assert_eq!(*b_delivered.lock(), vec![("alpha".to_string(), b"hello".to_vec())]);
    }

    #[tokio::test]
    async fn malformed_flood_closes_session() {
        let (engine, sessions, _) = engine(1, GossipConfig::default());
        let (_tx, shutdown) = watch::channel(false);
        let (local, mut remote) = tokio::io::duplex(64 * 1024);

        let (session, peer) = tokio::join!(
            Session::establish(local, engine.clone(), sessions.clone(), shutdown),
            raw_handshake(&mut remote, 9),
        );
        let session = session.unwrap();
        assert!(engine.connected_peers().contains(&peer));
        let task = tokio::spawn(session.run());

        for _ in 0..1000 {
            if remote.write_all(&4u32.to_be_bytes()).await.is_err() || remote.write_all(&[0xff; 4]).await.is_err() {
                break;
            }
        }

        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(!engine.connected_peers().contains(&peer));
        assert!(!sessions.contains(&peer));
        assert!(engine.is_graylisted(&peer));
    }

    #[tokio::test]
    async fn sparse_malformed_frames_keep_session_up() {
        let (engine, sessions, _) = engine(1, GossipConfig::default());
        let (_tx, shutdown) = watch::channel(false);
        let (local, mut remote) = tokio::io::duplex(64 * 1024);

        let (session, peer) = tokio::join!(
            Session::establish(local, engine.clone(), sessions.clone(), shutdown),
            raw_handshake(&mut remote, 9),
        );
        tokio::spawn(session.unwrap().run());

        // Exactly the tolerated count, with heartbeats decaying and checking scores in between.
        for _ in 0..engine.config().max_decode_errors {
            remote.write_all(&4u32.to_be_bytes()).await.unwrap();
            remote.write_all(&[0xff; 4]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            engine.heartbeat();
        }

        // Frames are read in order, so the pong proves every bad frame was seen.
        write_frame(&mut remote, &Frame::Ping(7)).await.unwrap();
        let pong = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let ReadOutcome::Frame(Frame::Pong(n)) = read_frame(&mut remote).await.unwrap() {
                    return n;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(pong, 7);

        engine.heartbeat();
        assert_eq!(sessions.state(&peer), Some(PeerSessionState::Active));
        assert!(engine.connected_peers().contains(&peer));
        assert!(!engine.is_graylisted(&peer));
        assert_eq!(engine.score(&peer), 0.0);
    }

    #[tokio::test]
    async fn table_tracks_each_transition() {
        let table = SessionTable::new();
        let mut events = table.subscribe_events();
        let peer = Keypair::from_secret_key_bytes(&[9; 32]).peer_id();

        let (id, _close) = table.reserve(peer).unwrap();
        assert_eq!(table.state(&peer), Some(PeerSessionState::Connecting));
        assert!(matches!(table.send_frame(&peer, Frame::Ping(1)), Err(GossipError::TransportFailure(_))));
        assert!(table.reserve(peer).is_err());

        let (tx, mut rx) = mpsc::channel(4);
        table.activate(&peer, id, tx);
        assert_eq!(table.state(&peer), Some(PeerSessionState::Active));
        table.send_frame(&peer, Frame::Ping(2)).unwrap();
        assert_eq!(rx.recv().await, Some(Frame::Ping(2)));

        table.drain(&peer, id);
        assert_eq!(table.state(&peer), Some(PeerSessionState::Draining));
        assert!(matches!(table.send_frame(&peer, Frame::Ping(3)), Err(GossipError::TransportFailure(_))));
        assert_eq!(rx.recv().await, None);

        // A stale id from an earlier session must not evict this one.
        table.unregister(&peer, id + 1);
        assert_eq!(table.state(&peer), Some(PeerSessionState::Draining));
        table.unregister(&peer, id);
        assert_eq!(table.state(&peer), None);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            assert_eq!(event.peer, peer);
            seen.push(event.state);
        }
        assert_eq!(
            seen,
            vec![
                PeerSessionState::Connecting,
                PeerSessionState::Active,
                PeerSessionState::Draining,
                PeerSessionState::Closed,
            ]
        );
    }

    #[tokio::test]
    async fn session_reports_lifecycle_events() {
        let (engine, sessions, _) = engine(1, GossipConfig::default());
        let mut events = sessions.subscribe_events();
        let (_tx, shutdown) = watch::channel(false);
        let (local, mut remote) = tokio::io::duplex(64 * 1024);

        let (session, peer) = tokio::join!(
            Session::establish(local, engine.clone(), sessions.clone(), shutdown),
            raw_handshake(&mut remote, 9),
        );
        let task = tokio::spawn(session.unwrap().run());
        assert_eq!(events.recv().await.unwrap().state, PeerSessionState::Connecting);
        assert_eq!(events.recv().await.unwrap().state, PeerSessionState::Active);

        drop(remote);
        assert_eq!(events.recv().await.unwrap().state, PeerSessionState::Draining);
        assert_eq!(events.recv().await.unwrap().state, PeerSessionState::Closed);
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(sessions.state(&peer), None);
        assert!(!engine.connected_peers().contains(&peer));
    }

    #[tokio::test]
    async fn hello_with_degenerate_id_is_refused() {
        let (engine, sessions, _) = engine(1, GossipConfig::default());
        let (_tx, shutdown) = watch::channel(false);
        let (local, mut remote) = tokio::io::duplex(64 * 1024);

        let forged = Hello {
            peer_id: PeerId::from_bytes([0u8; 32]),
            timestamp_ms: now_ms(),
            signature: vec![0u8; 64],
        };
        write_frame(&mut remote, &Frame::Hello(forged)).await.unwrap();

        let result = Session::establish(local, engine, sessions.clone(), shutdown).await;
        assert!(matches!(result, Err(GossipError::MalformedFrame(msg)) if msg.contains("invalid peer id")));
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn ping_is_answered() {
        let (engine, sessions, _) = engine(1, GossipConfig::default());
        let (_tx, shutdown) = watch::channel(false);
        let (local, mut remote) = tokio::io::duplex(64 * 1024);

        let (session, _) = tokio::join!(
            Session::establish(local, engine.clone(), sessions.clone(), shutdown),
            raw_handshake(&mut remote, 9),
        );
        tokio::spawn(session.unwrap().run());

        write_frame(&mut remote, &Frame::Ping(42)).await.unwrap();
        let pong = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let ReadOutcome::Frame(Frame::Pong(n)) = read_frame(&mut remote).await.unwrap() {
                    return n;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(pong, 42);
    }

    #[tokio::test]
    async fn disconnect_tears_session_down() {
        let (engine, sessions, _) = engine(1, GossipConfig::default());
        let (_tx, shutdown) = watch::channel(false);
        let (local, mut remote) = tokio::io::duplex(64 * 1024);

        let (session, peer) = tokio::join!(
            Session::establish(local, engine.clone(), sessions.clone(), shutdown),
            raw_handshake(&mut remote, 9),
        );
        let task = tokio::spawn(session.unwrap().run());

        sessions.disconnect(&peer);
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(sessions.is_empty());
        assert!(engine.connected_peers().is_empty());
        assert!(matches!(
            sessions.send_frame(&peer, Frame::Ping(1)),
            Err(GossipError::UnknownPeer(_))
        ));
    }

    #[tokio::test]
    async fn shutdown_signal_stops_session() {
        let (engine, sessions, _) = engine(1, GossipConfig::default());
        let (tx, shutdown) = watch::channel(false);
        let (local, mut remote) = tokio::io::duplex(64 * 1024);

        let (session, _) = tokio::join!(
            Session::establish(local, engine.clone(), sessions.clone(), shutdown),
            raw_handshake(&mut remote, 9),
        );
        let task = tokio::spawn(session.unwrap().run());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn self_connection_is_refused() {
        let (a_engine, a_sessions, _) = engine(1, GossipConfig::default());
        let (b_engine, b_sessions, _) = engine(1, GossipConfig::default());
        let (_tx, shutdown) = watch::channel(false);
        let (a_stream, b_stream) = tokio::io::duplex(64 * 1024);

        let (a, b) = tokio::join!(
            Session::establish(a_stream, a_engine, a_sessions.clone(), shutdown.clone()),
            Session::establish(b_stream, b_engine, b_sessions, shutdown),
        );
        assert!(matches!(a, Err(GossipError::TransportFailure(_))));
        assert!(matches!(b, Err(GossipError::TransportFailure(_))));
        assert!(a_sessions.is_empty());
    }

    #[tokio::test]
    async fn duplicate_session_is_refused() {
        let (engine, sessions, _) = engine(1, GossipConfig::default());
        let (_tx, shutdown) = watch::channel(false);

        let (first, mut first_remote) = tokio::io::duplex(64 * 1024);
        let (session, _) = tokio::join!(
            Session::establish(first, engine.clone(), sessions.clone(), shutdown.clone()),
            raw_handshake(&mut first_remote, 9),
        );
        let _session = session.unwrap();

        let (second, mut second_remote) = tokio::io::duplex(64 * 1024);
        let (again, _) = tokio::join!(
            Session::establish(second, engine.clone(), sessions.clone(), shutdown),
            raw_handshake(&mut second_remote, 9),
        );
        assert!(matches!(again, Err(GossipError::TransportFailure(_))));
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_fails_handshake() {
        let (engine, sessions, _) = engine(1, GossipConfig::default());
        let (_tx, shutdown) = watch::channel(false);
        let (local, _remote) = tokio::io::duplex(64 * 1024);

        let result = Session::establish(local, engine, sessions.clone(), shutdown).await;
        assert!(matches!(result, Err(GossipError::TransportFailure(msg)) if msg.contains("timed out")));
        assert!(sessions.is_empty());
    }
}
