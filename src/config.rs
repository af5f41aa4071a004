//! # Configuration
//!
//! Two layers:
//!
//! - [`NetworkArgs`]: the command-line surface shared by the `murmur` binary and
//!   the [`start`](crate::start) boundary (listen address, bootstrap peers,
//!   topics, and a handful of tuning flags)
//! - [`GossipConfig`]: every protocol constant, with defaults taken from the
//!   `DEFAULT_*` values below
//!
//! [`NetworkConfig`] is the validated combination handed to [`Node::start`](crate::Node::start).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use clap::Parser;

use crate::error::GossipError;
use crate::messages::is_valid_topic;
use crate::score::ScoreParams;

// ============================================================================
// Mesh Parameters
// ============================================================================

/// D - target number of peers in the mesh per topic.
pub const DEFAULT_MESH_N: usize = 6;

/// D_lo - mesh size below which rebalance grafts more peers.
pub const DEFAULT_MESH_N_LOW: usize = 5;

/// D_hi - mesh size above which rebalance prunes peers.
pub const DEFAULT_MESH_N_HIGH: usize = 12;

/// D_lazy - peers receiving IHAVE gossip per topic per heartbeat.
pub const DEFAULT_GOSSIP_LAZY: usize = 6;

/// Interval between heartbeat rounds (eviction, rebalance, gossip, decay).
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// How long a pruned peer stays out of our mesh for that topic.
pub const DEFAULT_PRUNE_BACKOFF: Duration = Duration::from_secs(60);

// ============================================================================
// Cache Parameters
// ============================================================================

/// Retention window of the deduplication cache.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(120);

/// Hard cap on deduplication entries.
/// SECURITY: bounds memory under message floods; oldest entries go first.
pub const DEFAULT_CACHE_CAPACITY: usize = 100_000;

/// How long message bodies are kept for IWANT replies and IHAVE gossip.
pub const DEFAULT_HISTORY_WINDOW: Duration = Duration::from_secs(3);

/// Maximum message bodies retained for IWANT replies.
pub const DEFAULT_HISTORY_CAPACITY: usize = 5_000;

/// Maximum ids in a single IHAVE or IWANT frame.
pub const DEFAULT_MAX_IHAVE_LENGTH: usize = 64;

// ============================================================================
// Validation Limits
// ============================================================================

/// Maximum message payload size (64 KiB).
/// SECURITY: prevents memory exhaustion from large messages.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Messages older than this are rejected as expired.
pub const DEFAULT_MAX_MESSAGE_AGE: Duration = Duration::from_secs(300);

/// Messages stamped further than this in the future are rejected.
pub const DEFAULT_MAX_CLOCK_SKEW: Duration = Duration::from_secs(30);

/// Local publishes allowed per second.
pub const DEFAULT_PUBLISH_RATE_LIMIT: usize = 100;

// ============================================================================
// Session Parameters
// ============================================================================

/// Bounded per-session outbound queue.
/// SECURITY: a slow receiver only ever costs this many buffered frames.
pub const DEFAULT_OUTBOUND_QUEUE_SIZE: usize = 256;

/// Decode errors tolerated within [`DEFAULT_DECODE_ERROR_WINDOW`] before teardown.
pub const DEFAULT_MAX_DECODE_ERRORS: usize = 10;

pub const DEFAULT_DECODE_ERROR_WINDOW: Duration = Duration::from_secs(10);

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Writer sends a Ping after this long without outbound traffic.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(20);

/// Reader tears the session down after this long without inbound traffic.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on cooperative shutdown before remaining sessions are aborted.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Topic used when none is configured.
pub const DEFAULT_TOPIC: &str = "beacon_block";

pub const DEFAULT_PORT: u16 = 9000;

/// Protocol tunables.
#[derive(Clone, Debug)]
pub struct GossipConfig {
    pub mesh_n: usize,
    pub mesh_n_low: usize,
    pub mesh_n_high: usize,
    pub gossip_lazy: usize,
    pub heartbeat_interval: Duration,
    pub prune_backoff: Duration,

    pub cache_ttl: Duration,
    pub cache_capacity: usize,
    pub history_window: Duration,
    pub history_capacity: usize,
    pub max_ihave_length: usize,

    pub max_message_size: usize,
    pub max_message_age: Duration,
    pub max_clock_skew: Duration,
    pub publish_rate_limit: usize,

    pub outbound_queue_size: usize,
    pub max_decode_errors: usize,
    pub decode_error_window: Duration,
    pub handshake_timeout: Duration,
    pub ping_interval: Duration,
    pub idle_timeout: Duration,
    pub shutdown_timeout: Duration,

    pub score: ScoreParams,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            mesh_n: DEFAULT_MESH_N,
            mesh_n_low: DEFAULT_MESH_N_LOW,
            mesh_n_high: DEFAULT_MESH_N_HIGH,
            gossip_lazy: DEFAULT_GOSSIP_LAZY,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            prune_backoff: DEFAULT_PRUNE_BACKOFF,
            cache_ttl: DEFAULT_CACHE_TTL,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            history_window: DEFAULT_HISTORY_WINDOW,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            max_ihave_length: DEFAULT_MAX_IHAVE_LENGTH,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_message_age: DEFAULT_MAX_MESSAGE_AGE,
            max_clock_skew: DEFAULT_MAX_CLOCK_SKEW,
            publish_rate_limit: DEFAULT_PUBLISH_RATE_LIMIT,
            outbound_queue_size: DEFAULT_OUTBOUND_QUEUE_SIZE,
            max_decode_errors: DEFAULT_MAX_DECODE_ERRORS,
            decode_error_window: DEFAULT_DECODE_ERROR_WINDOW,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            ping_interval: DEFAULT_PING_INTERVAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            score: ScoreParams::default(),
        }
    }
}

impl GossipConfig {
    /// Check the relations between fields that the protocol relies on.
    pub fn validate(&self) -> Result<(), GossipError> {
        if self.mesh_n_low == 0 || self.mesh_n_low > self.mesh_n || self.mesh_n > self.mesh_n_high {
            return Err(GossipError::StartupFailure(format!(
                "mesh watermarks must satisfy 0 < low <= n <= high (got {}/{}/{})",
                self.mesh_n_low, self.mesh_n, self.mesh_n_high
            )));
        }
        if self.cache_capacity == 0 || self.history_capacity == 0 || self.outbound_queue_size == 0 {
            return Err(GossipError::StartupFailure(
                "cache, history and queue capacities must be non-zero".into(),
            ));
        }
        if self.history_window > self.cache_ttl {
            return Err(GossipError::StartupFailure(
                "history window must not exceed cache retention".into(),
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(GossipError::StartupFailure("heartbeat interval must be non-zero".into()));
        }
        Ok(())
    }
}

/// Command-line arguments accepted by the binary and by [`start`](crate::start).
#[derive(Parser, Debug, Clone)]
#[command(name = "murmur", version, about = "Gossip network node")]
pub struct NetworkArgs {
    /// Address to listen on.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub listen_address: IpAddr,

    /// TCP port to listen on (0 picks a free port).
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Bootstrap peers as comma-separated IP:PORT.
    #[arg(short = 'B', long, value_delimiter = ',')]
    pub boot_nodes: Vec<SocketAddr>,

    /// Topics to subscribe to, comma-separated.
    #[arg(short, long, value_delimiter = ',', default_value = DEFAULT_TOPIC)]
    pub topics: Vec<String>,

    /// Target mesh size per topic.
    #[arg(long, default_value_t = DEFAULT_MESH_N)]
    pub mesh_n: usize,

    #[arg(long, default_value_t = DEFAULT_MESH_N_LOW)]
    pub mesh_n_low: usize,

    #[arg(long, default_value_t = DEFAULT_MESH_N_HIGH)]
    pub mesh_n_high: usize,

    /// Heartbeat interval in milliseconds.
    #[arg(long, default_value_t = DEFAULT_HEARTBEAT_INTERVAL.as_millis() as u64)]
    pub heartbeat_ms: u64,

    /// Deduplication retention in seconds.
    #[arg(long, default_value_t = DEFAULT_CACHE_TTL.as_secs())]
    pub cache_ttl_secs: u64,
}

#[derive(Clone, Debug)]
pub struct NetworkConfig {
    pub listen_addr: SocketAddr,
    pub boot_nodes: Vec<SocketAddr>,
    pub topics: Vec<String>,
    pub gossip: GossipConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            boot_nodes: Vec::new(),
            topics: vec![DEFAULT_TOPIC.to_string()],
            gossip: GossipConfig::default(),
        }
    }
}

impl NetworkConfig {
    /// Parse an argument vector whose first element is the program name.
    pub fn from_args<I, T>(args: I) -> Result<Self, GossipError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let args = NetworkArgs::try_parse_from(args)
            .map_err(|e| GossipError::StartupFailure(e.to_string()))?;
        Self::try_from(args)
    }

    pub fn validate(&self) -> Result<(), GossipError> {
        if let Some(bad) = self.topics.iter().find(|t| !is_valid_topic(t)) {
            return Err(GossipError::StartupFailure(format!("invalid topic {bad:?}")));
        }
        self.gossip.validate()
    }
}

impl TryFrom<NetworkArgs> for NetworkConfig {
    type Error = GossipError;

    fn try_from(args: NetworkArgs) -> Result<Self, Self::Error> {
        let mut topics = args.topics;
        topics.retain(|t| !t.is_empty());
        topics.dedup();

        let config = NetworkConfig {
            listen_addr: SocketAddr::new(args.listen_address, args.port),
            boot_nodes: args.boot_nodes,
            topics,
            gossip: GossipConfig {
                mesh_n: args.mesh_n,
                mesh_n_low: args.mesh_n_low,
                mesh_n_high: args.mesh_n_high,
                heartbeat_interval: Duration::from_millis(args.heartbeat_ms),
                cache_ttl: Duration::from_secs(args.cache_ttl_secs),
                ..GossipConfig::default()
            },
        };
        config.validate()?;
        Ok(config)
    }
}
