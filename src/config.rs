//! Protocol constants and session tuning parameters.
//!
//! Fixed wire-protocol values live here as constants; everything that is a
//! policy knob (window sizes, tick intervals, scoring coefficients) lives in
//! [`Config`] so callers can override the defaults.

use std::time::Duration;

/// Client ID prefix for peer ID generation (Azureus-style).
pub const CLIENT_PREFIX: &[u8] = b"-RP0001-";

/// Default listen port advertised to trackers.
pub const DEFAULT_PORT: u16 = 6881;

/// Block size: the unit of a wire `request` (16 KiB).
pub const BLOCK_SIZE: u32 = 16384;

/// Largest `request` length we will serve. Larger requests are suspicious.
pub const MAX_REQUEST_LENGTH: u32 = 131072;

/// Largest frame we will accept before dropping the connection.
pub const MAX_FRAME_SIZE: usize = 2 * 1024 * 1024;

/// Handshake must complete within this budget.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// One announce to one tracker may take at most this long.
pub const TRACKER_TIMEOUT: Duration = Duration::from_secs(30);

/// Session tuning parameters.
///
/// Defaults follow common client practice; all of them can be overridden
/// before the session starts.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port reported to trackers.
    pub port: u16,
    /// Maximum concurrently connected peers.
    pub max_peers: usize,
    /// Outstanding block requests per peer (pipeline window).
    pub pipeline_depth: usize,
    /// A block request not answered within this window is rescinded.
    pub request_timeout: Duration,
    /// Keep-alive cadence on an otherwise quiet connection.
    pub keepalive_interval: Duration,
    /// Drop a peer after this long without any inbound traffic.
    pub idle_timeout: Duration,
    /// Outbound message queue capacity per peer; overflow fails the send.
    pub outbound_queue: usize,
    /// Choke scheduler tick.
    pub choke_interval: Duration,
    /// Rotate the optimistic unchoke every N choke rounds.
    pub optimistic_every: u32,
    /// An unchoked peer delivering nothing for this long is snubbed.
    pub snub_timeout: Duration,
    /// EWMA smoothing factor for rate samples.
    pub ewma_alpha: f64,
    /// Trust counter ceiling; bonus is (1 + trust/cap).
    pub trust_cap: u32,
    /// Minimum unchoke slot count.
    pub base_slots: usize,
    /// Bandwidth per extra unchoke slot, and the safety margin (bytes/sec).
    pub slot_bandwidth: u64,
    /// Enter endgame when this many pieces or fewer remain.
    pub endgame_threshold: usize,
    /// Disconnect a peer after this many corrupt-piece contributions.
    pub max_corrupt_strikes: u32,
    /// Concurrent disk operations (reads, writes, verification hashes).
    pub disk_permits: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_peers: 50,
            pipeline_depth: 50,
            request_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(120),
            idle_timeout: Duration::from_secs(120),
            outbound_queue: 256,
            choke_interval: Duration::from_secs(10),
            optimistic_every: 3,
            snub_timeout: Duration::from_secs(60),
            ewma_alpha: 0.2,
            trust_cap: 10,
            base_slots: 4,
            slot_bandwidth: 50 * 1024,
            endgame_threshold: 20,
            max_corrupt_strikes: 3,
            disk_permits: 4,
        }
    }
}
