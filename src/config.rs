//! Overlay configuration.
//!
//! All tunables for the peer manager. Defaults match the protocol's
//! deployed values; library users override individual fields after
//! `MeshConfig::default()`.

use std::time::Duration;

/// Hard ceiling on peers holding a connection. Past this, incoming
/// signalling requests are answered with a `Congested` disconnect notice.
pub const DEFAULT_MAX_PEERS: usize = 10_000;

/// Soft target for the connected-peer count; outbound dials stop above it
/// (upgrading an already-connected peer is always allowed).
pub const DEFAULT_TARGET_PEERS: usize = 50;

/// Interval between peer-list gossip broadcasts.
pub const DEFAULT_BROADCAST_INTERVAL: Duration = Duration::from_secs(5);

/// Interval between disposal sweeps over the peer set.
pub const DEFAULT_DISPOSE_INTERVAL: Duration = Duration::from_secs(2);

/// Maximum accepted length for an advertised peer name.
pub const DEFAULT_NAME_MAX_LEN: usize = 32;

/// How long a `Congested` rejection asks the remote to stay away.
pub const CONGESTED_DISCONNECT_WINDOW: Duration = Duration::from_secs(300);

/// Disconnect window attached to the `ShuttingDown` notice sent on `stop()`.
pub const SHUTDOWN_DISCONNECT_WINDOW: Duration = Duration::from_secs(60);

/// Peer manager configuration.
#[derive(Clone, Debug)]
pub struct MeshConfig {
    /// Hard ceiling on peers with a connection (congestion threshold).
    pub max_peers: usize,
    /// Soft target for the connected-peer count.
    pub target_peers: usize,
    /// Peer-list gossip interval.
    pub broadcast_interval: Duration,
    /// Disposal sweep interval.
    pub dispose_interval: Duration,
    /// Maximum accepted peer name length.
    pub name_max_len: usize,
    /// Addresses whose peers bypass retry back-off entirely.
    pub whitelist: Vec<String>,
    /// Whether this node is a worker. Workers neither apply nor produce
    /// peer-list gossip.
    pub is_worker: bool,
    /// Whether worker peers are included in outgoing peer lists.
    pub broadcast_workers: bool,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            max_peers: DEFAULT_MAX_PEERS,
            target_peers: DEFAULT_TARGET_PEERS,
            broadcast_interval: DEFAULT_BROADCAST_INTERVAL,
            dispose_interval: DEFAULT_DISPOSE_INTERVAL,
            name_max_len: DEFAULT_NAME_MAX_LEN,
            whitelist: Vec::new(),
            is_worker: false,
            broadcast_workers: false,
        }
    }
}

impl MeshConfig {
    /// Whether an address is on the retry whitelist.
    pub fn is_whitelisted(&self, address: &str) -> bool {
        self.whitelist.iter().any(|a| a == address)
    }
}
