//! Public event stream.
//!
//! The manager exposes a single typed channel of [`MeshEvent`]s instead of
//! per-callback registration; subscribers own the receiver returned at
//! construction and drop it to unsubscribe.

use crate::identity::Identity;
use crate::peer::PeerId;

/// Something the overlay wants the application to know.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    /// A peer completed its first handshake on some connection.
    PeerConnected { peer: PeerId, identity: Identity },
    /// A peer's last live connection closed.
    PeerDisconnected { peer: PeerId },
    /// An application frame arrived from an identified peer.
    Message { peer: PeerId, data: Vec<u8> },
    /// The set of connected peers changed.
    ConnectedPeersChanged,
    /// A peer's neighbour edges changed.
    KnownPeersChanged { peer: PeerId },
}
