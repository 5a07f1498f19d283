//! # Weft - Peer-to-Peer Overlay Peer Manager
//!
//! Weft maintains a live mesh of mutually-authenticated nodes exchanging
//! application messages over a choice of transports:
//!
//! - **Identity**: Ed25519-based cryptographic identities (32-byte public keys)
//! - **Handshake**: every session authenticates with an `Identify` exchange
//!   before application traffic flows
//! - **Dual transports**: direct (address-dialled) and assisted (formed by
//!   brokered signalling, for NAT traversal)
//! - **Gossip**: the connected-peer graph spreads through periodic peer
//!   lists, feeding broker selection for assisted dials
//!
//! ## Architecture
//!
//! The codebase uses the **Actor Pattern** for safe concurrent state:
//! - [`Node`] is the public handle; a private actor owns the [`PeerManager`]
//! - Handles are cheap to clone and communicate via async channels
//! - The actor owns all mutable state and processes commands, transport
//!   events, and periodic timers strictly sequentially
//!
//! ## Boundaries
//!
//! The overlay core relays only its own five control messages, a single hop
//! at most: it is not a routing overlay and offers no delivery guarantees
//! for application frames. The cryptographic boxing of signalling payloads
//! and the transport sessions themselves are consumed as interfaces
//! ([`MessageBox`], [`DirectTransport`], [`AssistedTransport`]); an
//! in-process implementation of the transports ships in
//! [`transport::memory`] for tests and simulation.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API: handle + actor around the manager |
//! | `manager` | Peer life-cycle, handshake, arbitration, relay, gossip |
//! | `peer` | Per-peer records, slots, neighbour edges; the local peer |
//! | `connection` | Per-transport session state machines |
//! | `retry` | Outbound dial cooldown and back-off |
//! | `identity` | Keypairs, identities, tie-break predicates, versions |
//! | `messages` | Overlay-control wire messages |
//! | `transport` | Transport interfaces and the in-process implementation |
//! | `crypto` | Boxing interface for signalling payloads |
//! | `config` | Tunables and their deployed defaults |
//! | `error` | Failure classification |
//! | `event` | Public event stream |

pub mod config;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod event;
pub mod identity;
pub mod manager;
pub mod messages;
pub mod node;
pub mod peer;
pub mod retry;
pub mod transport;

pub use config::MeshConfig;
pub use connection::{Connection, ConnectionState, Direction, TransportKind};
pub use crypto::{BoxedPayload, MessageBox};
pub use error::{MeshError, PolicyViolation, ProtocolViolation};
pub use event::MeshEvent;
pub use identity::{
    can_initiate, can_keep_duplicate, is_valid_identity, AgentVersion, Identity, Keypair,
};
pub use manager::{MeshStats, PeerManager, PeerSummary};
pub use messages::{ControlMessage, DisconnectReason, Frame};
pub use node::Node;
pub use peer::{LocalPeer, Peer, PeerId, PeerState};
pub use transport::{
    AssistedTransport, ConnectionId, DirectTransport, SessionHandle, SignalingPayload,
    TransportEvent,
};
