//! # Peer Records
//!
//! A [`Peer`] aggregates everything known about one remote node: at most
//! one connection per transport kind, per-transport retry state, the
//! neighbour edges learned through gossip, and the disconnect windows both
//! sides may have requested. Peer state is derived: the monotonic join of
//! the two connection slots.
//!
//! Neighbour edges (`known_peers`) hold *identities*, never peer
//! references; all lookups go through the manager's registries. That keeps
//! the peer graph cycle-free even though peers reference peers.
//!
//! [`LocalPeer`] is this node's own half of the picture: identity keypair,
//! version, listening port, and the boxing primitive for signalling
//! payloads.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::connection::{Connection, TransportKind};
use crate::crypto::MessageBox;
use crate::error::MeshError;
use crate::identity::{AgentVersion, Identity, Keypair};
use crate::messages::{DisconnectReason, IdentifyPayload};
use crate::retry::RetryState;

/// Stable token identifying a peer record for the lifetime of a manager.
///
/// Tokens stay valid across duplicate-record merges: the incumbent record
/// keeps its token, and a merged-away token resolves to a disconnected
/// record until the disposal sweep removes it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub(crate) u64);

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Derived peer state: the join of the connection slots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerState {
    /// No live connection.
    Disconnected,
    /// At least one connection exists, none authenticated yet.
    Connecting,
    /// At least one connection is authenticated.
    Connected { identity: Identity },
}

impl PeerState {
    pub fn is_connected(&self) -> bool {
        matches!(self, PeerState::Connected { .. })
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, PeerState::Disconnected)
    }
}

/// A requested-disconnect window: stay away until the timestamp.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DisconnectWindow {
    pub reason: DisconnectReason,
    pub until_ms: u64,
}

/// Everything known about one remote node.
pub struct Peer {
    id: PeerId,
    identity: Option<Identity>,
    name: Option<String>,
    address: Option<String>,
    port: Option<u16>,
    version: Option<AgentVersion>,
    is_worker: bool,
    is_whitelisted: bool,
    local_disconnect: Option<DisconnectWindow>,
    peer_disconnect: Option<DisconnectWindow>,
    known_peers: BTreeSet<Identity>,
    direct_retry: RetryState,
    assisted_retry: RetryState,
    direct: Option<Connection>,
    assisted: Option<Connection>,
    disposed: bool,
}

impl Peer {
    pub(crate) fn new(id: PeerId) -> Self {
        Self {
            id,
            identity: None,
            name: None,
            address: None,
            port: None,
            version: None,
            is_worker: false,
            is_whitelisted: false,
            local_disconnect: None,
            peer_disconnect: None,
            known_peers: BTreeSet::new(),
            direct_retry: RetryState::new(),
            assisted_retry: RetryState::new(),
            direct: None,
            assisted: None,
            disposed: false,
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub(crate) fn set_identity(&mut self, identity: Identity) {
        self.identity = Some(identity);
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn set_name(&mut self, name: Option<String>) {
        self.name = name;
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub(crate) fn set_address(&mut self, address: Option<String>) {
        self.address = address;
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub(crate) fn set_port(&mut self, port: Option<u16>) {
        self.port = port;
    }

    pub fn version(&self) -> Option<&AgentVersion> {
        self.version.as_ref()
    }

    pub(crate) fn set_version(&mut self, version: AgentVersion) {
        self.version = Some(version);
    }

    pub fn is_worker(&self) -> bool {
        self.is_worker
    }

    pub(crate) fn set_worker(&mut self, is_worker: bool) {
        self.is_worker = is_worker;
    }

    pub fn is_whitelisted(&self) -> bool {
        self.is_whitelisted
    }

    pub(crate) fn set_whitelisted(&mut self, whitelisted: bool) {
        self.is_whitelisted = whitelisted;
    }

    pub fn local_disconnect(&self) -> Option<DisconnectWindow> {
        self.local_disconnect
    }

    pub(crate) fn set_local_disconnect(&mut self, window: DisconnectWindow) {
        self.local_disconnect = Some(window);
    }

    pub fn peer_disconnect(&self) -> Option<DisconnectWindow> {
        self.peer_disconnect
    }

    pub(crate) fn set_peer_disconnect(&mut self, window: DisconnectWindow) {
        self.peer_disconnect = Some(window);
    }

    /// Whether the remote has asked us to stay away as of `now`.
    pub fn peer_disconnect_active(&self, now_ms: u64) -> bool {
        self.peer_disconnect
            .map(|w| now_ms < w.until_ms)
            .unwrap_or(false)
    }

    /// Whether we have asked the remote to stay away as of `now`.
    pub fn local_disconnect_active(&self, now_ms: u64) -> bool {
        self.local_disconnect
            .map(|w| now_ms < w.until_ms)
            .unwrap_or(false)
    }

    // ------------------------------------------------------------------
    // Connection slots
    // ------------------------------------------------------------------

    pub fn connection(&self, kind: TransportKind) -> Option<&Connection> {
        match kind {
            TransportKind::Direct => self.direct.as_ref(),
            TransportKind::Assisted => self.assisted.as_ref(),
        }
    }

    pub(crate) fn connection_mut(&mut self, kind: TransportKind) -> Option<&mut Connection> {
        match kind {
            TransportKind::Direct => self.direct.as_mut(),
            TransportKind::Assisted => self.assisted.as_mut(),
        }
    }

    /// Install a connection into its slot. Any previously installed
    /// connection is closed first and returned so the caller can unregister
    /// it.
    pub(crate) fn install_connection(&mut self, conn: Connection) -> Option<Connection> {
        let slot = match conn.kind() {
            TransportKind::Direct => &mut self.direct,
            TransportKind::Assisted => &mut self.assisted,
        };
        let mut displaced = slot.replace(conn);
        if let Some(old) = displaced.as_mut() {
            debug!(peer = %self.id, conn = %old.id(), "displacing connection from slot");
            old.close(Some(MeshError::Network(
                "connection replaced in its slot".to_string(),
            )));
        }
        displaced
    }

    /// Detach a connection from its slot without closing it.
    pub(crate) fn take_connection(&mut self, kind: TransportKind) -> Option<Connection> {
        match kind {
            TransportKind::Direct => self.direct.take(),
            TransportKind::Assisted => self.assisted.take(),
        }
    }

    /// Close every live connection. Returns the detached connections so the
    /// caller can unregister them.
    pub(crate) fn close(&mut self, error: Option<MeshError>) -> Vec<Connection> {
        let mut out = Vec::new();
        for kind in [TransportKind::Direct, TransportKind::Assisted] {
            if let Some(mut conn) = self.take_connection(kind) {
                conn.close(error.clone());
                out.push(conn);
            }
        }
        out
    }

    // ------------------------------------------------------------------
    // Derived state
    // ------------------------------------------------------------------

    /// The monotonic join of the connection slots.
    pub fn state(&self) -> PeerState {
        for conn in [self.direct.as_ref(), self.assisted.as_ref()]
            .into_iter()
            .flatten()
        {
            if let crate::connection::ConnectionState::Connected { identity } = conn.state() {
                return PeerState::Connected {
                    identity: *identity,
                };
            }
        }
        if self.direct.is_some() || self.assisted.is_some() {
            PeerState::Connecting
        } else {
            PeerState::Disconnected
        }
    }

    // ------------------------------------------------------------------
    // Retry
    // ------------------------------------------------------------------

    pub fn retry(&self, kind: TransportKind) -> &RetryState {
        match kind {
            TransportKind::Direct => &self.direct_retry,
            TransportKind::Assisted => &self.assisted_retry,
        }
    }

    pub(crate) fn retry_mut(&mut self, kind: TransportKind) -> &mut RetryState {
        match kind {
            TransportKind::Direct => &mut self.direct_retry,
            TransportKind::Assisted => &mut self.assisted_retry,
        }
    }

    /// Write the peer off for every transport.
    pub(crate) fn never_retry_all(&mut self) {
        self.direct_retry.never_retry_connecting();
        self.assisted_retry.never_retry_connecting();
    }

    // ------------------------------------------------------------------
    // Neighbour edges
    // ------------------------------------------------------------------

    pub fn known_peers(&self) -> &BTreeSet<Identity> {
        &self.known_peers
    }

    /// Record a neighbour edge. Returns whether anything changed.
    pub(crate) fn add_known_peer(&mut self, identity: Identity) -> bool {
        self.known_peers.insert(identity)
    }

    /// Drop a neighbour edge. Returns whether anything changed.
    pub(crate) fn remove_known_peer(&mut self, identity: &Identity) -> bool {
        self.known_peers.remove(identity)
    }

    // ------------------------------------------------------------------
    // Disposal
    // ------------------------------------------------------------------

    /// Clear the record for removal from the registries. The caller has
    /// already verified the disposal conditions.
    pub(crate) fn dispose(&mut self) {
        debug_assert!(
            self.state().is_disconnected(),
            "disposing a peer with live connections"
        );
        self.known_peers.clear();
        self.disposed = true;
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Stable human label for diagnostics only.
    pub fn display_name(&self) -> String {
        match (&self.identity, &self.name) {
            (Some(identity), Some(name)) => format!("{}@{}", name, identity.short()),
            (Some(identity), None) => format!("@{}", identity.short()),
            (None, _) => match (&self.address, self.port) {
                (Some(addr), Some(port)) => format!("{}:{}", addr, port),
                (Some(addr), None) => addr.clone(),
                (None, _) => format!("{}", self.id),
            },
        }
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("state", &self.state())
            .field("display", &self.display_name())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Local Peer
// ============================================================================

/// This node's own identity, version, endpoint, and boxing primitive.
#[derive(Clone)]
pub struct LocalPeer {
    keypair: Keypair,
    version: AgentVersion,
    port: Option<u16>,
    name: Option<String>,
    is_worker: bool,
    boxer: Arc<dyn MessageBox>,
}

impl LocalPeer {
    pub fn new(keypair: Keypair, version: AgentVersion, boxer: Arc<dyn MessageBox>) -> Self {
        Self {
            keypair,
            version,
            port: None,
            name: None,
            is_worker: false,
            boxer,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_worker(mut self, is_worker: bool) -> Self {
        self.is_worker = is_worker;
        self
    }

    pub fn identity(&self) -> Identity {
        self.keypair.identity()
    }

    pub fn version(&self) -> &AgentVersion {
        &self.version
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_worker(&self) -> bool {
        self.is_worker
    }

    pub fn boxer(&self) -> &Arc<dyn MessageBox> {
        &self.boxer
    }

    /// The `Identify` payload this node sends on every fresh session.
    pub fn identify_payload(&self) -> IdentifyPayload {
        IdentifyPayload {
            identity: self.identity().to_base64(),
            version: self.version.render(),
            port: self.port,
            name: self.name.clone(),
            is_worker: self.is_worker,
        }
    }
}
