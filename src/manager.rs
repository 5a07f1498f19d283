//! # Peer Manager
//!
//! The orchestrator: life-cycle of every known peer, dispatch of every
//! overlay-control message, dialling policy, duplicate arbitration, signal
//! relaying, and gossip of the connected-peer graph.
//!
//! ## Registries
//!
//! Three maps, one owner:
//!
//! - `peers`: the flat owning collection, keyed by [`PeerId`]. May
//!   transiently hold records that are not identified yet or are awaiting
//!   disposal.
//! - `identified`: identity to [`PeerId`]. The sole authority for routing
//!   by identity. At most one record per identity, and that record's own
//!   identity always equals the key.
//! - `by_conn`: transport session to [`PeerId`], maintained on every
//!   attach, detach, and migration.
//!
//! Neighbour edges (`known_peers`) hold identities and resolve through
//! `identified`, so the cyclic peer graph never produces owning cycles.
//!
//! ## Threading
//!
//! Every method takes `&mut self`: the manager is single-loop state, owned
//! by one actor task (see [`crate::node`]) or driven directly in tests.
//! Transport adapters post [`TransportEvent`]s into the channel whose
//! sender the manager was built with; each event is handled to completion
//! before the next, which is the discipline every invariant here relies
//! on.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::config::{MeshConfig, CONGESTED_DISCONNECT_WINDOW, SHUTDOWN_DISCONNECT_WINDOW};
use crate::connection::{Connection, ConnectionState, Direction, TransportKind};
use crate::error::{MeshError, PolicyViolation, ProtocolViolation};
use crate::event::MeshEvent;
use crate::identity::{can_keep_duplicate, can_initiate, now_ms, AgentVersion, Identity};
use crate::messages::{
    decode_frame, encode_frame, ControlMessage, DisconnectReason, DisconnectingPayload, Frame,
    PeerListEntry, PeerListPayload, SignalPayload, SignalRequestPayload,
};
use crate::peer::{DisconnectWindow, LocalPeer, Peer, PeerId};
use crate::transport::{
    AcceptorContext, AssistedTransport, ConnectionId, ConnectionIds, DirectTransport,
    SessionContext, SessionHandle, SignalingPayload, TransportEvent,
};

/// Snapshot of manager-wide counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshStats {
    /// Records in the flat peer collection.
    pub peers: usize,
    /// Peers in `Connected` state.
    pub connected_peers: usize,
    /// Entries in the identity registry.
    pub identified_peers: usize,
    /// Frames refused by send admission since start.
    pub frames_dropped: u64,
}

/// Point-in-time view of one peer, for query surfaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSummary {
    pub id: PeerId,
    pub identity: Option<Identity>,
    pub name: Option<String>,
    pub address: Option<String>,
    pub port: Option<u16>,
    pub connected: bool,
}

/// How an assisted connection comes into being.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AssistedRole {
    /// We open the transport session and emit the first signal.
    Initiator,
    /// The remote must open; we send a `SignalRequest` through the broker.
    Requester,
    /// The remote opened and is already signalling us.
    Responder,
}

pub struct PeerManager {
    local: LocalPeer,
    config: MeshConfig,
    peers: HashMap<PeerId, Peer>,
    identified: HashMap<Identity, PeerId>,
    by_conn: HashMap<ConnectionId, PeerId>,
    next_peer: u64,
    conn_ids: ConnectionIds,
    direct_transport: Box<dyn DirectTransport>,
    assisted_transport: Box<dyn AssistedTransport>,
    net_tx: tokio::sync::mpsc::UnboundedSender<TransportEvent>,
    events_tx: tokio::sync::mpsc::UnboundedSender<MeshEvent>,
    frames_dropped: u64,
}

impl PeerManager {
    /// Build a manager around its transports. `net_tx` is the channel the
    /// transports (and the acceptor) post [`TransportEvent`]s into; the
    /// caller owns the receiving half and feeds
    /// [`handle_transport_event`](Self::handle_transport_event).
    pub fn new(
        local: LocalPeer,
        config: MeshConfig,
        mut direct_transport: Box<dyn DirectTransport>,
        assisted_transport: Box<dyn AssistedTransport>,
        net_tx: tokio::sync::mpsc::UnboundedSender<TransportEvent>,
    ) -> (Self, tokio::sync::mpsc::UnboundedReceiver<MeshEvent>) {
        let conn_ids = ConnectionIds::new();
        direct_transport.start_accepting(AcceptorContext {
            events: net_tx.clone(),
            ids: conn_ids.clone(),
        });
        let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
        (
            Self {
                local,
                config,
                peers: HashMap::new(),
                identified: HashMap::new(),
                by_conn: HashMap::new(),
                next_peer: 1,
                conn_ids,
                direct_transport,
                assisted_transport,
                net_tx,
                events_tx,
                frames_dropped: 0,
            },
            events_rx,
        )
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn local(&self) -> &LocalPeer {
        &self.local
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn peer(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    /// Resolve an identity through the registry.
    pub fn identified(&self, identity: &Identity) -> Option<PeerId> {
        self.identified.get(identity).copied()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Peers currently in `Connected` state, in creation order.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        let mut out: Vec<PeerId> = self
            .peers
            .values()
            .filter(|p| p.state().is_connected())
            .map(|p| p.id())
            .collect();
        out.sort();
        out
    }

    /// Peers holding at least one live connection, connected or not.
    pub fn peers_with_connection(&self) -> usize {
        self.peers
            .values()
            .filter(|p| !p.state().is_disconnected())
            .count()
    }

    pub fn stats(&self) -> MeshStats {
        MeshStats {
            peers: self.peers.len(),
            connected_peers: self.connected_peers().len(),
            identified_peers: self.identified.len(),
            frames_dropped: self.frames_dropped,
        }
    }

    pub fn summaries(&self) -> Vec<PeerSummary> {
        let mut out: Vec<PeerSummary> = self
            .peers
            .values()
            .map(|p| PeerSummary {
                id: p.id(),
                identity: p.identity().copied(),
                name: p.name().map(str::to_string),
                address: p.address().map(str::to_string),
                port: p.port(),
                connected: p.state().is_connected(),
            })
            .collect();
        out.sort_by_key(|s| s.id);
        out
    }

    // ------------------------------------------------------------------
    // Internals: registries and plumbing
    // ------------------------------------------------------------------

    fn emit(&self, ev: MeshEvent) {
        let _ = self.events_tx.send(ev);
    }

    fn peer_ref(&self, pid: PeerId) -> &Peer {
        self.peers.get(&pid).expect("peer registry out of sync")
    }

    fn peer_mut(&mut self, pid: PeerId) -> &mut Peer {
        self.peers.get_mut(&pid).expect("peer registry out of sync")
    }

    fn create_peer(&mut self) -> PeerId {
        let id = PeerId(self.next_peer);
        self.next_peer += 1;
        self.peers.insert(id, Peer::new(id));
        id
    }

    /// Look a record up by identity or create one bound to it.
    fn get_or_create_by_identity(&mut self, identity: Identity) -> PeerId {
        if let Some(&pid) = self.identified.get(&identity) {
            return pid;
        }
        let pid = self.create_peer();
        self.peer_mut(pid).set_identity(identity);
        self.identified.insert(identity, pid);
        pid
    }

    fn encode(frame: &Frame) -> Vec<u8> {
        // Locally built frames always serialize; a failure here is a bug.
        encode_frame(frame).expect("control frames serialize")
    }

    /// Record a failed dial attempt against the retry policy.
    fn record_dial_failure(&mut self, pid: PeerId, kind: TransportKind, direction: Direction, was_connected: bool) {
        if direction != Direction::Outbound || was_connected {
            return;
        }
        let now = now_ms();
        let peer = self.peer_mut(pid);
        let whitelisted = peer.is_whitelisted();
        peer.retry_mut(kind).record_failure(now, whitelisted);
    }

    /// Detach a connection from whichever slot holds it, without closing.
    fn detach_connection(&mut self, pid: PeerId, cid: ConnectionId) -> Option<Connection> {
        let peer = self.peers.get_mut(&pid)?;
        for kind in [TransportKind::Direct, TransportKind::Assisted] {
            if peer.connection(kind).map(|c| c.id()) == Some(cid) {
                return peer.take_connection(kind);
            }
        }
        None
    }

    /// Close and unregister one connection, emitting peer-level events if
    /// the peer just lost its last authenticated session.
    fn close_connection(&mut self, pid: PeerId, cid: ConnectionId, error: Option<MeshError>) {
        let was_connected_peer = self.peer_ref(pid).state().is_connected();
        let Some(mut conn) = self.detach_connection(pid, cid) else {
            self.by_conn.remove(&cid);
            return;
        };
        let kind = conn.kind();
        let direction = conn.direction();
        let reached_connected = conn.was_connected();
        if let Some(err) = &error {
            debug!(peer = %self.peer_ref(pid).display_name(), conn = %cid, %err, "connection failed");
        }
        conn.close(error);
        self.by_conn.remove(&cid);
        self.record_dial_failure(pid, kind, direction, reached_connected);
        self.after_connection_loss(pid, was_connected_peer);
    }

    fn after_connection_loss(&mut self, pid: PeerId, was_connected_peer: bool) {
        if was_connected_peer && !self.peer_ref(pid).state().is_connected() {
            self.emit(MeshEvent::PeerDisconnected { peer: pid });
            self.emit(MeshEvent::ConnectedPeersChanged);
        }
    }

    /// Close every connection a peer holds.
    fn close_peer(&mut self, pid: PeerId, error: Option<MeshError>) {
        let was_connected_peer = self.peer_ref(pid).state().is_connected();
        let closed = self.peer_mut(pid).close(error);
        for conn in &closed {
            self.by_conn.remove(&conn.id());
        }
        for conn in closed {
            self.record_dial_failure(pid, conn.kind(), conn.direction(), conn.was_connected());
        }
        self.after_connection_loss(pid, was_connected_peer);
    }

    /// Install a connection and index it.
    fn attach_connection(&mut self, pid: PeerId, conn: Connection) {
        let cid = conn.id();
        if let Some(displaced) = self.peer_mut(pid).install_connection(conn) {
            self.by_conn.remove(&displaced.id());
        }
        self.by_conn.insert(cid, pid);
    }

    // ------------------------------------------------------------------
    // Public operations: dialling
    // ------------------------------------------------------------------

    /// Parse an `address:port` URI, create a peer for it, and dial it over
    /// the direct transport.
    pub fn connect_to_address(&mut self, uri: &str) -> Result<PeerId, MeshError> {
        let (address, port) = uri
            .rsplit_once(':')
            .and_then(|(addr, port)| Some((addr.to_string(), port.parse::<u16>().ok()?)))
            .filter(|(addr, _)| !addr.is_empty())
            .ok_or_else(|| MeshError::Network(format!("invalid peer address {uri:?}")))?;
        let whitelisted = self.config.is_whitelisted(&address);
        let pid = self.create_peer();
        let peer = self.peer_mut(pid);
        peer.set_address(Some(address));
        peer.set_port(Some(port));
        peer.set_whitelisted(whitelisted);
        self.connect_via_direct(pid);
        Ok(pid)
    }

    /// Dial a peer's configured address over the direct transport.
    /// Returns whether a dial was started.
    pub fn connect_via_direct(&mut self, pid: PeerId) -> bool {
        if self.peers.get(&pid).is_none() {
            return false;
        }
        if self.peer_ref(pid).address().is_none() {
            // A peer with no address can never be direct-dialled; writing
            // it off is what makes gossip-only records disposable.
            self.peer_mut(pid)
                .retry_mut(TransportKind::Direct)
                .never_retry_connecting();
            return false;
        }
        let now = now_ms();
        if !self.can_dial(pid, TransportKind::Direct, now) {
            return false;
        }
        let (address, port) = {
            let peer = self.peer_ref(pid);
            match (peer.address(), peer.port()) {
                (Some(a), Some(p)) => (a.to_string(), p),
                _ => return false,
            }
        };
        let cid = self.conn_ids.next();
        debug!(peer = %self.peer_ref(pid).display_name(), conn = %cid, %address, port, "dialling direct");
        let handle = self.direct_transport.dial(
            &address,
            port,
            SessionContext {
                conn: cid,
                events: self.net_tx.clone(),
            },
        );
        let conn = Connection::new(cid, TransportKind::Direct, Direction::Outbound, handle);
        self.attach_connection(pid, conn);
        true
    }

    /// Establish an assisted session to a peer through a broker. Returns
    /// whether an attempt was started.
    pub fn connect_via_assisted(&mut self, pid: PeerId) -> bool {
        if self.peers.get(&pid).is_none() {
            return false;
        }
        let now = now_ms();
        if !self.can_dial(pid, TransportKind::Assisted, now) {
            return false;
        }
        let Some(target_identity) = self.peer_ref(pid).identity().copied() else {
            return false;
        };
        let Some((_, broker_identity)) = self.select_broker(pid) else {
            debug!(
                peer = %self.peer_ref(pid).display_name(),
                "no broker available for assisted dial"
            );
            self.record_dial_failure(pid, TransportKind::Assisted, Direction::Outbound, false);
            return false;
        };
        let role = if can_initiate(&self.local.identity(), &target_identity) {
            AssistedRole::Initiator
        } else {
            AssistedRole::Requester
        };
        self.open_assisted(pid, role, broker_identity);
        true
    }

    /// Wrap an accepted inbound direct session into a fresh peer record.
    /// Inbound records are never whitelisted by their source address.
    pub fn accept_inbound_direct(
        &mut self,
        handle: Box<dyn SessionHandle>,
        cid: ConnectionId,
        address: Option<String>,
    ) -> PeerId {
        let pid = self.create_peer();
        self.peer_mut(pid).set_address(address);
        debug!(peer = %self.peer_ref(pid).display_name(), conn = %cid, "accepted inbound session");
        let conn = Connection::new(cid, TransportKind::Direct, Direction::Inbound, handle);
        self.attach_connection(pid, conn);
        pid
    }

    /// The dial-admission predicate.
    fn can_dial(&self, pid: PeerId, kind: TransportKind, now: u64) -> bool {
        let Some(peer) = self.peers.get(&pid) else {
            return false;
        };
        // Below target, or upgrading a peer that already holds a session.
        let upgrading = !peer.state().is_disconnected();
        if self.peers_with_connection() >= self.config.target_peers && !upgrading {
            return false;
        }
        // The remote asked us to stay away.
        if peer.peer_disconnect_active(now) {
            return false;
        }
        // One connection per transport.
        if peer.connection(kind).is_some() {
            return false;
        }
        // Cooldown and write-off.
        if !peer.retry(kind).can_connect(now) {
            return false;
        }
        // Transport preconditions.
        match kind {
            TransportKind::Direct => peer.address().is_some(),
            TransportKind::Assisted => peer.identity().is_some(),
        }
    }

    /// Pick a broker for an assisted dial to `pid`: ourselves when we
    /// already hold an authenticated session to the target (re-signalling),
    /// otherwise a uniformly random connected neighbour that also knows the
    /// target.
    fn select_broker(&self, pid: PeerId) -> Option<(PeerId, Identity)> {
        let target = self.peers.get(&pid)?;
        let target_identity = *target.identity()?;
        if target.state().is_connected() {
            return Some((pid, target_identity));
        }
        let candidates: Vec<(PeerId, Identity)> = target
            .known_peers()
            .iter()
            .filter_map(|cid| {
                let candidate_pid = *self.identified.get(cid)?;
                let candidate = self.peers.get(&candidate_pid)?;
                (candidate.state().is_connected()
                    && candidate.known_peers().contains(&target_identity))
                .then_some((candidate_pid, *cid))
            })
            .collect();
        candidates.choose(&mut rand::thread_rng()).copied()
    }

    /// Create an assisted connection on `pid` and, for the requester role,
    /// emit the `SignalRequest` through the broker.
    fn open_assisted(&mut self, pid: PeerId, role: AssistedRole, broker: Identity) {
        let cid = self.conn_ids.next();
        let initiator = matches!(role, AssistedRole::Initiator);
        let handle = self.assisted_transport.create(
            initiator,
            SessionContext {
                conn: cid,
                events: self.net_tx.clone(),
            },
        );
        let direction = if initiator {
            Direction::Outbound
        } else {
            Direction::Inbound
        };
        let mut conn = Connection::new(cid, TransportKind::Assisted, direction, handle);
        conn.set_broker(broker);
        debug!(
            peer = %self.peer_ref(pid).display_name(),
            conn = %cid,
            ?role,
            broker = %broker.short(),
            "opening assisted connection"
        );
        match role {
            AssistedRole::Initiator | AssistedRole::Responder => {
                conn.set_state(ConnectionState::Signaling);
            }
            AssistedRole::Requester => {
                conn.set_state(ConnectionState::RequestSignaling);
            }
        }
        self.attach_connection(pid, conn);

        if matches!(role, AssistedRole::Requester) {
            let target_identity = self
                .peer_ref(pid)
                .identity()
                .copied()
                .expect("assisted connections require a known identity");
            let request = ControlMessage::SignalRequest(SignalRequestPayload {
                source: self.local.identity().to_base64(),
                destination: target_identity.to_base64(),
            });
            if let Some(broker_pid) = self.identified(&broker) {
                self.send_control_to(broker_pid, &request);
            }
        }
    }

    // ------------------------------------------------------------------
    // Public operations: sending and disconnecting
    // ------------------------------------------------------------------

    /// Send an application frame to a connected peer. Returns whether a
    /// connection admitted it; refusals only bump the drop counter.
    pub fn send_to(&mut self, pid: PeerId, data: &[u8]) -> bool {
        let bytes = Self::encode(&Frame::Data(data.to_vec()));
        let Some(peer) = self.peers.get_mut(&pid) else {
            return false;
        };
        for kind in [TransportKind::Direct, TransportKind::Assisted] {
            if let Some(conn) = peer.connection_mut(kind) {
                if conn.state().is_connected() && conn.send(&bytes) {
                    return true;
                }
            }
        }
        self.frames_dropped += 1;
        false
    }

    /// Send an application frame to every connected peer.
    pub fn broadcast(&mut self, data: &[u8]) {
        for pid in self.connected_peers() {
            self.send_to(pid, data);
        }
    }

    /// Send a control message on the peer's best available connection.
    fn send_control_to(&mut self, pid: PeerId, msg: &ControlMessage) -> bool {
        let bytes = Self::encode(&Frame::Control(msg.clone()));
        let Some(peer) = self.peers.get_mut(&pid) else {
            return false;
        };
        for kind in [TransportKind::Direct, TransportKind::Assisted] {
            if let Some(conn) = peer.connection_mut(kind) {
                if conn.send(&bytes) {
                    return true;
                }
            }
        }
        self.frames_dropped += 1;
        false
    }

    /// Install a local-requested-disconnect window, notify the remote on
    /// every connection that can still transmit, and close the peer.
    /// Repeating the call with the same arguments is a no-op.
    pub fn disconnect(&mut self, pid: PeerId, reason: DisconnectReason, until_ms: u64) {
        if self.peers.get(&pid).is_none() {
            return;
        }
        self.peer_mut(pid).set_local_disconnect(DisconnectWindow {
            reason,
            until_ms,
        });
        let destination = self.peer_ref(pid).identity().map(|i| i.to_base64());
        let notice = ControlMessage::Disconnecting(DisconnectingPayload {
            source: self.local.identity().to_base64(),
            destination,
            reason,
            disconnect_until_ms: until_ms,
        });
        let bytes = Self::encode(&Frame::Control(notice));
        let peer = self.peer_mut(pid);
        for kind in [TransportKind::Direct, TransportKind::Assisted] {
            if let Some(conn) = peer.connection_mut(kind) {
                conn.send(&bytes);
            }
        }
        self.close_peer(pid, None);
    }

    /// Disconnect every known peer with `ShuttingDown`.
    pub fn stop(&mut self) {
        let until = now_ms() + SHUTDOWN_DISCONNECT_WINDOW.as_millis() as u64;
        let pids: Vec<PeerId> = self.peers.keys().copied().collect();
        info!(peers = pids.len(), "stopping: disconnecting all peers");
        for pid in pids {
            self.disconnect(pid, DisconnectReason::ShuttingDown, until);
        }
    }

    // ------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------

    pub fn handle_transport_event(&mut self, ev: TransportEvent) {
        match ev {
            TransportEvent::Opened { conn } => self.on_opened(conn),
            TransportEvent::Closed { conn, error } => self.on_closed(conn, error),
            TransportEvent::Frame { conn, data } => self.on_frame(conn, data),
            TransportEvent::SignalReady { conn, payload } => self.on_signal_ready(conn, payload),
            TransportEvent::InboundDirect {
                conn,
                handle,
                address,
            } => {
                self.accept_inbound_direct(handle, conn, address);
            }
        }
    }

    fn on_opened(&mut self, cid: ConnectionId) {
        let Some(&pid) = self.by_conn.get(&cid) else {
            debug!(conn = %cid, "opened event for unknown connection");
            return;
        };
        let state = {
            let Some(conn) = self.connection_by_id(pid, cid) else {
                return;
            };
            conn.state().clone()
        };
        match state {
            ConnectionState::Connecting | ConnectionState::Signaling => {
                let identify =
                    ControlMessage::Identify(self.local.identify_payload());
                let bytes = Self::encode(&Frame::Control(identify));
                if let Some(conn) = self.connection_by_id_mut(pid, cid) {
                    conn.set_state(ConnectionState::WaitingForIdentity);
                    conn.send(&bytes);
                }
            }
            _ => {
                self.close_connection(
                    pid,
                    cid,
                    Some(
                        ProtocolViolation::UnexpectedMessage("session opened in invalid state")
                            .into(),
                    ),
                );
            }
        }
    }

    fn on_closed(&mut self, cid: ConnectionId, error: Option<String>) {
        let Some(&pid) = self.by_conn.get(&cid) else {
            // Already detached locally; the transport echo is harmless.
            return;
        };
        self.close_connection(pid, cid, error.map(MeshError::Network));
    }

    fn connection_by_id(&self, pid: PeerId, cid: ConnectionId) -> Option<&Connection> {
        let peer = self.peers.get(&pid)?;
        [TransportKind::Direct, TransportKind::Assisted]
            .into_iter()
            .filter_map(|k| peer.connection(k))
            .find(|c| c.id() == cid)
    }

    fn connection_by_id_mut(&mut self, pid: PeerId, cid: ConnectionId) -> Option<&mut Connection> {
        let peer = self.peers.get_mut(&pid)?;
        let kind = [TransportKind::Direct, TransportKind::Assisted]
            .into_iter()
            .find(|&k| peer.connection(k).map(|c| c.id()) == Some(cid))?;
        peer.connection_mut(kind)
    }

    fn on_frame(&mut self, cid: ConnectionId, data: Vec<u8>) {
        let Some(&pid) = self.by_conn.get(&cid) else {
            debug!(conn = %cid, "frame for unknown connection");
            return;
        };
        match decode_frame(&data) {
            Err(err) => {
                self.close_connection(
                    pid,
                    cid,
                    Some(ProtocolViolation::MalformedFrame(err.to_string()).into()),
                );
            }
            Ok(Frame::Control(msg)) => self.handle_control(pid, cid, msg),
            Ok(Frame::Data(bytes)) => self.handle_data(pid, cid, bytes),
        }
    }

    // ------------------------------------------------------------------
    // Message dispatch
    // ------------------------------------------------------------------

    fn handle_control(&mut self, pid: PeerId, cid: ConnectionId, msg: ControlMessage) {
        // Disconnect notices apply in every connection state, identified or
        // not: the remote may be refusing us mid-handshake.
        let msg = match msg {
            ControlMessage::Disconnecting(payload) => {
                self.handle_disconnecting(pid, payload);
                return;
            }
            other => other,
        };
        let in_handshake = self
            .connection_by_id(pid, cid)
            .map(|c| *c.state() == ConnectionState::WaitingForIdentity)
            .unwrap_or(false);
        if in_handshake {
            self.handle_handshake(pid, cid, msg);
            return;
        }
        match msg {
            ControlMessage::Identify(_) => {
                debug!(
                    peer = %self.peer_ref(pid).display_name(),
                    "identify on an established connection"
                );
                self.close_connection(
                    pid,
                    cid,
                    Some(ProtocolViolation::UnexpectedMessage("identify after handshake").into()),
                );
            }
            ControlMessage::SignalRequest(payload) => self.handle_signal_request(pid, payload),
            ControlMessage::Signal(payload) => self.handle_signal(pid, payload),
            ControlMessage::PeerList(payload) => self.handle_peer_list(pid, payload),
            ControlMessage::Disconnecting(_) => unreachable!("handled above"),
        }
    }

    fn handle_data(&mut self, pid: PeerId, cid: ConnectionId, bytes: Vec<u8>) {
        let in_handshake = self
            .connection_by_id(pid, cid)
            .map(|c| *c.state() == ConnectionState::WaitingForIdentity)
            .unwrap_or(false);
        if in_handshake {
            // Only `Identify` may open a session.
            self.close_connection(
                pid,
                cid,
                Some(ProtocolViolation::UnexpectedMessage("expected identify").into()),
            );
            return;
        }
        if self.peer_ref(pid).identity().is_some() {
            self.emit(MeshEvent::Message { peer: pid, data: bytes });
        } else {
            // Unidentified peers may not speak application traffic.
            self.close_connection(
                pid,
                cid,
                Some(
                    ProtocolViolation::UnexpectedMessage("application data before handshake")
                        .into(),
                ),
            );
        }
    }

    // ------------------------------------------------------------------
    // Handshake
    // ------------------------------------------------------------------

    fn handle_handshake(&mut self, pid: PeerId, cid: ConnectionId, msg: ControlMessage) {
        let ControlMessage::Identify(payload) = msg else {
            self.close_connection(
                pid,
                cid,
                Some(ProtocolViolation::UnexpectedMessage("expected identify").into()),
            );
            return;
        };

        // Identity must be well-formed.
        let claimed = match Identity::parse(&payload.identity) {
            Ok(identity) => identity,
            Err(_) => {
                self.close_connection(
                    pid,
                    cid,
                    Some(ProtocolViolation::InvalidIdentity(payload.identity.clone()).into()),
                );
                return;
            }
        };

        // Versions must be compatible.
        let version = match AgentVersion::parse(&payload.version) {
            Ok(version) => version,
            Err(_) => {
                self.close_connection(
                    pid,
                    cid,
                    Some(ProtocolViolation::MalformedVersion(payload.version.clone()).into()),
                );
                return;
            }
        };
        if !version.is_compatible(self.local.version()) {
            self.close_connection(
                pid,
                cid,
                Some(
                    ProtocolViolation::IncompatibleVersion {
                        ours: self.local.version().protocol,
                        theirs: version.protocol,
                    }
                    .into(),
                ),
            );
            return;
        }

        // Names are bounded.
        if let Some(name) = &payload.name {
            let len = name.chars().count();
            if len > self.config.name_max_len {
                self.close_connection(
                    pid,
                    cid,
                    Some(ProtocolViolation::NameTooLong(len).into()),
                );
                return;
            }
        }

        // A session claiming our own identity is a loop or an impersonation;
        // either way the record is a dead end.
        if claimed == self.local.identity() {
            let kind = self
                .connection_by_id(pid, cid)
                .map(|c| c.kind())
                .unwrap_or(TransportKind::Direct);
            self.close_connection(
                pid,
                cid,
                Some(MeshError::Network(format!(
                    "Closing {kind} connection from our own identity"
                ))),
            );
            let peer = self.peer_mut(pid);
            peer.set_address(None);
            peer.set_port(None);
            peer.never_retry_all();
            self.try_dispose(pid);
            return;
        }

        // From here the connection moves by value until it lands on its
        // final record.
        let Some(mut conn) = self.detach_connection(pid, cid) else {
            return;
        };
        self.by_conn.remove(&cid);
        let kind = conn.kind();
        let direction = conn.direction();

        // A record that previously answered to a different identity keeps
        // its history but not this connection: the session belongs to
        // whoever actually spoke.
        let mut target_pid = pid;
        let prior_identity = self.peer_ref(pid).identity().copied();
        match prior_identity {
            Some(old) if old != claimed => {
                warn!(
                    peer = %self.peer_ref(pid).display_name(),
                    claimed = %claimed.short(),
                    "peer identity changed; migrating connection"
                );
                self.peer_mut(pid).never_retry_all();
                target_pid = self.get_or_create_by_identity(claimed);
                if direction == Direction::Outbound && kind == TransportKind::Direct {
                    let (address, port) = {
                        let old_rec = self.peer_mut(pid);
                        let address = old_rec.address().map(str::to_string);
                        let port = old_rec.port();
                        old_rec.set_address(None);
                        old_rec.set_port(None);
                        (address, port)
                    };
                    let target = self.peer_mut(target_pid);
                    if target.address().is_none() {
                        target.set_address(address);
                        target.set_port(port);
                    }
                }
            }
            Some(_) => {}
            None => {
                if let Some(&existing) = self.identified.get(&claimed) {
                    target_pid = existing;
                }
            }
        }

        let target_was_connected = self.peer_ref(target_pid).state().is_connected();

        // Duplicate arbitration: if the identity already holds an
        // authenticated session on this transport, exactly one of the two
        // connections survives, the one opened by the pair's designated
        // initiator. Ties go to the incumbent.
        let occupant = self
            .peer_ref(target_pid)
            .connection(kind)
            .map(|c| (c.state().is_connected(), c.direction()));
        if let Some((occupant_connected, occupant_direction)) = occupant {
            if occupant_connected {
                let preferred = if can_keep_duplicate(&claimed, &self.local.identity()) {
                    Direction::Inbound
                } else {
                    Direction::Outbound
                };
                let new_wins = direction == preferred && occupant_direction != preferred;
                if !new_wins {
                    debug!(
                        peer = %self.peer_ref(target_pid).display_name(),
                        %kind,
                        "duplicate connection lost arbitration"
                    );
                    conn.close(Some(MeshError::Network(format!(
                        "duplicate {kind} connection lost arbitration"
                    ))));
                    self.record_dial_failure(target_pid, kind, direction, false);
                    self.cleanup_source_record(pid, target_pid);
                    return;
                }
                let mut old = self
                    .peer_mut(target_pid)
                    .take_connection(kind)
                    .expect("arbitrated connection present");
                old.close(Some(MeshError::Network(format!(
                    "duplicate {kind} connection superseded"
                ))));
                self.by_conn.remove(&old.id());
            } else {
                // An in-flight attempt occupies the slot; the session that
                // finished its handshake supersedes it.
                let mut old = self
                    .peer_mut(target_pid)
                    .take_connection(kind)
                    .expect("slot occupant present");
                old.close(Some(MeshError::Network(
                    "replaced by an authenticated session".to_string(),
                )));
                self.by_conn.remove(&old.id());
            }
        }

        // Inbound acceptors never learn the remote's listening port except
        // through the handshake.
        if direction == Direction::Inbound && kind == TransportKind::Direct {
            self.peer_mut(target_pid).set_port(payload.port);
        }

        {
            let target = self.peer_mut(target_pid);
            target.set_name(payload.name.clone());
            target.set_version(version);
            target.set_worker(payload.is_worker);
        }

        // We may have told this identity to stay away.
        let now = now_ms();
        if let Some(window) = self.peer_ref(target_pid).local_disconnect() {
            if now < window.until_ms {
                let notice = ControlMessage::Disconnecting(DisconnectingPayload {
                    source: self.local.identity().to_base64(),
                    destination: Some(claimed.to_base64()),
                    reason: window.reason,
                    disconnect_until_ms: window.until_ms,
                });
                conn.send(&Self::encode(&Frame::Control(notice)));
                conn.close(Some(
                    PolicyViolation::DisconnectWindow {
                        until_ms: window.until_ms,
                    }
                    .into(),
                ));
                self.cleanup_source_record(pid, target_pid);
                return;
            }
        }

        // Authenticated.
        conn.set_state(ConnectionState::Connected { identity: claimed });
        if self.peer_ref(target_pid).identity().is_none() {
            self.peer_mut(target_pid).set_identity(claimed);
        }
        self.attach_connection(target_pid, conn);
        match self.identified.get(&claimed) {
            None => {
                self.identified.insert(claimed, target_pid);
            }
            Some(&existing) => debug_assert_eq!(existing, target_pid, "identity registry split"),
        }
        self.peer_mut(target_pid).retry_mut(kind).record_success();

        // A fresh record displaced by the identity's incumbent merges into
        // it. A record that answered to a *different* identity is left
        // alone: whatever else it holds still belongs to that identity.
        if target_pid != pid && prior_identity.is_none() {
            self.merge_into(pid, target_pid);
        }

        info!(
            peer = %self.peer_ref(target_pid).display_name(),
            %kind,
            %direction,
            "handshake complete"
        );
        if !target_was_connected {
            self.emit(MeshEvent::PeerConnected {
                peer: target_pid,
                identity: claimed,
            });
            self.emit(MeshEvent::ConnectedPeersChanged);
        }
    }

    /// After a handshake abort: a source record left both connectionless
    /// and unidentified is a disposal candidate right away.
    fn cleanup_source_record(&mut self, pid: PeerId, target_pid: PeerId) {
        if pid == target_pid {
            return;
        }
        let disposable = {
            let Some(peer) = self.peers.get(&pid) else {
                return;
            };
            peer.identity().is_none() && peer.state().is_disconnected()
        };
        if disposable {
            self.peer_mut(pid).never_retry_all();
            self.try_dispose(pid);
        }
    }

    /// Merge a duplicate record into the incumbent that owns the identity:
    /// authenticated connections transfer (displacing whatever they find),
    /// everything else closes, and the duplicate becomes disposal-eligible.
    /// The incumbent record, and every external `PeerId` referring to it,
    /// survives untouched.
    fn merge_into(&mut self, source_pid: PeerId, target_pid: PeerId) {
        for kind in [TransportKind::Direct, TransportKind::Assisted] {
            let Some(mut conn) = self.peer_mut(source_pid).take_connection(kind) else {
                continue;
            };
            if conn.state().is_connected() {
                let cid = conn.id();
                self.attach_connection(target_pid, conn);
                debug!(conn = %cid, from = %source_pid, to = %target_pid, "migrated connection");
            } else {
                conn.close(Some(MeshError::Network(
                    "superseded by identified record".to_string(),
                )));
                self.by_conn.remove(&conn.id());
            }
        }
        // Adopt the observed endpoint when the incumbent has none.
        let (address, port) = {
            let source = self.peer_ref(source_pid);
            (source.address().map(str::to_string), source.port())
        };
        {
            let target = self.peer_mut(target_pid);
            if target.address().is_none() {
                target.set_address(address);
                if target.port().is_none() {
                    target.set_port(port);
                }
            }
        }
        self.peer_mut(source_pid).never_retry_all();
        debug!(from = %source_pid, to = %target_pid, "merged duplicate peer record");
    }

    // ------------------------------------------------------------------
    // Disconnect notices
    // ------------------------------------------------------------------

    fn handle_disconnecting(&mut self, sender_pid: PeerId, payload: DisconnectingPayload) {
        let local_b64 = self.local.identity().to_base64();
        match &payload.destination {
            Some(dest) if *dest != local_b64 => {
                let dest = dest.clone();
                self.relay_control(
                    sender_pid,
                    payload.source.clone(),
                    dest,
                    ControlMessage::Disconnecting(payload),
                );
            }
            _ => {
                debug!(
                    peer = %self.peer_ref(sender_pid).display_name(),
                    reason = ?payload.reason,
                    until = payload.disconnect_until_ms,
                    "peer requested disconnect"
                );
                self.peer_mut(sender_pid).set_peer_disconnect(DisconnectWindow {
                    reason: payload.reason,
                    until_ms: payload.disconnect_until_ms,
                });
                self.close_peer(sender_pid, None);
            }
        }
    }

    /// Single-hop relay shared by `Disconnecting`, `SignalRequest`, and
    /// `Signal`: the sender must be the origin, and the destination must be
    /// a peer we can resolve. Anything else is dropped.
    fn relay_control(
        &mut self,
        sender_pid: PeerId,
        source: String,
        destination: String,
        msg: ControlMessage,
    ) {
        let Some(sender_identity) = self.peer_ref(sender_pid).identity().copied() else {
            debug!("relay from unidentified peer dropped");
            return;
        };
        if source != sender_identity.to_base64() {
            warn!(
                peer = %self.peer_ref(sender_pid).display_name(),
                kind = msg.kind(),
                "dropping relayed message with spoofed source"
            );
            return;
        }
        let Ok(dest) = Identity::parse(&destination) else {
            debug!(kind = msg.kind(), "relay destination unparsable, dropping");
            return;
        };
        let Some(dest_pid) = self.identified(&dest) else {
            debug!(
                kind = msg.kind(),
                dest = %dest.short(),
                "relay destination unknown, dropping"
            );
            return;
        };
        self.send_control_to(dest_pid, &msg);
    }

    // ------------------------------------------------------------------
    // Signalling
    // ------------------------------------------------------------------

    /// Whether a new session from `source` must be refused for capacity.
    fn congested_for(&self, source: &Identity) -> bool {
        if self.peers_with_connection() < self.config.max_peers {
            return false;
        }
        let source_connected = self
            .identified
            .get(source)
            .and_then(|pid| self.peers.get(pid))
            .map(|p| p.state().is_connected())
            .unwrap_or(false);
        !source_connected
    }

    fn reject_congested(&mut self, sender_pid: PeerId, source_b64: String) {
        let until = now_ms() + CONGESTED_DISCONNECT_WINDOW.as_millis() as u64;
        debug!(source = %source_b64, "congested: refusing signalling");
        let notice = ControlMessage::Disconnecting(DisconnectingPayload {
            source: self.local.identity().to_base64(),
            destination: Some(source_b64),
            reason: DisconnectReason::Congested,
            disconnect_until_ms: until,
        });
        self.send_control_to(sender_pid, &notice);
    }

    fn handle_signal_request(&mut self, sender_pid: PeerId, payload: SignalRequestPayload) {
        let local_b64 = self.local.identity().to_base64();
        if payload.destination != local_b64 {
            let (source, destination) = (payload.source.clone(), payload.destination.clone());
            self.relay_control(
                sender_pid,
                source,
                destination,
                ControlMessage::SignalRequest(payload),
            );
            return;
        }
        let Ok(source) = Identity::parse(&payload.source) else {
            debug!("signal request with invalid source, dropping");
            return;
        };
        if source == self.local.identity() {
            debug!("signal request from our own identity, dropping");
            return;
        }
        // If the source is the pair's initiator it should have opened the
        // session itself rather than asking us to.
        if can_initiate(&source, &self.local.identity()) {
            debug!(
                source = %source.short(),
                "signal request from the designated initiator, dropping"
            );
            return;
        }
        if self.congested_for(&source) {
            self.reject_congested(sender_pid, payload.source.clone());
            return;
        }
        let Some(sender_identity) = self.peer_ref(sender_pid).identity().copied() else {
            debug!("signal request from unidentified sender, dropping");
            return;
        };
        let target_pid = self.get_or_create_by_identity(source);
        // The broker edge: the sender evidently knows the target.
        if sender_identity != source {
            let mut changed = self.peer_mut(target_pid).add_known_peer(sender_identity);
            changed |= self.peer_mut(sender_pid).add_known_peer(source);
            if changed {
                self.emit(MeshEvent::KnownPeersChanged { peer: target_pid });
            }
        }
        if self.peer_ref(target_pid).connection(TransportKind::Assisted).is_none() {
            self.open_assisted(target_pid, AssistedRole::Initiator, sender_identity);
        }
    }

    fn handle_signal(&mut self, sender_pid: PeerId, payload: SignalPayload) {
        let local_b64 = self.local.identity().to_base64();
        if payload.destination != local_b64 {
            let (source, destination) = (payload.source.clone(), payload.destination.clone());
            self.relay_control(
                sender_pid,
                source,
                destination,
                ControlMessage::Signal(payload),
            );
            return;
        }
        let Ok(source) = Identity::parse(&payload.source) else {
            debug!("signal with invalid source, dropping");
            return;
        };
        if source == self.local.identity() {
            debug!("signal from our own identity, dropping");
            return;
        }
        if self.congested_for(&source) {
            self.reject_congested(sender_pid, payload.source.clone());
            return;
        }
        let target_pid = self.get_or_create_by_identity(source);
        if self
            .peer_ref(target_pid)
            .connection(TransportKind::Assisted)
            .is_none()
        {
            let broker = self
                .peer_ref(sender_pid)
                .identity()
                .copied()
                .unwrap_or(source);
            self.open_assisted(target_pid, AssistedRole::Responder, broker);
        }
        // A requester hears back for the first time: signalling has begun.
        {
            let conn = self
                .peer_mut(target_pid)
                .connection_mut(TransportKind::Assisted)
                .expect("assisted connection ensured above");
            if *conn.state() == ConnectionState::RequestSignaling {
                conn.set_state(ConnectionState::Signaling);
            }
        }
        let conn_id = self
            .peer_ref(target_pid)
            .connection(TransportKind::Assisted)
            .map(|c| c.id())
            .expect("assisted connection ensured above");
        let Some(plaintext) =
            self.local
                .boxer()
                .unbox_message(&payload.signal, &payload.nonce, &source)
        else {
            self.close_connection(
                target_pid,
                conn_id,
                Some(MeshError::Network(
                    "failed to open boxed signalling payload".to_string(),
                )),
            );
            return;
        };
        let parsed: SignalingPayload = match serde_json::from_slice(&plaintext) {
            Ok(value) => value,
            Err(_) => {
                self.close_connection(
                    target_pid,
                    conn_id,
                    Some(ProtocolViolation::BadSignal("payload is not valid JSON").into()),
                );
                return;
            }
        };
        if let Some(conn) = self.connection_by_id_mut(target_pid, conn_id) {
            conn.signal(parsed);
        }
    }

    /// Our own assisted transport produced a signalling payload; box it and
    /// route it through the connection's broker.
    fn on_signal_ready(&mut self, cid: ConnectionId, payload: SignalingPayload) {
        let Some(&pid) = self.by_conn.get(&cid) else {
            debug!(conn = %cid, "signal from unknown connection");
            return;
        };
        let Some(target_identity) = self.peer_ref(pid).identity().copied() else {
            debug!(conn = %cid, "signal for unidentified peer, dropping");
            return;
        };
        let plaintext =
            serde_json::to_vec(&payload).expect("signalling payloads serialize");
        let boxed = self.local.boxer().box_message(&plaintext, &target_identity);
        let msg = ControlMessage::Signal(SignalPayload {
            source: self.local.identity().to_base64(),
            destination: target_identity.to_base64(),
            nonce: boxed.nonce,
            signal: boxed.ciphertext,
        });
        // Route via the broker remembered at dial time, re-selecting if it
        // is gone; a signal with no route is dropped.
        let remembered = self
            .connection_by_id(pid, cid)
            .and_then(|c| c.broker().copied());
        let mut broker_pid: Option<PeerId> = None;
        if let Some(broker) = remembered {
            if broker == target_identity {
                // We are the broker: re-signalling over our own session.
                broker_pid = Some(pid);
            } else if let Some(bp) = self.identified(&broker) {
                if self.peer_ref(bp).state().is_connected() {
                    broker_pid = Some(bp);
                }
            }
        }
        if broker_pid.is_none() {
            if let Some((bp, identity)) = self.select_broker(pid) {
                if let Some(conn) = self.connection_by_id_mut(pid, cid) {
                    conn.set_broker(identity);
                }
                broker_pid = Some(bp);
            }
        }
        match broker_pid {
            Some(bp) => {
                self.send_control_to(bp, &msg);
            }
            None => debug!(
                peer = %self.peer_ref(pid).display_name(),
                "no broker available for outbound signal, dropping"
            ),
        }
    }

    // ------------------------------------------------------------------
    // Gossip
    // ------------------------------------------------------------------

    fn handle_peer_list(&mut self, sender_pid: PeerId, payload: PeerListPayload) {
        if !self.peer_ref(sender_pid).state().is_connected() {
            debug!("peer list from a non-connected peer, ignoring");
            return;
        }
        if self.config.is_worker {
            return;
        }
        let Some(sender_identity) = self.peer_ref(sender_pid).identity().copied() else {
            return;
        };
        let local_identity = self.local.identity();

        let mut next: BTreeMap<Identity, &PeerListEntry> = BTreeMap::new();
        for entry in &payload.connected_peers {
            let Ok(identity) = Identity::parse(&entry.identity) else {
                debug!("peer list entry with invalid identity, skipping");
                continue;
            };
            if identity == local_identity {
                continue;
            }
            next.insert(identity, entry);
        }

        let prev: BTreeSet<Identity> = self.peer_ref(sender_pid).known_peers().clone();
        let mut changed = false;

        // Edges the sender no longer reports: remove symmetrically and see
        // whether either end has become garbage.
        let removed: Vec<Identity> = prev
            .iter()
            .filter(|id| !next.contains_key(*id))
            .copied()
            .collect();
        for gone in removed {
            changed |= self.peer_mut(sender_pid).remove_known_peer(&gone);
            if let Some(other_pid) = self.identified(&gone) {
                self.peer_mut(other_pid).remove_known_peer(&sender_identity);
                self.try_dispose(other_pid);
            }
        }

        // New edges: resolve or create the neighbour, adopt its advertised
        // endpoint when we have nothing better, and link both directions.
        let added: Vec<(Identity, PeerListEntry)> = next
            .iter()
            .filter(|(id, _)| !prev.contains(*id))
            .map(|(id, entry)| (*id, (*entry).clone()))
            .collect();
        for (identity, entry) in added {
            let neighbour_pid = self.get_or_create_by_identity(identity);
            {
                let neighbour = self.peer_mut(neighbour_pid);
                if neighbour.address().is_none() {
                    neighbour.set_address(entry.address.clone());
                }
                if neighbour.port().is_none() {
                    neighbour.set_port(entry.port);
                }
                if neighbour.name().is_none() {
                    neighbour.set_name(entry.name.clone());
                }
                neighbour.add_known_peer(sender_identity);
            }
            changed |= self.peer_mut(sender_pid).add_known_peer(identity);
        }

        if changed {
            self.emit(MeshEvent::KnownPeersChanged { peer: sender_pid });
        }
    }

    /// Periodic task: gossip the connected-peer graph. Every connected peer
    /// hears about every *other* connected peer; workers are omitted unless
    /// configured in, and worker nodes do not gossip at all.
    pub fn broadcast_peer_list(&mut self) {
        if self.config.is_worker {
            return;
        }
        let connected = self.connected_peers();
        for &recipient in &connected {
            let entries: Vec<PeerListEntry> = connected
                .iter()
                .filter(|&&pid| pid != recipient)
                .filter_map(|&pid| {
                    let peer = self.peers.get(&pid)?;
                    if peer.is_worker() && !self.config.broadcast_workers {
                        return None;
                    }
                    Some(PeerListEntry {
                        identity: peer.identity()?.to_base64(),
                        name: peer.name().map(str::to_string),
                        address: peer.address().map(str::to_string),
                        port: peer.port(),
                    })
                })
                .collect();
            let msg = ControlMessage::PeerList(PeerListPayload {
                connected_peers: entries,
            });
            self.send_control_to(recipient, &msg);
        }
    }

    // ------------------------------------------------------------------
    // Disposal
    // ------------------------------------------------------------------

    /// Periodic task: drop every record that will never be useful again.
    pub fn dispose_peers(&mut self) {
        let pids: Vec<PeerId> = self.peers.keys().copied().collect();
        for pid in pids {
            self.try_dispose(pid);
        }
    }

    /// Dispose a record iff it is disconnected, has no connected neighbour
    /// left to broker a way back to it, and its direct dialling has been
    /// written off.
    pub fn try_dispose(&mut self, pid: PeerId) -> bool {
        let Some(peer) = self.peers.get(&pid) else {
            return false;
        };
        if !peer.state().is_disconnected() {
            return false;
        }
        let has_connected_neighbour = peer.known_peers().iter().any(|nid| {
            self.identified
                .get(nid)
                .and_then(|npid| self.peers.get(npid))
                .map(|n| n.state().is_connected())
                .unwrap_or(false)
        });
        if has_connected_neighbour {
            return false;
        }
        if !peer.retry(TransportKind::Direct).will_never_retry() {
            return false;
        }

        let identity = peer.identity().copied();
        let neighbours: Vec<Identity> = peer.known_peers().iter().copied().collect();
        debug!(peer = %peer.display_name(), "disposing peer");

        self.peer_mut(pid).dispose();
        self.peers.remove(&pid);
        if let Some(identity) = identity {
            if self.identified.get(&identity) == Some(&pid) {
                self.identified.remove(&identity);
            }
            // Symmetric edge removal on the surviving side.
            for neighbour in neighbours {
                if let Some(npid) = self.identified(&neighbour) {
                    if self.peer_mut(npid).remove_known_peer(&identity) {
                        self.emit(MeshEvent::KnownPeersChanged { peer: npid });
                    }
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{BoxedPayload, MessageBox};
    use crate::identity::{Keypair, IDENTITY_LEN};
    use crate::transport::memory;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    /// Reversible box for tests: ciphertext is the plaintext, the nonce
    /// carries nothing.
    struct PlainBox;

    impl MessageBox for PlainBox {
        fn box_message(&self, plaintext: &[u8], _recipient: &Identity) -> BoxedPayload {
            BoxedPayload {
                nonce: vec![0],
                ciphertext: plaintext.to_vec(),
            }
        }

        fn unbox_message(
            &self,
            ciphertext: &[u8],
            _nonce: &[u8],
            _sender: &Identity,
        ) -> Option<Vec<u8>> {
            Some(ciphertext.to_vec())
        }
    }

    fn manager(
        hub: &memory::MemoryHub,
        listen: &str,
    ) -> (
        PeerManager,
        mpsc::UnboundedReceiver<TransportEvent>,
        mpsc::UnboundedReceiver<MeshEvent>,
    ) {
        let local = LocalPeer::new(
            Keypair::generate(),
            AgentVersion::new("weft", 1, "test"),
            Arc::new(PlainBox),
        )
        .with_port(listen.rsplit(':').next().and_then(|p| p.parse().ok()).unwrap_or(0));
        let (net_tx, net_rx) = mpsc::unbounded_channel();
        let (mgr, events) = PeerManager::new(
            local,
            MeshConfig::default(),
            Box::new(hub.direct(listen)),
            Box::new(hub.assisted()),
            net_tx,
        );
        (mgr, net_rx, events)
    }

    fn pump(mgr: &mut PeerManager, rx: &mut mpsc::UnboundedReceiver<TransportEvent>) {
        while let Ok(ev) = rx.try_recv() {
            mgr.handle_transport_event(ev);
        }
    }

    #[test]
    fn connect_to_address_parses_and_creates() {
        let hub = memory::MemoryHub::new();
        let (mut mgr, _net, _events) = manager(&hub, "1.1.1.1:9000");
        let pid = mgr.connect_to_address("2.2.2.2:9001").unwrap();
        let peer = mgr.peer(pid).unwrap();
        assert_eq!(peer.address(), Some("2.2.2.2"));
        assert_eq!(peer.port(), Some(9001));

        assert!(mgr.connect_to_address("no-port").is_err());
        assert!(mgr.connect_to_address(":9001").is_err());
        assert!(mgr.connect_to_address("h:notaport").is_err());
    }

    #[test]
    fn dial_admission_respects_slots_and_windows() {
        let hub = memory::MemoryHub::new();
        let (mut mgr, mut net, _events) = manager(&hub, "1.1.1.1:9000");
        // No listener for the target: the dial starts, then fails.
        let pid = mgr.connect_to_address("2.2.2.2:9001").unwrap();
        // Slot is occupied while the attempt is in flight.
        assert!(!mgr.connect_via_direct(pid));
        pump(&mut mgr, &mut net);
        // The refused dial recorded a failure: cooldown blocks an instant retry.
        assert!(!mgr.peer(pid).unwrap().retry(TransportKind::Direct).can_connect(now_ms()));
        assert_eq!(
            mgr.peer(pid).unwrap().retry(TransportKind::Direct).consecutive_failures(),
            1
        );

        // A peer-requested disconnect window also blocks dialling.
        let pid2 = {
            let p = mgr.create_peer();
            let peer = mgr.peer_mut(p);
            peer.set_address(Some("3.3.3.3".to_string()));
            peer.set_port(Some(1));
            peer.set_peer_disconnect(DisconnectWindow {
                reason: DisconnectReason::Congested,
                until_ms: now_ms() + 100_000,
            });
            p
        };
        assert!(!mgr.connect_via_direct(pid2));
    }

    #[test]
    fn assisted_dial_fails_without_broker() {
        let hub = memory::MemoryHub::new();
        let (mut mgr, _net, _events) = manager(&hub, "1.1.1.1:9000");
        let target = Identity::from_bytes([3u8; IDENTITY_LEN]);
        let pid = mgr.get_or_create_by_identity(target);
        assert!(!mgr.connect_via_assisted(pid));
        assert!(mgr
            .peer(pid)
            .unwrap()
            .connection(TransportKind::Assisted)
            .is_none());
    }

    #[test]
    fn disposal_needs_all_three_conditions() {
        let hub = memory::MemoryHub::new();
        let (mut mgr, _net, _events) = manager(&hub, "1.1.1.1:9000");
        let pid = {
            let p = mgr.create_peer();
            mgr.peer_mut(p).set_address(Some("4.4.4.4".to_string()));
            p
        };
        // Disconnected, no neighbours, but still retriable.
        assert!(!mgr.try_dispose(pid));
        mgr.peer_mut(pid)
            .retry_mut(TransportKind::Direct)
            .never_retry_connecting();
        assert!(mgr.try_dispose(pid));
        assert!(mgr.peer(pid).is_none());
    }

    #[test]
    fn stats_reflect_the_registries() {
        let hub = memory::MemoryHub::new();
        let (mut mgr, _net, _events) = manager(&hub, "1.1.1.1:9000");
        assert_eq!(
            mgr.stats(),
            MeshStats {
                peers: 0,
                connected_peers: 0,
                identified_peers: 0,
                frames_dropped: 0
            }
        );
        let identity = Identity::from_bytes([1u8; IDENTITY_LEN]);
        mgr.get_or_create_by_identity(identity);
        let stats = mgr.stats();
        assert_eq!(stats.peers, 1);
        assert_eq!(stats.identified_peers, 1);
    }
}
