//! # Per-Transport Connections
//!
//! A [`Connection`] owns exactly one transport session and runs its state
//! machine. Peers hold at most one connection per transport kind; the
//! manager drives state transitions as transport events arrive.
//!
//! ## State Machine
//!
//! ```text
//! Connecting ──► WaitingForIdentity ──► Connected ──► Disconnected
//!     │  │                  ▲
//!     │  └──► Signaling ────┘
//!     └──► RequestSignaling ──► Signaling
//! ```
//!
//! Every state can also fall to `Disconnected`. All other transitions are
//! crate bugs: transitions are only ever issued by the manager, so an
//! illegal one means broken logic, not a hostile peer, and
//! [`Connection::set_state`] panics on it.
//!
//! ## Send Admission
//!
//! Frames are admitted only in `WaitingForIdentity` (the handshake itself)
//! and `Connected`. Anything else is dropped silently and counted: the
//! overlay offers no delivery guarantee, and callers that care observe the
//! peer state first.

use std::fmt;

use tracing::{debug, trace};

use crate::error::MeshError;
use crate::identity::Identity;
use crate::transport::{ConnectionId, SessionHandle, SignalingPayload};

/// Which transport a connection runs over.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Address-dialled (socket-like).
    Direct,
    /// Formed through brokered signalling (NAT traversal).
    Assisted,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Direct => f.write_str("direct"),
            TransportKind::Assisted => f.write_str("assisted"),
        }
    }
}

/// Who opened the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => f.write_str("inbound"),
            Direction::Outbound => f.write_str("outbound"),
        }
    }
}

/// Connection life-cycle states.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport handshake outstanding.
    Connecting,
    /// Transport up, our identity sent, the remote's expected next.
    WaitingForIdentity,
    /// A signalling request is outbound via a broker (assisted only).
    RequestSignaling,
    /// Exchanging signalling payloads via a broker (assisted only).
    Signaling,
    /// Fully authenticated; application traffic permitted.
    Connected { identity: Identity },
    /// Terminal for this connection instance.
    Disconnected,
}

impl ConnectionState {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::WaitingForIdentity => "waiting_for_identity",
            ConnectionState::RequestSignaling => "request_signaling",
            ConnectionState::Signaling => "signaling",
            ConnectionState::Connected { .. } => "connected",
            ConnectionState::Disconnected => "disconnected",
        }
    }

    /// The transition table. Everything can fall to `Disconnected` except
    /// `Disconnected` itself.
    fn can_transition(&self, next: &ConnectionState) -> bool {
        use ConnectionState::*;
        if matches!(self, Disconnected) {
            return false;
        }
        if matches!(next, Disconnected) {
            return true;
        }
        matches!(
            (self, next),
            (Connecting, WaitingForIdentity)
                | (Connecting, Signaling)
                | (Connecting, RequestSignaling)
                | (RequestSignaling, Signaling)
                | (Signaling, WaitingForIdentity)
                | (WaitingForIdentity, Connected { .. })
        )
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, ConnectionState::Disconnected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One transport session and its state machine.
pub struct Connection {
    id: ConnectionId,
    kind: TransportKind,
    direction: Direction,
    state: ConnectionState,
    handle: Option<Box<dyn SessionHandle>>,
    /// Broker identity routing our outbound signals (assisted only).
    broker: Option<Identity>,
    /// Why the connection closed, when it closed with an error.
    error: Option<MeshError>,
    /// Whether the connection ever reached `Connected`. Closures before
    /// that count as failed dial attempts for the retry policy.
    was_connected: bool,
    frames_dropped: u64,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        kind: TransportKind,
        direction: Direction,
        handle: Box<dyn SessionHandle>,
    ) -> Self {
        Self {
            id,
            kind,
            direction,
            state: ConnectionState::Connecting,
            handle: Some(handle),
            broker: None,
            error: None,
            was_connected: false,
            frames_dropped: 0,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn broker(&self) -> Option<&Identity> {
        self.broker.as_ref()
    }

    pub fn set_broker(&mut self, broker: Identity) {
        self.broker = Some(broker);
    }

    pub fn error(&self) -> Option<&MeshError> {
        self.error.as_ref()
    }

    pub fn was_connected(&self) -> bool {
        self.was_connected
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }

    /// Drive the state machine. Panics on an illegal transition; those are
    /// crate bugs, never remote behavior.
    pub fn set_state(&mut self, next: ConnectionState) {
        if !self.state.can_transition(&next) {
            panic!(
                "illegal connection state transition {} -> {} on {}",
                self.state, next, self.id
            );
        }
        debug!(conn = %self.id, from = %self.state, to = %next, "connection state");
        if next.is_connected() {
            self.was_connected = true;
        }
        self.state = next;
    }

    /// Queue a frame if the state admits it. Returns whether the frame was
    /// admitted; a refusal is silent apart from the drop counter.
    pub fn send(&mut self, frame: &[u8]) -> bool {
        let admitted = matches!(
            self.state,
            ConnectionState::WaitingForIdentity | ConnectionState::Connected { .. }
        );
        if !admitted {
            self.frames_dropped += 1;
            trace!(conn = %self.id, state = %self.state, "frame dropped by admission");
            return false;
        }
        if let Some(handle) = self.handle.as_mut() {
            handle.send(frame);
        }
        admitted
    }

    /// Feed a remote signalling payload into the session's inlet.
    pub fn signal(&mut self, payload: SignalingPayload) {
        if let Some(handle) = self.handle.as_mut() {
            handle.signal(payload);
        }
    }

    /// Force `Disconnected` and release the transport handle exactly once.
    /// Idempotent: closing a closed connection does nothing.
    pub fn close(&mut self, error: Option<MeshError>) {
        if self.state.is_disconnected() {
            return;
        }
        if let Some(err) = &error {
            debug!(conn = %self.id, kind = %self.kind, %err, "closing connection");
        }
        self.error = error;
        self.set_state(ConnectionState::Disconnected);
        if let Some(mut handle) = self.handle.take() {
            handle.close();
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("direction", &self.direction)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IDENTITY_LEN;
    use crate::transport::{memory, ConnectionIds, SessionContext, TransportEvent};
    use tokio::sync::mpsc;

    fn test_identity() -> Identity {
        Identity::from_bytes([9u8; IDENTITY_LEN])
    }

    fn wired(
        kind: TransportKind,
        direction: Direction,
    ) -> (
        Connection,
        memory::RemoteEnd,
        mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let ids = ConnectionIds::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = ids.next();
        let (handle, remote) = memory::session_pair(SessionContext { conn, events: tx });
        (Connection::new(conn, kind, direction, handle), remote, rx)
    }

    #[test]
    fn direct_handshake_path() {
        let (mut conn, _remote, _rx) = wired(TransportKind::Direct, Direction::Outbound);
        assert_eq!(*conn.state(), ConnectionState::Connecting);
        conn.set_state(ConnectionState::WaitingForIdentity);
        conn.set_state(ConnectionState::Connected {
            identity: test_identity(),
        });
        assert!(conn.state().is_connected());
        assert!(conn.was_connected());
        conn.set_state(ConnectionState::Disconnected);
    }

    #[test]
    fn assisted_initiator_path() {
        let (mut conn, _remote, _rx) = wired(TransportKind::Assisted, Direction::Outbound);
        conn.set_state(ConnectionState::Signaling);
        conn.set_state(ConnectionState::WaitingForIdentity);
        conn.set_state(ConnectionState::Connected {
            identity: test_identity(),
        });
    }

    #[test]
    fn assisted_requester_path() {
        let (mut conn, _remote, _rx) = wired(TransportKind::Assisted, Direction::Outbound);
        conn.set_state(ConnectionState::RequestSignaling);
        conn.set_state(ConnectionState::Signaling);
        conn.set_state(ConnectionState::WaitingForIdentity);
    }

    #[test]
    #[should_panic(expected = "illegal connection state transition")]
    fn skipping_the_handshake_panics() {
        let (mut conn, _remote, _rx) = wired(TransportKind::Direct, Direction::Outbound);
        conn.set_state(ConnectionState::Connected {
            identity: test_identity(),
        });
    }

    #[test]
    #[should_panic(expected = "illegal connection state transition")]
    fn leaving_disconnected_panics() {
        let (mut conn, _remote, _rx) = wired(TransportKind::Direct, Direction::Outbound);
        conn.set_state(ConnectionState::Disconnected);
        conn.set_state(ConnectionState::Connecting);
    }

    #[test]
    fn send_admission() {
        let (mut conn, mut remote, _rx) = wired(TransportKind::Direct, Direction::Outbound);

        // Connecting: dropped
        assert!(!conn.send(b"early"));
        assert_eq!(conn.frames_dropped(), 1);
        assert!(remote.drain_sent().is_empty());

        // WaitingForIdentity: admitted
        conn.set_state(ConnectionState::WaitingForIdentity);
        assert!(conn.send(b"identify"));
        assert_eq!(remote.drain_sent(), vec![b"identify".to_vec()]);

        // Connected: admitted
        conn.set_state(ConnectionState::Connected {
            identity: test_identity(),
        });
        assert!(conn.send(b"app"));

        // Disconnected: dropped
        conn.close(None);
        assert!(!conn.send(b"late"));
        assert_eq!(conn.frames_dropped(), 2);
    }

    #[test]
    fn close_is_idempotent_and_releases_handle() {
        let (mut conn, remote, _rx) = wired(TransportKind::Direct, Direction::Inbound);
        conn.close(Some(MeshError::Network("boom".to_string())));
        assert!(conn.state().is_disconnected());
        assert!(remote.is_closed());
        assert_eq!(
            conn.error(),
            Some(&MeshError::Network("boom".to_string()))
        );

        // Second close keeps the first error and does not panic.
        conn.close(Some(MeshError::Network("again".to_string())));
        assert_eq!(
            conn.error(),
            Some(&MeshError::Network("boom".to_string()))
        );
    }
}
