//! # Transport Interfaces
//!
//! The peer manager drives two kinds of transport session without owning
//! either implementation:
//!
//! - **Direct**: dialled with an address and port (a socket, typically)
//! - **Assisted**: formed by exchanging signalling payloads through a broker
//!   before any bytes can flow (NAT traversal)
//!
//! ## Event Flow
//!
//! ```text
//! ┌──────────────┐  dial/create   ┌──────────────┐
//! │ PeerManager  │───────────────►│   adapter    │
//! │  (one loop)  │◄───────────────│ (any thread) │
//! └──────────────┘ TransportEvent └──────────────┘
//! ```
//!
//! Adapters never call back into the manager. Every observation (session
//! opened, frame received, session closed, local signalling payload ready,
//! inbound session accepted) is posted as a [`TransportEvent`] into the
//! manager's event channel and processed on its single loop. `dial` and
//! `create` return a [`SessionHandle`] immediately; connection progress
//! arrives later as events. The channel is unbounded so adapters can post
//! from any context without deadlocking against the loop.
//!
//! ## Signalling Payloads
//!
//! Assisted sessions produce and consume [`SignalingPayload`]s, the
//! transport's native signalling structure, JSON-encoded. The manager treats
//! them as opaque: it boxes outbound payloads for the far end and feeds
//! unboxed inbound ones into [`SessionHandle::signal`].
//!
//! ## In-Process Transport
//!
//! The [`memory`] submodule provides channel-backed implementations of both
//! traits, used by the test suite and by local simulations: a hub that wires
//! direct dials between registered listeners, an offer/answer rendezvous for
//! assisted pairs, and a scripted session pair for driving a single manager
//! by hand.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

/// The transport's native signalling structure, JSON-encoded.
pub type SignalingPayload = serde_json::Value;

// ============================================================================
// Connection Identifiers
// ============================================================================

/// Identifies one transport session for the lifetime of a manager.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Shared allocator for [`ConnectionId`]s.
///
/// The manager and every acceptor clone one allocator, so inbound sessions
/// get ids from the same sequence as outbound dials.
#[derive(Clone, Default)]
pub struct ConnectionIds(Arc<AtomicU64>);

impl ConnectionIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> ConnectionId {
        ConnectionId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

// ============================================================================
// Events and Contexts
// ============================================================================

/// An observation posted by a transport adapter into the manager's loop.
pub enum TransportEvent {
    /// The session's transport handshake completed; frames may flow.
    Opened { conn: ConnectionId },
    /// The session is gone. `error` is `None` for an orderly remote close.
    Closed {
        conn: ConnectionId,
        error: Option<String>,
    },
    /// A frame arrived. Per-session wire order is preserved.
    Frame { conn: ConnectionId, data: Vec<u8> },
    /// The assisted session produced a local signalling payload that must
    /// reach the far end through a broker.
    SignalReady {
        conn: ConnectionId,
        payload: SignalingPayload,
    },
    /// An acceptor produced a fresh inbound direct session.
    InboundDirect {
        conn: ConnectionId,
        handle: Box<dyn SessionHandle>,
        /// Observed remote address, when the adapter knows it.
        address: Option<String>,
    },
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::Opened { conn } => write!(f, "Opened({conn})"),
            TransportEvent::Closed { conn, error } => write!(f, "Closed({conn}, {error:?})"),
            TransportEvent::Frame { conn, data } => {
                write!(f, "Frame({conn}, {} bytes)", data.len())
            }
            TransportEvent::SignalReady { conn, .. } => write!(f, "SignalReady({conn})"),
            TransportEvent::InboundDirect { conn, address, .. } => {
                write!(f, "InboundDirect({conn}, {address:?})")
            }
        }
    }
}

/// Per-session context handed to an adapter at dial/create time.
pub struct SessionContext {
    pub conn: ConnectionId,
    pub events: mpsc::UnboundedSender<TransportEvent>,
}

/// Context handed to a direct transport so its acceptor can mint sessions.
#[derive(Clone)]
pub struct AcceptorContext {
    pub events: mpsc::UnboundedSender<TransportEvent>,
    pub ids: ConnectionIds,
}

// ============================================================================
// Session and Factory Traits
// ============================================================================

/// One live transport session, exclusively owned by its `Connection`.
pub trait SessionHandle: Send {
    /// Queue a frame. Fire-and-forget: transport failures surface later as
    /// a `Closed` event, not as a send error.
    fn send(&mut self, frame: &[u8]);

    /// Tear the session down. Must be idempotent; the far end observes a
    /// `Closed` event.
    fn close(&mut self);

    /// Feed a remote signalling payload into the session. Only assisted
    /// sessions have an inlet; direct sessions ignore the call.
    fn signal(&mut self, payload: SignalingPayload) {
        let _ = payload;
    }
}

/// Factory for address-dialled sessions.
pub trait DirectTransport: Send {
    /// Begin accepting inbound sessions, posting them through `ctx`.
    /// Called once, when the manager is constructed.
    fn start_accepting(&mut self, ctx: AcceptorContext);

    /// Open a session toward `address:port`. Returns immediately; the
    /// outcome arrives as an `Opened` or `Closed` event for `ctx.conn`.
    fn dial(&mut self, address: &str, port: u16, ctx: SessionContext) -> Box<dyn SessionHandle>;
}

/// Factory for broker-assisted sessions.
pub trait AssistedTransport: Send {
    /// Create one end of an assisted session. The initiator end emits the
    /// first signalling payload unprompted; the other end waits for it via
    /// [`SessionHandle::signal`].
    fn create(&mut self, initiator: bool, ctx: SessionContext) -> Box<dyn SessionHandle>;
}

// ============================================================================
// In-Process Transport
// ============================================================================

pub mod memory {
    //! Channel-backed transports for tests and in-process simulation.
    //!
    //! [`MemoryHub`] plays the role of the network: direct listeners
    //! register under an `address:port` key, dials cross-wire two session
    //! halves, and assisted pairs rendezvous through tokens embedded in
    //! their offer/answer payloads. [`session_pair`] yields a single wired
    //! session plus a scripted far end for driving one manager by hand.

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use serde_json::json;
    use tracing::debug;

    use super::{
        AcceptorContext, AssistedTransport, ConnectionId, ConnectionIds, DirectTransport,
        SessionContext, SessionHandle, SignalingPayload, TransportEvent,
    };

    /// One direction of a wired link: where to post events, and as whom.
    #[derive(Clone)]
    struct Wire {
        conn: ConnectionId,
        events: tokio::sync::mpsc::UnboundedSender<TransportEvent>,
    }

    impl Wire {
        fn post(&self, ev: TransportEvent) {
            // The far side may already be gone; a dropped event is
            // indistinguishable from network loss.
            let _ = self.events.send(ev);
        }

        fn from_ctx(ctx: &SessionContext) -> Self {
            Self {
                conn: ctx.conn,
                events: ctx.events.clone(),
            }
        }
    }

    // ------------------------------------------------------------------------
    // Linked sessions (hub-wired)
    // ------------------------------------------------------------------------

    /// Shared state of one linked session half.
    struct LinkShared {
        peer: Mutex<Option<Wire>>,
        closed: AtomicBool,
    }

    /// A session half wired (or waiting to be wired) to a far end.
    struct LinkedSession {
        me: Wire,
        shared: Arc<LinkShared>,
        /// Rendezvous bookkeeping for assisted halves.
        assist: Option<AssistState>,
    }

    struct AssistState {
        hub: MemoryHub,
        initiator: bool,
        /// The rendezvous token. Initiators mint one; responders learn it
        /// from the offer and never own the slot.
        token: Option<u64>,
    }

    impl LinkedSession {
        fn linked(me: Wire, peer: Wire) -> (Self, Arc<LinkShared>) {
            let shared = Arc::new(LinkShared {
                peer: Mutex::new(Some(peer)),
                closed: AtomicBool::new(false),
            });
            (
                Self {
                    me,
                    shared: shared.clone(),
                    assist: None,
                },
                shared,
            )
        }

        fn pending_assist(me: Wire, assist: AssistState) -> Self {
            Self {
                me,
                shared: Arc::new(LinkShared {
                    peer: Mutex::new(None),
                    closed: AtomicBool::new(false),
                }),
                assist: Some(assist),
            }
        }
    }

    impl SessionHandle for LinkedSession {
        fn send(&mut self, frame: &[u8]) {
            if self.shared.closed.load(Ordering::SeqCst) {
                return;
            }
            let peer = self.shared.peer.lock().expect("link lock");
            if let Some(wire) = peer.as_ref() {
                wire.post(TransportEvent::Frame {
                    conn: wire.conn,
                    data: frame.to_vec(),
                });
            }
        }

        fn close(&mut self) {
            if self.shared.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            if let Some(assist) = &self.assist {
                if assist.initiator {
                    if let Some(token) = assist.token {
                        assist.hub.abandon_rendezvous(token);
                    }
                }
            }
            let peer = self.shared.peer.lock().expect("link lock");
            if let Some(wire) = peer.as_ref() {
                wire.post(TransportEvent::Closed {
                    conn: wire.conn,
                    error: None,
                });
            }
        }

        fn signal(&mut self, payload: SignalingPayload) {
            let Some(assist) = &self.assist else {
                debug!("signal fed into a direct memory session, ignoring");
                return;
            };
            if self.shared.closed.load(Ordering::SeqCst) {
                return;
            }
            let token = payload.get("token").and_then(|t| t.as_u64());
            let kind = payload.get("type").and_then(|t| t.as_str());
            match (kind, token) {
                (Some("offer"), Some(token)) if !assist.initiator => {
                    assist
                        .hub
                        .complete_rendezvous_responder(token, &self.me, &self.shared);
                }
                (Some("answer"), token) if assist.initiator && token == assist.token => {
                    if let Some(token) = token {
                        assist.hub.complete_rendezvous_initiator(token, &self.shared);
                    }
                }
                _ => debug!("assisted rendezvous: unexpected payload {payload}"),
            }
        }
    }

    /// Handle returned when a dial cannot even be attempted (no listener).
    struct DeadSession;

    impl SessionHandle for DeadSession {
        fn send(&mut self, _frame: &[u8]) {}
        fn close(&mut self) {}
    }

    // ------------------------------------------------------------------------
    // Hub
    // ------------------------------------------------------------------------

    struct RendezvousSlot {
        initiator: Wire,
        responder: Option<Wire>,
    }

    #[derive(Default)]
    struct HubInner {
        listeners: HashMap<String, AcceptorContext>,
        rendezvous: HashMap<u64, RendezvousSlot>,
        next_token: u64,
    }

    /// The in-process "network": a registry of listeners and pending
    /// assisted rendezvous.
    #[derive(Clone, Default)]
    pub struct MemoryHub {
        inner: Arc<Mutex<HubInner>>,
    }

    impl MemoryHub {
        pub fn new() -> Self {
            Self::default()
        }

        /// A direct transport listening on `listen_addr` (an
        /// `address:port` string).
        pub fn direct(&self, listen_addr: impl Into<String>) -> MemoryDirect {
            MemoryDirect {
                hub: self.clone(),
                listen_addr: listen_addr.into(),
            }
        }

        /// An assisted transport rendezvousing through this hub.
        pub fn assisted(&self) -> MemoryAssisted {
            MemoryAssisted { hub: self.clone() }
        }

        fn register_listener(&self, addr: String, ctx: AcceptorContext) {
            self.inner
                .lock()
                .expect("hub lock")
                .listeners
                .insert(addr, ctx);
        }

        fn open_rendezvous(&self, me: Wire) -> u64 {
            let mut inner = self.inner.lock().expect("hub lock");
            inner.next_token += 1;
            let token = inner.next_token;
            inner.rendezvous.insert(
                token,
                RendezvousSlot {
                    initiator: me,
                    responder: None,
                },
            );
            token
        }

        fn abandon_rendezvous(&self, token: u64) {
            self.inner
                .lock()
                .expect("hub lock")
                .rendezvous
                .remove(&token);
        }

        /// The responder saw the offer: link it toward the initiator and
        /// emit the answer. Neither side opens yet; the initiator completes
        /// the pair when the answer reaches it.
        fn complete_rendezvous_responder(
            &self,
            token: u64,
            responder: &Wire,
            responder_shared: &Arc<LinkShared>,
        ) {
            let mut inner = self.inner.lock().expect("hub lock");
            let Some(slot) = inner.rendezvous.get_mut(&token) else {
                debug!("assisted rendezvous: offer for unknown token {token}");
                return;
            };
            *responder_shared.peer.lock().expect("link lock") = Some(slot.initiator.clone());
            slot.responder = Some(responder.clone());
            responder.post(TransportEvent::SignalReady {
                conn: responder.conn,
                payload: json!({ "type": "answer", "token": token }),
            });
        }

        /// The answer reached the initiator: cross-wire and open both ends.
        fn complete_rendezvous_initiator(&self, token: u64, initiator_shared: &Arc<LinkShared>) {
            let slot = {
                let mut inner = self.inner.lock().expect("hub lock");
                inner.rendezvous.remove(&token)
            };
            let Some(slot) = slot else {
                debug!("assisted rendezvous: answer for unknown token {token}");
                return;
            };
            let Some(responder) = slot.responder else {
                debug!("assisted rendezvous: answer before any responder");
                return;
            };
            *initiator_shared.peer.lock().expect("link lock") = Some(responder.clone());
            slot.initiator.post(TransportEvent::Opened {
                conn: slot.initiator.conn,
            });
            responder.post(TransportEvent::Opened {
                conn: responder.conn,
            });
        }
    }

    /// Direct transport over a [`MemoryHub`].
    pub struct MemoryDirect {
        hub: MemoryHub,
        listen_addr: String,
    }

    impl DirectTransport for MemoryDirect {
        fn start_accepting(&mut self, ctx: AcceptorContext) {
            self.hub.register_listener(self.listen_addr.clone(), ctx);
        }

        fn dial(
            &mut self,
            address: &str,
            port: u16,
            ctx: SessionContext,
        ) -> Box<dyn SessionHandle> {
            let key = format!("{address}:{port}");
            let acceptor = {
                let inner = self.hub.inner.lock().expect("hub lock");
                inner.listeners.get(&key).cloned()
            };
            let Some(acceptor) = acceptor else {
                ctx.events
                    .send(TransportEvent::Closed {
                        conn: ctx.conn,
                        error: Some(format!("connection refused: {key}")),
                    })
                    .ok();
                return Box::new(DeadSession);
            };

            let dialer = Wire::from_ctx(&ctx);
            let accepted = Wire {
                conn: acceptor.ids.next(),
                events: acceptor.events.clone(),
            };
            let (dial_half, _) = LinkedSession::linked(dialer.clone(), accepted.clone());
            let (accept_half, _) = LinkedSession::linked(accepted.clone(), dialer.clone());

            // The observed remote address is the host only, as a socket
            // acceptor would report it.
            let observed = self
                .listen_addr
                .rsplit_once(':')
                .map(|(host, _)| host.to_string())
                .unwrap_or_else(|| self.listen_addr.clone());
            accepted.post(TransportEvent::InboundDirect {
                conn: accepted.conn,
                handle: Box::new(accept_half),
                address: Some(observed),
            });
            accepted.post(TransportEvent::Opened {
                conn: accepted.conn,
            });
            dialer.post(TransportEvent::Opened { conn: dialer.conn });

            Box::new(dial_half)
        }
    }

    /// Assisted transport over a [`MemoryHub`].
    pub struct MemoryAssisted {
        hub: MemoryHub,
    }

    impl AssistedTransport for MemoryAssisted {
        fn create(&mut self, initiator: bool, ctx: SessionContext) -> Box<dyn SessionHandle> {
            let me = Wire::from_ctx(&ctx);
            if initiator {
                let shared = Arc::new(LinkShared {
                    peer: Mutex::new(None),
                    closed: AtomicBool::new(false),
                });
                let token = self.hub.open_rendezvous(me.clone());
                me.post(TransportEvent::SignalReady {
                    conn: me.conn,
                    payload: json!({ "type": "offer", "token": token }),
                });
                Box::new(LinkedSession {
                    me,
                    shared,
                    assist: Some(AssistState {
                        hub: self.hub.clone(),
                        initiator: true,
                        token: Some(token),
                    }),
                })
            } else {
                Box::new(LinkedSession::pending_assist(
                    me,
                    AssistState {
                        hub: self.hub.clone(),
                        initiator: false,
                        token: None,
                    },
                ))
            }
        }
    }

    // ------------------------------------------------------------------------
    // Scripted session pair
    // ------------------------------------------------------------------------

    /// State observable by the scripted far end.
    struct HarnessShared {
        closed: AtomicBool,
        signals: Mutex<Vec<SignalingPayload>>,
    }

    /// The node-side half of a scripted pair.
    struct HarnessSession {
        sent: tokio::sync::mpsc::UnboundedSender<Vec<u8>>,
        shared: Arc<HarnessShared>,
    }

    impl SessionHandle for HarnessSession {
        fn send(&mut self, frame: &[u8]) {
            if !self.shared.closed.load(Ordering::SeqCst) {
                let _ = self.sent.send(frame.to_vec());
            }
        }

        fn close(&mut self) {
            self.shared.closed.store(true, Ordering::SeqCst);
        }

        fn signal(&mut self, payload: SignalingPayload) {
            self.shared
                .signals
                .lock()
                .expect("harness lock")
                .push(payload);
        }
    }

    /// Scripted far end of a [`session_pair`]: inject transport events and
    /// observe everything the node did with its half.
    pub struct RemoteEnd {
        wire: Wire,
        sent_rx: tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>,
        shared: Arc<HarnessShared>,
    }

    impl RemoteEnd {
        pub fn conn(&self) -> ConnectionId {
            self.wire.conn
        }

        /// Announce the transport handshake as complete.
        pub fn open(&self) {
            self.wire.post(TransportEvent::Opened {
                conn: self.wire.conn,
            });
        }

        /// Deliver a raw frame as if the remote had sent it.
        pub fn deliver(&self, data: Vec<u8>) {
            self.wire.post(TransportEvent::Frame {
                conn: self.wire.conn,
                data,
            });
        }

        /// Surface a locally generated signalling payload (assisted only).
        pub fn emit_signal(&self, payload: SignalingPayload) {
            self.wire.post(TransportEvent::SignalReady {
                conn: self.wire.conn,
                payload,
            });
        }

        /// Close the session from the remote side.
        pub fn close(&self, error: Option<&str>) {
            self.wire.post(TransportEvent::Closed {
                conn: self.wire.conn,
                error: error.map(str::to_string),
            });
        }

        /// Frames the node has sent on its half since the last drain.
        pub fn drain_sent(&mut self) -> Vec<Vec<u8>> {
            let mut out = Vec::new();
            while let Ok(frame) = self.sent_rx.try_recv() {
                out.push(frame);
            }
            out
        }

        /// Whether the node has closed its half.
        pub fn is_closed(&self) -> bool {
            self.shared.closed.load(Ordering::SeqCst)
        }

        /// Signalling payloads the node has fed into its half.
        pub fn received_signals(&self) -> Vec<SignalingPayload> {
            self.shared.signals.lock().expect("harness lock").clone()
        }
    }

    /// A wired session for the node plus a scripted far end for the test.
    pub fn session_pair(ctx: SessionContext) -> (Box<dyn SessionHandle>, RemoteEnd) {
        let (sent_tx, sent_rx) = tokio::sync::mpsc::unbounded_channel();
        let shared = Arc::new(HarnessShared {
            closed: AtomicBool::new(false),
            signals: Mutex::new(Vec::new()),
        });
        let session = HarnessSession {
            sent: sent_tx,
            shared: shared.clone(),
        };
        let remote = RemoteEnd {
            wire: Wire::from_ctx(&ctx),
            sent_rx,
            shared,
        };
        (Box::new(session), remote)
    }

}
