//! Shared harness for the integration tests: scripted transports that
//! expose the far end of every session, deterministic identities for
//! tie-break-sensitive scenarios, and a driver that pumps the manager's
//! event channel to quiescence.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use weft::crypto::{BoxedPayload, MessageBox};
use weft::identity::IDENTITY_LEN;
use weft::messages::{
    encode_frame, ControlMessage, Frame, IdentifyPayload,
};
use weft::transport::{
    memory, AcceptorContext, AssistedTransport, DirectTransport, SessionContext, SessionHandle,
    TransportEvent,
};
use weft::{
    AgentVersion, Identity, Keypair, LocalPeer, MeshConfig, MeshEvent, PeerId, PeerManager,
};

// ----------------------------------------------------------------------------
// Boxing stubs
// ----------------------------------------------------------------------------

/// Reversible box: the ciphertext is the plaintext.
pub struct PlainBox;

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

/// A box whose unboxing always fails authentication.
pub struct FailBox;

impl MessageBox for FailBox {
    fn box_message(&self, plaintext: &[u8], _recipient: &Identity) -> BoxedPayload {
        BoxedPayload {
            nonce: vec![0],
            ciphertext: plaintext.to_vec(),
        }
    }

    fn unbox_message(
        &self,
        _ciphertext: &[u8],
        _nonce: &[u8],
        _sender: &Identity,
    ) -> Option<Vec<u8>> {
        None
    }
}

// ----------------------------------------------------------------------------
// Scripted transports
// ----------------------------------------------------------------------------

/// A dial the manager performed, with the scripted far end of the session.
pub struct Dialed {
    pub address: String,
    pub port: u16,
    pub remote: memory::RemoteEnd,
}

#[derive(Default)]
pub struct DirectState {
    pub acceptor: Option<AcceptorContext>,
    pub dials: Vec<Dialed>,
}

/// Direct transport whose sessions are all scripted pairs.
pub struct ScriptedDirect {
    shared: Arc<Mutex<DirectState>>,
}

impl ScriptedDirect {
    pub fn new() -> (Self, Arc<Mutex<DirectState>>) {
        let shared = Arc::new(Mutex::new(DirectState::default()));
        (
            Self {
                shared: shared.clone(),
            },
            shared,
        )
    }
}

impl DirectTransport for ScriptedDirect {
    fn start_accepting(&mut self, ctx: AcceptorContext) {
        self.shared.lock().unwrap().acceptor = Some(ctx);
    }

    fn dial(&mut self, address: &str, port: u16, ctx: SessionContext) -> Box<dyn SessionHandle> {
        let (handle, remote) = memory::session_pair(ctx);
        self.shared.lock().unwrap().dials.push(Dialed {
            address: address.to_string(),
            port,
            remote,
        });
        handle
    }
}

/// One assisted session the manager created.
pub struct AssistedCreated {
    pub initiator: bool,
    pub remote: memory::RemoteEnd,
}

/// Assisted transport whose sessions are all scripted pairs.
pub struct ScriptedAssisted {
    shared: Arc<Mutex<Vec<AssistedCreated>>>,
}

impl ScriptedAssisted {
    pub fn new() -> (Self, Arc<Mutex<Vec<AssistedCreated>>>) {
        let shared = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                shared: shared.clone(),
            },
            shared,
        )
    }
}

impl AssistedTransport for ScriptedAssisted {
    fn create(&mut self, initiator: bool, ctx: SessionContext) -> Box<dyn SessionHandle> {
        let (handle, remote) = memory::session_pair(ctx);
        self.shared
            .lock()
            .unwrap()
            .push(AssistedCreated { initiator, remote });
        handle
    }
}

// ----------------------------------------------------------------------------
// The driver
// ----------------------------------------------------------------------------

pub struct Net {
    pub mgr: PeerManager,
    pub net_rx: mpsc::UnboundedReceiver<TransportEvent>,
    pub events: mpsc::UnboundedReceiver<MeshEvent>,
    pub direct: Arc<Mutex<DirectState>>,
    pub assisted: Arc<Mutex<Vec<AssistedCreated>>>,
}

pub fn build(keypair: Keypair, config: MeshConfig, boxer: Arc<dyn MessageBox>) -> Net {
    let local = LocalPeer::new(keypair, AgentVersion::new("weft", 1, "test"), boxer)
        .with_port(9033)
        .with_name("local");
    let (net_tx, net_rx) = mpsc::unbounded_channel();
    let (scripted_direct, direct) = ScriptedDirect::new();
    let (scripted_assisted, assisted) = ScriptedAssisted::new();
    let (mgr, events) = PeerManager::new(
        local,
        config,
        Box::new(scripted_direct),
        Box::new(scripted_assisted),
        net_tx,
    );
    Net {
        mgr,
        net_rx,
        events,
        direct,
        assisted,
    }
}

pub fn build_default(keypair: Keypair) -> Net {
    build(keypair, MeshConfig::default(), Arc::new(PlainBox))
}

impl Net {
    /// Handle every queued transport event, including ones produced while
    /// handling earlier ones.
    pub fn pump(&mut self) {
        while let Ok(ev) = self.net_rx.try_recv() {
            self.mgr.handle_transport_event(ev);
        }
    }

    pub fn drain_events(&mut self) -> Vec<MeshEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = self.events.try_recv() {
            out.push(ev);
        }
        out
    }

    /// Push a fresh inbound direct session at the manager's acceptor.
    pub fn inject_inbound(&mut self, address: &str) -> memory::RemoteEnd {
        let ctx = self
            .direct
            .lock()
            .unwrap()
            .acceptor
            .clone()
            .expect("acceptor registered");
        let conn = ctx.ids.next();
        let (handle, remote) = memory::session_pair(SessionContext {
            conn,
            events: ctx.events.clone(),
        });
        ctx.events
            .send(TransportEvent::InboundDirect {
                conn,
                handle,
                address: Some(address.to_string()),
            })
            .expect("event channel open");
        remote
    }

    /// Take every dial the direct transport has performed so far.
    pub fn take_dials(&self) -> Vec<Dialed> {
        std::mem::take(&mut self.direct.lock().unwrap().dials)
    }

    /// Take every assisted session created so far.
    pub fn take_assisted(&self) -> Vec<AssistedCreated> {
        std::mem::take(&mut *self.assisted.lock().unwrap())
    }

    /// Drive a complete inbound handshake for `identity` and return the
    /// resulting peer token plus the scripted far end.
    pub fn connect_identified(
        &mut self,
        identity: Identity,
        name: Option<&str>,
    ) -> (PeerId, memory::RemoteEnd) {
        let mut remote = self.inject_inbound("198.51.100.9");
        self.pump();
        remote.open();
        self.pump();
        let _identify = remote.drain_sent();
        remote.deliver(identify_frame(&identity, Some(9033), name, false));
        self.pump();
        let pid = self
            .mgr
            .identified(&identity)
            .expect("inbound handshake completed");
        (pid, remote)
    }
}

// ----------------------------------------------------------------------------
// Deterministic identities
// ----------------------------------------------------------------------------

pub fn fill_identity(b: u8) -> Identity {
    Identity::from_bytes([b; IDENTITY_LEN])
}

/// An identity whose rendered form starts with `A`: below every
/// mid-range keypair identity.
pub fn low_identity() -> Identity {
    fill_identity(0x00)
}

/// A second distinct low identity (also renders with a leading `A`).
pub fn low_identity_2() -> Identity {
    fill_identity(0x01)
}

/// An identity whose rendered form starts with `z`: above every
/// mid-range keypair identity.
pub fn high_identity() -> Identity {
    fill_identity(0xCF)
}

/// A second distinct high identity.
pub fn high_identity_2() -> Identity {
    fill_identity(0xCC)
}

/// Generate a keypair whose identity sorts strictly between the canned low
/// and high identities, so tie-break-sensitive scenarios are
/// deterministic regardless of the generated key.
pub fn mid_keypair() -> Keypair {
    let floor = fill_identity(0x04);
    let ceiling = fill_identity(0xCF);
    loop {
        let keypair = Keypair::generate();
        let id = keypair.identity();
        if floor < id && id < ceiling {
            return keypair;
        }
    }
}

// ----------------------------------------------------------------------------
// Frame builders and decoders
// ----------------------------------------------------------------------------

pub fn control_frame(msg: ControlMessage) -> Vec<u8> {
    encode_frame(&Frame::Control(msg)).expect("frame encodes")
}

pub fn data_frame(bytes: &[u8]) -> Vec<u8> {
    encode_frame(&Frame::Data(bytes.to_vec())).expect("frame encodes")
}

pub fn identify_frame(
    identity: &Identity,
    port: Option<u16>,
    name: Option<&str>,
    is_worker: bool,
) -> Vec<u8> {
    control_frame(ControlMessage::Identify(IdentifyPayload {
        identity: identity.to_base64(),
        version: "weft/1/remote".to_string(),
        port,
        name: name.map(str::to_string),
        is_worker,
    }))
}

/// Decode the control messages out of everything a scripted remote has
/// received, skipping data frames.
pub fn sent_controls(remote: &mut memory::RemoteEnd) -> Vec<ControlMessage> {
    remote
        .drain_sent()
        .into_iter()
        .filter_map(|bytes| match weft::messages::decode_frame(&bytes) {
            Ok(Frame::Control(msg)) => Some(msg),
            _ => None,
        })
        .collect()
}

/// Decode everything a scripted remote has received.
pub fn sent_frames(remote: &mut memory::RemoteEnd) -> Vec<Frame> {
    remote
        .drain_sent()
        .into_iter()
        .map(|bytes| weft::messages::decode_frame(&bytes).expect("frame decodes"))
        .collect()
}
