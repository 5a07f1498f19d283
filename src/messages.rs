//! # Wire Protocol Messages
//!
//! This module defines the overlay-control messages and the frame envelope
//! carried over every transport session. Frames are serialized with bincode
//! under a hard size limit to prevent memory exhaustion from hostile peers.
//!
//! ## Frame Envelope
//!
//! | Variant | Meaning |
//! |---------|---------|
//! | `Frame::Control` | one of the five overlay-control messages |
//! | `Frame::Data` | opaque application payload, surfaced on the message event |
//!
//! ## Overlay-Control Messages
//!
//! | Message | Purpose |
//! |---------|---------|
//! | `Identify` | first message on every session: identity, version, endpoint |
//! | `PeerList` | gossip of the sender's connected-peer graph |
//! | `SignalRequest` | ask the pair's initiator to open an assisted session |
//! | `Signal` | boxed signalling payload, relayed through a broker |
//! | `Disconnecting` | request the remote stay away until a timestamp |
//!
//! Identities inside payloads are carried in their rendered base64 form and
//! validated by the handlers, so a syntactically bad identity is a protocol
//! error on the offending message rather than a failed frame decode.

use bincode::Options;
use serde::{Deserialize, Serialize};

/// Maximum size of an encoded frame (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Maximum buffer size for deserialization.
/// Slightly larger than MAX_FRAME_SIZE to allow for envelope overhead.
pub const MAX_DECODE_SIZE: u64 = (MAX_FRAME_SIZE as u64) + 4096;

/// Returns bincode options with size limits enforced.
/// SECURITY: Always use this for deserialization to prevent OOM attacks.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DECODE_SIZE)
        .with_fixint_encoding()
}

/// Encode a frame for the wire.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(frame)
}

/// Decode a frame with size bounds enforced.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// Everything a transport session carries.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Frame {
    Control(ControlMessage),
    Data(Vec<u8>),
}

/// The five overlay-control messages.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControlMessage {
    Identify(IdentifyPayload),
    PeerList(PeerListPayload),
    SignalRequest(SignalRequestPayload),
    Signal(SignalPayload),
    Disconnecting(DisconnectingPayload),
}

impl ControlMessage {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Identify(_) => "identify",
            ControlMessage::PeerList(_) => "peer_list",
            ControlMessage::SignalRequest(_) => "signal_request",
            ControlMessage::Signal(_) => "signal",
            ControlMessage::Disconnecting(_) => "disconnecting",
        }
    }
}

/// First message on every fresh session.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentifyPayload {
    /// Rendered identity (base64, 32 bytes decoded).
    pub identity: String,
    /// Version in `agent/protocol/client` form.
    pub version: String,
    /// The sender's listening port, if it accepts direct dials.
    pub port: Option<u16>,
    /// Optional human-readable name, bounded by the receiver's config.
    pub name: Option<String>,
    /// Whether the sender is a worker node.
    pub is_worker: bool,
}

/// One neighbour entry in a peer-list broadcast.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerListEntry {
    pub identity: String,
    pub name: Option<String>,
    pub address: Option<String>,
    pub port: Option<u16>,
}

/// Gossip of the sender's connected peers.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerListPayload {
    pub connected_peers: Vec<PeerListEntry>,
}

/// Ask the destination (the pair's initiator) to open an assisted session
/// back to the source. Relayed at most one hop by a broker.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignalRequestPayload {
    pub source: String,
    pub destination: String,
}

/// A boxed signalling payload in flight between the two ends of an assisted
/// session, relayed at most one hop by a broker.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignalPayload {
    pub source: String,
    pub destination: String,
    pub nonce: Vec<u8>,
    /// Boxed ciphertext over the transport's JSON-encoded signalling
    /// structure.
    pub signal: Vec<u8>,
}

/// Why a peer is being asked to disconnect.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum DisconnectReason {
    ShuttingDown,
    Congested,
    BadHandshake,
    Unknown,
}

/// Request that the destination not reconnect until a timestamp.
///
/// `destination: None` means the message applies to whoever receives it on
/// the delivering connection (used before the remote is identified).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DisconnectingPayload {
    pub source: String,
    pub destination: Option<String>,
    pub reason: DisconnectReason,
    /// Absolute timestamp, ms since epoch.
    pub disconnect_until_ms: u64,
}
