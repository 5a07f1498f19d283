//! # Error Types
//!
//! Failure classification for the overlay core:
//!
//! - [`MeshError::Network`]: transport-level I/O trouble
//! - [`MeshError::Protocol`]: the remote violated the overlay protocol
//! - [`MeshError::Policy`]: a local policy refused the operation
//!
//! A fourth class, invariant violations inside the crate itself, never
//! appears as a value: those are assertions and surface as panics (the state
//! machine transition table is the main site).
//!
//! Every per-connection failure transitions that connection to
//! `Disconnected` and surfaces upward through the connection's closure; no
//! failure tears down a whole peer unless all of its connections have
//! closed.

use std::fmt;

/// A protocol violation by the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// The frame could not be decoded.
    MalformedFrame(String),
    /// A message arrived that is not valid in the connection's state.
    UnexpectedMessage(&'static str),
    /// The identity string in a payload is not well-formed.
    InvalidIdentity(String),
    /// The version string could not be parsed.
    MalformedVersion(String),
    /// The remote speaks an incompatible protocol version.
    IncompatibleVersion { ours: u32, theirs: u32 },
    /// The advertised name exceeds the configured maximum.
    NameTooLong(usize),
    /// The boxed signalling payload failed to open or parse.
    BadSignal(&'static str),
}

impl fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolViolation::MalformedFrame(detail) => {
                write!(f, "malformed frame: {}", detail)
            }
            ProtocolViolation::UnexpectedMessage(what) => {
                write!(f, "unexpected message: {}", what)
            }
            ProtocolViolation::InvalidIdentity(raw) => {
                write!(f, "invalid identity {:?}", raw)
            }
            ProtocolViolation::MalformedVersion(raw) => {
                write!(f, "malformed version {:?}", raw)
            }
            ProtocolViolation::IncompatibleVersion { ours, theirs } => {
                write!(f, "incompatible protocol version {} (ours: {})", theirs, ours)
            }
            ProtocolViolation::NameTooLong(len) => {
                write!(f, "peer name of {} chars exceeds the limit", len)
            }
            ProtocolViolation::BadSignal(detail) => {
                write!(f, "bad signalling payload: {}", detail)
            }
        }
    }
}

/// A local policy refusing an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyViolation {
    /// Too many peers hold connections; new sessions are refused.
    Congested,
    /// The remote presented our own identity.
    SelfConnection,
    /// A requested-disconnect window is still in effect.
    DisconnectWindow { until_ms: u64 },
}

impl fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyViolation::Congested => write!(f, "congested: connection limit reached"),
            PolicyViolation::SelfConnection => write!(f, "connection from our own identity"),
            PolicyViolation::DisconnectWindow { until_ms } => {
                write!(f, "disconnect requested until {}", until_ms)
            }
        }
    }
}

/// Top-level error for overlay operations and connection closures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshError {
    Network(String),
    Protocol(ProtocolViolation),
    Policy(PolicyViolation),
}

impl fmt::Display for MeshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeshError::Network(detail) => write!(f, "network error: {}", detail),
            MeshError::Protocol(v) => write!(f, "protocol error: {}", v),
            MeshError::Policy(v) => write!(f, "policy error: {}", v),
        }
    }
}

impl std::error::Error for MeshError {}

impl From<ProtocolViolation> for MeshError {
    fn from(v: ProtocolViolation) -> Self {
        MeshError::Protocol(v)
    }
}

impl From<PolicyViolation> for MeshError {
    fn from(v: PolicyViolation) -> Self {
        MeshError::Policy(v)
    }
}
