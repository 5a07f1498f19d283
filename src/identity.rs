//! # Identity and Version Primitives
//!
//! This module defines the core identity types used throughout Weft:
//!
//! - [`Identity`]: 32-byte public key serving as a node's unique identifier
//! - [`Keypair`]: Ed25519 keypair backing the local identity
//! - [`AgentVersion`]: structured agent version with protocol compatibility
//!
//! ## Identity Model
//!
//! Weft uses a simple identity model: **Identity = Ed25519 Public Key**.
//! Identities travel on the wire rendered as URL-safe base64 without padding
//! (43 characters for 32 bytes). Equality is bytewise; the total order used
//! for tie-breaks is the lexicographic order of the rendered form.
//!
//! ## Tie-Breaks
//!
//! Several overlay decisions need exactly one of two nodes to act: opening
//! the assisted transport session for a pair, or choosing which of two
//! duplicate sessions survives. Both come down to the same predicate on the
//! rendered ordering:
//!
//! - [`can_initiate`]`(a, b)`: `a` opens the session for the pair `{a, b}`
//! - [`can_keep_duplicate`]`(owner, other)`: the connection owned (initiated)
//!   by `owner` survives
//!
//! For distinct identities exactly one of `can_initiate(a, b)` and
//! `can_initiate(b, a)` holds, so every unordered pair has a unique
//! initiator.

use std::cmp::Ordering;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;

/// Returns current time as milliseconds since Unix epoch.
/// Used for cooldown timestamps and disconnect windows.
#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ============================================================================
// Identity
// ============================================================================

/// Number of bytes in an identity.
pub const IDENTITY_LEN: usize = 32;

/// Length of the rendered (base64) identity prefix used in display names.
const SHORT_IDENTITY_LEN: usize = 7;

/// Error type for identity parsing failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityError {
    /// The string is not valid URL-safe base64.
    NotBase64,
    /// The decoded bytes are not exactly 32 bytes long.
    InvalidLength(usize),
}

impl fmt::Display for IdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityError::NotBase64 => write!(f, "identity is not URL-safe base64"),
            IdentityError::InvalidLength(n) => {
                write!(f, "identity decodes to {} bytes, expected {}", n, IDENTITY_LEN)
            }
        }
    }
}

impl std::error::Error for IdentityError {}

/// A node's 32-byte public identity.
///
/// Hash and equality are bytewise. `Ord` follows the rendered base64 form,
/// which is the order the tie-break predicates are defined over.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Identity([u8; IDENTITY_LEN]);

impl Identity {
    pub fn from_bytes(bytes: [u8; IDENTITY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; IDENTITY_LEN] {
        &self.0
    }

    /// Parse an identity from its rendered form. This doubles as the
    /// syntactic validity check for identities received off the wire.
    pub fn parse(s: &str) -> Result<Self, IdentityError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(s.as_bytes())
            .map_err(|_| IdentityError::NotBase64)?;
        let arr: [u8; IDENTITY_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| IdentityError::InvalidLength(bytes.len()))?;
        Ok(Self(arr))
    }

    /// Render as URL-safe base64 without padding (43 characters).
    pub fn to_base64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    /// Short prefix of the rendered form, for diagnostics.
    pub fn short(&self) -> String {
        let mut s = self.to_base64();
        s.truncate(SHORT_IDENTITY_LEN);
        s
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({}..)", self.short())
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl PartialOrd for Identity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Identity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_base64().cmp(&other.to_base64())
    }
}

/// True iff `s` parses as a well-formed identity.
pub fn is_valid_identity(s: &str) -> bool {
    Identity::parse(s).is_ok()
}

/// Returns true iff `a` is the designated initiator for the pair `{a, b}`.
///
/// The initiator is the side whose rendered identity sorts first. For
/// distinct identities exactly one direction of this predicate holds.
pub fn can_initiate(a: &Identity, b: &Identity) -> bool {
    a < b
}

/// Duplicate-connection arbitration: returns true iff the connection owned
/// (initiated) by `owner` is the one to keep against `other`.
///
/// Consistent with [`can_initiate`]: the surviving connection is always the
/// one opened by the pair's designated initiator.
pub fn can_keep_duplicate(owner: &Identity, other: &Identity) -> bool {
    owner < other
}

// ============================================================================
// Keypair
// ============================================================================

/// Ed25519 keypair backing the local node's identity.
///
/// The overlay core never signs; the keypair exists so the node has a real
/// identity source and so the boxing primitive has key material to work
/// against.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn identity(&self) -> Identity {
        Identity::from_bytes(self.signing_key.verifying_key().to_bytes())
    }
}

// ============================================================================
// Agent Version
// ============================================================================

/// Structured agent version: `{agent}/{protocol}/{client}` on the wire.
///
/// Two versions are *compatible* iff their `protocol` fields are equal; the
/// `agent` and `client` components are informational.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentVersion {
    pub agent: String,
    pub protocol: u32,
    pub client: String,
}

/// Error type for version string parsing failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionError {
    pub raw: String,
}

impl fmt::Display for VersionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed version string {:?}", self.raw)
    }
}

impl std::error::Error for VersionError {}

impl AgentVersion {
    pub fn new(agent: impl Into<String>, protocol: u32, client: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            protocol,
            client: client.into(),
        }
    }

    /// Parse the wire form `agent/protocol/client`.
    pub fn parse(s: &str) -> Result<Self, VersionError> {
        let mut parts = s.splitn(3, '/');
        let (agent, protocol, client) = match (parts.next(), parts.next(), parts.next()) {
            (Some(a), Some(p), Some(c)) if !a.is_empty() && !c.is_empty() => (a, p, c),
            _ => return Err(VersionError { raw: s.to_string() }),
        };
        let protocol: u32 = protocol
            .parse()
            .map_err(|_| VersionError { raw: s.to_string() })?;
        Ok(Self::new(agent, protocol, client))
    }

    pub fn render(&self) -> String {
        format!("{}/{}/{}", self.agent, self.protocol, self.client)
    }

    pub fn is_compatible(&self, other: &AgentVersion) -> bool {
        self.protocol == other.protocol
    }
}

impl fmt::Display for AgentVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}
