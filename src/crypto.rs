//! # Boxing Interface
//!
//! The overlay relays signalling payloads between peers that cannot yet talk
//! directly. Those payloads are confidential between the two endpoints, so
//! they travel *boxed*: encrypted and authenticated for the destination
//! identity. The cryptographic layer itself lives outside this crate; the
//! peer manager consumes it through [`MessageBox`].
//!
//! An implementation is expected to provide an authenticated public-key box
//! keyed by the two nodes' identities. Unboxing returns `None` on any
//! authentication or decryption failure; the caller treats that as a
//! network-level error on the connection that delivered the payload.

use crate::identity::Identity;

/// A boxed payload: ciphertext plus the nonce it was sealed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoxedPayload {
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

/// Authenticated boxing primitive consumed by the peer manager.
///
/// Implementations must be cheap to call from the manager's event loop; any
/// key agreement caching is their concern.
pub trait MessageBox: Send + Sync {
    /// Seal `plaintext` for `recipient`. Infallible by contract: an
    /// implementation that cannot seal for a well-formed identity is
    /// misconfigured, not unlucky.
    fn box_message(&self, plaintext: &[u8], recipient: &Identity) -> BoxedPayload;

    /// Open a payload sealed by `sender`. Returns `None` on any failure;
    /// callers never learn why, only that the payload did not authenticate.
    fn unbox_message(&self, ciphertext: &[u8], nonce: &[u8], sender: &Identity) -> Option<Vec<u8>>;
}
