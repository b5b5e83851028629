//! Error kinds returned by the crypto core.
//!
//! These are not exceptions for control flow: callers match on them to
//! decide whether to drop a message, retry a store operation, or surface
//! a send failure to the user. See the propagation policy in the crate
//! docs — crypto errors never mutate session state, store errors
//! propagate, send errors land in the pending record.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Payload too short or wrong version byte. Drop.
    #[error("invalid wire format")]
    InvalidFormat,

    /// Signature verification failed. Drop without ratchet state change.
    #[error("invalid signature")]
    InvalidSignature,

    /// No session matches the inbound topic.
    #[error("no session for topic")]
    UnknownSession,

    /// Skip count exceeds cap for a single message. Drop; do not mutate.
    #[error("too many skipped messages ({requested} > {max})")]
    TooManySkipped { requested: u64, max: u32 },

    /// AEAD tag mismatch after chain step. Drop; session unchanged.
    #[error("decryption failed")]
    DecryptFailure,

    /// Transient I/O from a store. Caller retries.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Transport refused or timed out submitting an outbound payload.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// A caller tried to encrypt before a sending chain exists
    /// (responder bootstrap state, before its first DH ratchet step).
    #[error("no sending chain key yet")]
    NoSendingChain,

    /// A caller tried to decrypt before a receiving chain exists.
    #[error("no receiving chain key yet")]
    NoReceivingChain,

    /// Malformed handshake or key-agreement material.
    #[error("invalid handshake material: {0}")]
    InvalidHandshake(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
