//! End-to-end encrypted messaging core for a peer-to-peer system that
//! uses a public append-only event log as its transport.
//!
//! This crate is the cryptographic engine only: a Double Ratchet
//! session with a topic-rotation ratchet layered on top for
//! network-layer unlinkability, a hybrid classical + post-quantum
//! handshake, and the two-phase commit that keeps ratchet state and
//! transport submission consistent under partial failure. The UI,
//! wallet/signing workflows, log-scanning/backfill, and chain/RPC
//! selection are all external collaborators — this crate only defines
//! the trait seams they plug into ([`handshake::Signer`]/
//! [`handshake::Verifier`], [`transport::LogTransport`],
//! [`store::SessionStore`]/[`store::PendingStore`]).

pub mod config;
pub mod crypto;
pub mod error;
pub mod handshake;
pub mod manager;
pub mod store;
pub mod transport;

pub use config::RatchetConfig;
pub use crypto::ratchet::{ratchet_decrypt, ratchet_encrypt, Encrypted};
pub use crypto::session::Session;
pub use error::{CoreError, Result};
pub use handshake::HandshakeDriver;
pub use manager::{ConversationLock, PendingManager, SessionManager};
