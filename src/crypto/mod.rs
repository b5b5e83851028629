pub mod auth;
pub mod codec;
pub mod kdf;
pub mod ratchet;
pub mod session;
