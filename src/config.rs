//! Tunable caps for the ratchet, threaded through the session and
//! pending managers at construction time.

/// Fixed, non-configurable wire-format byte for the current ratchet
/// revision. Load-bearing: the codec rejects any other value.
pub const RATCHET_VERSION_V1: u8 = 0x01;

/// HKDF info string for the root KDF step. Test vectors depend on this
/// exact string — do not change.
pub const KDF_RK_INFO: &[u8] = b"VerbethRatchet";

/// HKDF info strings for topic derivation, one per direction.
pub const TOPIC_OUTBOUND_INFO: &[u8] = b"verbeth:topic-outbound:v2";
pub const TOPIC_INBOUND_INFO: &[u8] = b"verbeth:topic-inbound:v2";

/// HMAC chain-step domain constants. Fixed; do not swap the order.
pub const CHAIN_MESSAGE_CONST: u8 = 0x01;
pub const CHAIN_NEXT_CONST: u8 = 0x02;

/// HKDF info string for the handshake acknowledgment key, derived from
/// the (possibly hybrid-mixed) handshake shared secret.
pub const HANDSHAKE_ACK_INFO: &[u8] = b"verbeth:handshake-ack:v1";

/// Fixed acknowledgment plaintext the responder seals and the
/// initiator must recover to accept a handshake-response as a match.
pub const HANDSHAKE_ACK_PLAINTEXT: &[u8] = b"verbeth-handshake-ack";

/// Minimum valid wire payload length: 1 + 64 + 32 + 4 + 4.
pub const MIN_PAYLOAD_LEN: usize = 105;

#[derive(Debug, Clone, Copy)]
pub struct RatchetConfig {
    /// Max skip distance accepted within a single incoming message.
    pub max_skip_per_message: u32,
    /// Global cap on stored skipped-key entries (FIFO eviction by age).
    pub max_stored_skipped_keys: usize,
    /// Skipped keys older than this are pruned, in milliseconds.
    pub max_skipped_keys_age_ms: u64,
    /// Grace period during which a session's previous inbound topic
    /// still routes, in milliseconds.
    pub topic_transition_window_ms: u64,
}

impl Default for RatchetConfig {
    fn default() -> Self {
        Self {
            max_skip_per_message: 1000,
            max_stored_skipped_keys: 2000,
            max_skipped_keys_age_ms: 7 * 24 * 60 * 60 * 1000,
            topic_transition_window_ms: 5 * 60 * 1000,
        }
    }
}
