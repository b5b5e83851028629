//! Ratchet KDF primitives: root step, chain step, X25519 DH, and topic
//! derivation.
//!
//! Root step and chain step follow the classic Double Ratchet
//! `kdf_root`/`kdf_chain` split, over HKDF-SHA256 / HMAC-SHA256 —
//! the wire format's test vectors are pinned to these exact
//! primitives, so they are not a style choice.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use sha3::{Digest, Keccak256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::config::{CHAIN_MESSAGE_CONST, CHAIN_NEXT_CONST, HANDSHAKE_ACK_INFO, KDF_RK_INFO};

type HmacSha256 = Hmac<Sha256>;

/// Root KDF step: `(rk, dh_out) -> (rk', ck)`.
///
/// `HKDF-SHA256(ikm=dh_out, salt=rk, info="VerbethRatchet", len=64)`,
/// split into two 32-byte halves.
pub fn kdf_rk(root_key: &[u8; 32], dh_out: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let hk = Hkdf::<Sha256>::new(Some(root_key), dh_out);
    let mut output = [0u8; 64];
    hk.expand(KDF_RK_INFO, &mut output)
        .expect("64 is a valid HKDF-SHA256 output length");
    let mut new_root = [0u8; 32];
    let mut chain_key = [0u8; 32];
    new_root.copy_from_slice(&output[..32]);
    chain_key.copy_from_slice(&output[32..]);
    (new_root, chain_key)
}

/// Chain KDF step: `ck -> (ck', mk)`.
///
/// `mk = HMAC-SHA256(ck, 0x01)`, `ck' = HMAC-SHA256(ck, 0x02)`. The
/// constants are fixed and must not be swapped.
pub fn kdf_ck(chain_key: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(chain_key)
        .expect("HMAC accepts a 32-byte key");
    mac.update(&[CHAIN_MESSAGE_CONST]);
    let message_key: [u8; 32] = mac.finalize().into_bytes().into();

    let mut mac = <HmacSha256 as Mac>::new_from_slice(chain_key)
        .expect("HMAC accepts a 32-byte key");
    mac.update(&[CHAIN_NEXT_CONST]);
    let next_chain_key: [u8; 32] = mac.finalize().into_bytes().into();

    (next_chain_key, message_key)
}

/// Derives the symmetric key used to seal/open the handshake
/// acknowledgment from a handshake shared secret. A single-purpose,
/// unsalted HKDF expand — the shared secret itself is never reused for
/// anything but this and `initSessionAs{Initiator,Responder}`.
pub fn derive_ack_key(shared_secret: &[u8; 32]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let mut key = [0u8; 32];
    hk.expand(HANDSHAKE_ACK_INFO, &mut key)
        .expect("32 is a valid HKDF-SHA256 output length");
    key
}

/// X25519 Diffie-Hellman.
pub fn dh(secret: &StaticSecret, public: &PublicKey) -> [u8; 32] {
    secret.diffie_hellman(public).to_bytes()
}

/// Direction label used in topic derivation; the sender's outbound
/// equals the receiver's inbound (labels swap at the receiver).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicDirection {
    Outbound,
    Inbound,
}

/// `deriveTopic(dh_out, direction, salt) = keccak256(HKDF(dh_out, salt,
/// "verbeth:topic-<direction>:v2", 32))`, where `salt` is the 32-byte
/// conversation id.
pub fn derive_topic(dh_out: &[u8; 32], direction: TopicDirection, salt: &[u8; 32]) -> [u8; 32] {
    let info = match direction {
        TopicDirection::Outbound => crate::config::TOPIC_OUTBOUND_INFO,
        TopicDirection::Inbound => crate::config::TOPIC_INBOUND_INFO,
    };
    let hk = Hkdf::<Sha256>::new(Some(salt), dh_out);
    let mut intermediate = [0u8; 32];
    hk.expand(info, &mut intermediate)
        .expect("32 is a valid HKDF-SHA256 output length");

    let mut hasher = Keccak256::new();
    hasher.update(intermediate);
    hasher.finalize().into()
}

/// `conversationId = H(sort(topicA, topicB).join(":"))`, using
/// Keccak-256 as the domain hash.
pub fn derive_conversation_id(topic_a: &[u8; 32], topic_b: &[u8; 32]) -> [u8; 32] {
    let (first, second) = if topic_a <= topic_b {
        (topic_a, topic_b)
    } else {
        (topic_b, topic_a)
    };
    let mut hasher = Keccak256::new();
    hasher.update(hex::encode(first).as_bytes());
    hasher.update(b":");
    hasher.update(hex::encode(second).as_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kdf_ck_is_deterministic_and_order_matters() {
        let ck = [7u8; 32];
        let (next, mk) = kdf_ck(&ck);
        let (next2, mk2) = kdf_ck(&ck);
        assert_eq!(next, next2);
        assert_eq!(mk, mk2);
        assert_ne!(next, mk, "message key and next chain key must differ");
    }

    #[test]
    fn kdf_rk_changes_with_dh_output() {
        let rk = [1u8; 32];
        let (rk1, ck1) = kdf_rk(&rk, &[2u8; 32]);
        let (rk2, ck2) = kdf_rk(&rk, &[3u8; 32]);
        assert_ne!(rk1, rk2);
        assert_ne!(ck1, ck2);
    }

    #[test]
    fn topic_derivation_is_symmetric_across_direction_labels() {
        let dh_out = [9u8; 32];
        let salt = [5u8; 32];
        let sender_outbound = derive_topic(&dh_out, TopicDirection::Outbound, &salt);
        let receiver_inbound = derive_topic(&dh_out, TopicDirection::Inbound, &salt);
        // Same dh_out/salt, swapped direction label at the receiver — the
        // sender's outbound topic must equal the receiver's inbound topic.
        // That equality is established by both sides agreeing on who's
        // "outbound" for a given dh_out, tested at the session level;
        // here we just confirm direction changes the derived value.
        assert_ne!(sender_outbound, receiver_inbound);
    }

    #[test]
    fn conversation_id_is_order_independent() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        assert_eq!(derive_conversation_id(&a, &b), derive_conversation_id(&b, &a));
    }
}
