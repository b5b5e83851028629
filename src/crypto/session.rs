//! The Double Ratchet session: identity, cryptographic state, and
//! topic-rotation state for one conversation.
//!
//! Sessions are values — `ratchet_encrypt`/`ratchet_decrypt` (see
//! [`crate::crypto::ratchet`]) take a session by value (or clone) and
//! return a new one. The mutable store lives outside this module,
//! matching the "session = value" discipline of the design notes.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::crypto::kdf::{derive_topic, kdf_rk, TopicDirection};

/// Current wire/storage schema revision. Read with `#[serde(default)]`
/// so older persisted sessions still load; never consulted by crypto
/// logic.
pub const SESSION_SCHEMA_VERSION: u8 = 1;

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is after the epoch")
        .as_millis() as u64
}

/// A single skipped message key, keyed by the DH public key it was
/// skipped under and its chain position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedKey {
    pub dh: [u8; 32],
    pub n: u32,
    pub message_key: [u8; 32],
    pub created_at: u64,
}

/// Bounded store of skipped message keys for out-of-order delivery.
///
/// Ages out entries past `max_age_ms` and evicts the oldest entry
/// (by `created_at`, i.e. insertion order — insertion is monotonic
/// with the wall clock) once `max_count` is exceeded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkippedKeyStore {
    entries: VecDeque<SkippedKey>,
}

impl SkippedKeyStore {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, dh: [u8; 32], n: u32, message_key: [u8; 32], max_count: usize) {
        self.entries.push_back(SkippedKey { dh, n, message_key, created_at: now_ms() });
        while self.entries.len() > max_count {
            self.entries.pop_front();
        }
    }

    /// Remove and return the message key matching `(dh, n)`, if present.
    pub fn take(&mut self, dh: &[u8; 32], n: u32) -> Option<[u8; 32]> {
        let pos = self.entries.iter().position(|e| &e.dh == dh && e.n == n)?;
        Some(self.entries.remove(pos).unwrap().message_key)
    }

    /// Drop entries older than `max_age_ms`. Idempotent; callers may run
    /// this inline on every decrypt or on a timer.
    pub fn prune_expired(&mut self, max_age_ms: u64) {
        let now = now_ms();
        self.entries.retain(|e| now.saturating_sub(e.created_at) <= max_age_ms);
    }
}

/// Topic-rotation state for one direction pair, plus the grace-period
/// slot for the previous inbound topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicState {
    pub current_outbound: [u8; 32],
    pub current_inbound: [u8; 32],
    pub next_outbound: Option<[u8; 32]>,
    pub next_inbound: Option<[u8; 32]>,
    pub previous_inbound: Option<[u8; 32]>,
    pub previous_expiry: Option<u64>,
    pub epoch: u64,
}

/// The match slot an inbound topic resolved against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicMatch {
    Current,
    Next,
    Previous,
}

impl TopicState {
    /// Resolve an inbound topic against current/next/previous, honoring
    /// the previous slot's grace-period expiry.
    pub fn match_inbound(&self, topic: &[u8; 32]) -> Option<TopicMatch> {
        if &self.current_inbound == topic {
            return Some(TopicMatch::Current);
        }
        if self.next_inbound.as_ref() == Some(topic) {
            return Some(TopicMatch::Next);
        }
        if let (Some(prev), Some(expiry)) = (&self.previous_inbound, self.previous_expiry) {
            if prev == topic && now_ms() <= expiry {
                return Some(TopicMatch::Previous);
            }
        }
        None
    }

    /// Archive current → previous (with grace expiry), promote next →
    /// current, clear next, bump the epoch. Called by the session
    /// manager before a `Next`-matched decrypt.
    pub fn promote(&mut self, grace_window_ms: u64) {
        self.previous_inbound = Some(self.current_inbound);
        self.previous_expiry = Some(now_ms() + grace_window_ms);
        if let Some(next_in) = self.next_inbound.take() {
            self.current_inbound = next_in;
        }
        if let Some(next_out) = self.next_outbound.take() {
            self.current_outbound = next_out;
        }
        self.epoch += 1;
    }
}

/// A bidirectional Double Ratchet conversation between two chain
/// addresses.
#[derive(Clone, Serialize, Deserialize)]
pub struct Session {
    #[serde(default = "default_schema_version")]
    pub schema_version: u8,

    /// Immutable after creation.
    pub conversation_id: [u8; 32],
    pub my_address: String,
    pub contact_address: String,

    pub root_key: [u8; 32],

    #[serde(with = "secret_serde")]
    pub dh_my_secret: StaticSecret,
    #[serde(with = "public_serde")]
    pub dh_my_public: PublicKey,
    #[serde(with = "public_serde")]
    pub dh_their_public: PublicKey,

    pub sending_chain_key: Option<[u8; 32]>,
    pub receiving_chain_key: Option<[u8; 32]>,
    pub sending_msg_number: u32,
    pub receiving_msg_number: u32,
    pub previous_chain_length: u32,

    pub skipped_keys: SkippedKeyStore,

    pub topics: TopicState,

    pub created_at: u64,
    pub updated_at: u64,
    /// Debugging label only — not consulted by crypto logic. Distinct
    /// from `topics.epoch`, which is the load-bearing, monotonic counter.
    pub epoch: Option<u64>,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.root_key.zeroize();
        if let Some(ref mut ck) = self.sending_chain_key {
            ck.zeroize();
        }
        if let Some(ref mut ck) = self.receiving_chain_key {
            ck.zeroize();
        }
    }
}

fn default_schema_version() -> u8 {
    SESSION_SCHEMA_VERSION
}

impl Session {
    /// Builds the responder's epoch-0 session. The responder reuses its
    /// handshake-response ephemeral as the first DH ratchet key.
    ///
    /// `shared_secret` is the (possibly hybrid-mixed) initial shared
    /// secret; `initial_dh_out` is the plain X25519 ephemeral-ephemeral
    /// DH output both sides compute identically, used only to derive the
    /// handshake-bootstrap topics.
    pub fn init_as_responder(
        conversation_id: [u8; 32],
        my_address: String,
        contact_address: String,
        shared_secret: &[u8; 32],
        initial_dh_out: &[u8; 32],
        responder_ephemeral_secret: StaticSecret,
        initiator_ephemeral_public: PublicKey,
    ) -> Self {
        let (root_key, sending_chain_key) = kdf_rk(&[0u8; 32], shared_secret);
        let responder_ephemeral_public = PublicKey::from(&responder_ephemeral_secret);

        // The initiator is the "natural" side for the bootstrap DH value
        // (it drives epoch-1 precomputation); the responder reads the
        // same value with its direction labels swapped, same convention
        // used for every later DH ratchet step.
        let current_inbound =
            derive_topic(initial_dh_out, TopicDirection::Outbound, &conversation_id);
        let current_outbound =
            derive_topic(initial_dh_out, TopicDirection::Inbound, &conversation_id);

        let now = now_ms();
        Self {
            schema_version: SESSION_SCHEMA_VERSION,
            conversation_id,
            my_address,
            contact_address,
            root_key,
            dh_my_secret: responder_ephemeral_secret,
            dh_my_public: responder_ephemeral_public,
            dh_their_public: initiator_ephemeral_public,
            sending_chain_key: Some(sending_chain_key),
            receiving_chain_key: None,
            sending_msg_number: 0,
            receiving_msg_number: 0,
            previous_chain_length: 0,
            skipped_keys: SkippedKeyStore::default(),
            topics: TopicState {
                current_outbound,
                current_inbound,
                next_outbound: None,
                next_inbound: None,
                previous_inbound: None,
                previous_expiry: None,
                epoch: 0,
            },
            created_at: now,
            updated_at: now,
            epoch: Some(0),
        }
    }

    /// Builds the initiator's epoch-0 session, with epoch 1 pre-computed:
    /// the initiator generates a fresh DH pair immediately and its first
    /// outbound message carries that new public key.
    pub fn init_as_initiator(
        conversation_id: [u8; 32],
        my_address: String,
        contact_address: String,
        shared_secret: &[u8; 32],
        initial_dh_out: &[u8; 32],
        responder_ephemeral_public: PublicKey,
    ) -> Self {
        let (r0, bobs_sending_chain) = kdf_rk(&[0u8; 32], shared_secret);

        let my_new_secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let my_new_public = PublicKey::from(&my_new_secret);
        let dh_send = my_new_secret.diffie_hellman(&responder_ephemeral_public);
        let (root_key, sending_chain_key) = kdf_rk(&r0, dh_send.as_bytes());

        let next_outbound =
            derive_topic(dh_send.as_bytes(), TopicDirection::Outbound, &conversation_id);
        let next_inbound =
            derive_topic(dh_send.as_bytes(), TopicDirection::Inbound, &conversation_id);

        let current_outbound =
            derive_topic(initial_dh_out, TopicDirection::Outbound, &conversation_id);
        let current_inbound =
            derive_topic(initial_dh_out, TopicDirection::Inbound, &conversation_id);

        let now = now_ms();
        Self {
            schema_version: SESSION_SCHEMA_VERSION,
            conversation_id,
            my_address,
            contact_address,
            root_key,
            dh_my_secret: my_new_secret,
            dh_my_public: my_new_public,
            dh_their_public: responder_ephemeral_public,
            sending_chain_key: Some(sending_chain_key),
            receiving_chain_key: Some(bobs_sending_chain),
            sending_msg_number: 0,
            receiving_msg_number: 0,
            previous_chain_length: 0,
            skipped_keys: SkippedKeyStore::default(),
            topics: TopicState {
                current_outbound,
                current_inbound,
                next_outbound: Some(next_outbound),
                next_inbound: Some(next_inbound),
                previous_inbound: None,
                previous_expiry: None,
                epoch: 0,
            },
            created_at: now,
            updated_at: now,
            epoch: Some(0),
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = now_ms();
    }
}

mod secret_serde {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(secret: &StaticSecret, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(&secret.to_bytes())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<StaticSecret, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = Deserialize::deserialize(deserializer)?;
        let array: [u8; 32] =
            bytes.try_into().map_err(|_| serde::de::Error::custom("invalid secret key length"))?;
        Ok(StaticSecret::from(array))
    }
}

mod public_serde {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(public: &PublicKey, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(public.as_bytes())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<PublicKey, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = Deserialize::deserialize(deserializer)?;
        let array: [u8; 32] =
            bytes.try_into().map_err(|_| serde::de::Error::custom("invalid public key length"))?;
        Ok(PublicKey::from(array))
    }
}
