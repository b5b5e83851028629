//! The hybrid classical + post-quantum handshake driver.
//!
//! Bootstraps a [`Session`] from an initiator's on-chain handshake event
//! and a responder's handshake-response event. The wallet-signature
//! binding proof is modeled as a pluggable [`Signer`]/[`Verifier`] pair
//! rather than hard-wiring a wallet library.

pub mod pq;

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::{Signature, Signer as Ed25519Signer, SigningKey, Verifier as Ed25519Verifier, VerifyingKey};
use sha3::{Digest, Keccak256};
use tokio::sync::RwLock;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::config::HANDSHAKE_ACK_PLAINTEXT;
use crate::crypto::kdf::{derive_ack_key, kdf_rk};
use crate::crypto::ratchet::{secretbox_decrypt, secretbox_seal};
use crate::crypto::session::Session;
use crate::error::{CoreError, Result};

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("clock after epoch").as_millis() as u64
}

/// Binds an identity to handshake material. Wallet and signing
/// workflows are an embedder concern; the crate only needs something
/// that can sign and verify a fixed byte string.
pub trait Signer: Send + Sync {
    fn sign(&self, message: &[u8]) -> Vec<u8>;
}

pub trait Verifier: Send + Sync {
    fn verify(&self, message: &[u8], signature: &[u8]) -> bool;
}

/// Reference `Signer`/`Verifier` pair backed by a plain Ed25519
/// keypair, for tests and embedders that don't yet have a wallet
/// integration.
pub struct Ed25519Identity {
    pub signing_key: SigningKey,
}

impl Ed25519Identity {
    pub fn generate() -> Self {
        Self { signing_key: SigningKey::generate(&mut rand::rngs::OsRng) }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

impl Signer for Ed25519Identity {
    fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }
}

impl Verifier for VerifyingKey {
    fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(sig_bytes): std::result::Result<[u8; 64], _> = signature.try_into() else {
            return false;
        };
        Ed25519Verifier::verify(self, message, &Signature::from_bytes(&sig_bytes)).is_ok()
    }
}

/// The initiator's on-chain handshake event.
#[derive(Debug, Clone)]
pub struct HandshakeEvent {
    pub initiator_address: String,
    pub recipient_address: String,
    pub identity_public: VerifyingKey,
    pub ephemeral_x25519: PublicKey,
    pub kem_public: Option<pq::PqPublicKeyBytes>,
    /// Wallet signature over `(identity_pk ‖ x25519_pk ‖ address)`.
    pub binding_proof: Vec<u8>,
}

impl HandshakeEvent {
    /// `topic1 = keccak256("contact:" ‖ lowercase(recipientAddress))`.
    pub fn contact_topic(recipient_address: &str) -> [u8; 32] {
        let mut hasher = Keccak256::new();
        hasher.update(b"contact:");
        hasher.update(recipient_address.to_lowercase().as_bytes());
        hasher.finalize().into()
    }

    /// Identifies this handshake for the response's `inResponseTo`
    /// topic; also used as the key for the initiator's pending-handshake
    /// table.
    pub fn handshake_hash(&self) -> [u8; 32] {
        let mut hasher = Keccak256::new();
        hasher.update(self.initiator_address.as_bytes());
        hasher.update(self.identity_public.as_bytes());
        hasher.update(self.ephemeral_x25519.as_bytes());
        if let Some(ref kem_pk) = self.kem_public {
            hasher.update(kem_pk);
        }
        hasher.finalize().into()
    }

    fn binding_message(&self) -> Vec<u8> {
        let mut message = Vec::with_capacity(32 + 32 + self.initiator_address.len());
        message.extend_from_slice(self.identity_public.as_bytes());
        message.extend_from_slice(self.ephemeral_x25519.as_bytes());
        message.extend_from_slice(self.initiator_address.as_bytes());
        message
    }

    pub fn verify_binding(&self, verifier: &dyn Verifier) -> bool {
        verifier.verify(&self.binding_message(), &self.binding_proof)
    }
}

/// The responder's on-chain handshake-response event.
#[derive(Debug, Clone)]
pub struct HandshakeResponseEvent {
    pub in_response_to: [u8; 32],
    pub responder_ephemeral: PublicKey,
    /// ML-KEM ciphertext encapsulated against the initiator's KEM
    /// public key, empty when the handshake wasn't hybrid.
    pub kem_ciphertext: PqCiphertext,
    /// `secretbox_seal(derive_ack_key(shared_secret), HANDSHAKE_ACK_PLAINTEXT)`.
    /// The initiator tries every pending handshake's key material against
    /// this field; only the candidate whose derived shared secret opens it
    /// is accepted as the real match.
    pub ack_ciphertext: Vec<u8>,
}

pub type PqCiphertext = Vec<u8>;

struct PendingHandshake {
    ephemeral_secret: StaticSecret,
    kem_secret: Option<pq::PqSecretKeyBytes>,
    contact_address: String,
    created_at: u64,
}

/// The pending set is expected to stay small (well under 100 entries
/// in practice). No internal timers — matches the crate's synchronous,
/// I/O-free core; the embedder calls `prune_expired` on its own
/// schedule.
pub struct HandshakeDriver {
    pending: RwLock<HashMap<[u8; 32], PendingHandshake>>,
}

impl Default for HandshakeDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl HandshakeDriver {
    pub fn new() -> Self {
        Self { pending: RwLock::new(HashMap::new()) }
    }

    /// Initiator side: generate ephemeral X25519 (and, for a hybrid
    /// handshake, ML-KEM-768) keys, sign the binding proof, and
    /// register the pending handshake so a later response can be
    /// matched against it.
    pub async fn initiate(
        &self,
        initiator_address: String,
        recipient_address: String,
        identity: &Ed25519Identity,
        hybrid: bool,
    ) -> HandshakeEvent {
        let ephemeral_secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral_secret);

        let (kem_secret, kem_public) = if hybrid {
            let (sk, pk) = pq::generate_keypair();
            (Some(sk), Some(pk))
        } else {
            (None, None)
        };

        let mut event = HandshakeEvent {
            initiator_address: initiator_address.clone(),
            recipient_address,
            identity_public: identity.verifying_key(),
            ephemeral_x25519: ephemeral_public,
            kem_public,
            binding_proof: Vec::new(),
        };
        event.binding_proof = identity.sign(&event.binding_message());

        let handshake_hash = event.handshake_hash();
        self.pending.write().await.insert(
            handshake_hash,
            PendingHandshake {
                ephemeral_secret,
                kem_secret,
                contact_address: event.initiator_address.clone(),
                created_at: now_ms(),
            },
        );

        event
    }

    /// Responder side: accept a verified handshake, derive the session,
    /// and produce the handshake-response event to publish.
    pub fn accept(
        &self,
        handshake: &HandshakeEvent,
        verifier: &dyn Verifier,
        my_address: String,
    ) -> Result<(Session, HandshakeResponseEvent)> {
        if !handshake.verify_binding(verifier) {
            return Err(CoreError::InvalidHandshake("binding proof failed verification".into()));
        }

        let responder_secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let responder_public = PublicKey::from(&responder_secret);
        let dh_out = responder_secret.diffie_hellman(&handshake.ephemeral_x25519).to_bytes();

        let (shared_secret, kem_ciphertext) = match &handshake.kem_public {
            Some(kem_pk) => {
                let (ciphertext, pq_shared) = pq::encapsulate(kem_pk)?;
                // Hybrid mixing: an extra KDF_RK step folding the PQ
                // shared secret into the classical DH output.
                let (mixed, _discard) = kdf_rk(&dh_out, &pq_shared);
                (mixed, ciphertext)
            }
            None => (dh_out, Vec::new()),
        };

        let conversation_id = crate::crypto::kdf::derive_conversation_id(
            &crate::crypto::kdf::derive_topic(
                &dh_out,
                crate::crypto::kdf::TopicDirection::Outbound,
                &handshake.handshake_hash(),
            ),
            &crate::crypto::kdf::derive_topic(
                &dh_out,
                crate::crypto::kdf::TopicDirection::Inbound,
                &handshake.handshake_hash(),
            ),
        );

        let session = Session::init_as_responder(
            conversation_id,
            my_address,
            handshake.initiator_address.clone(),
            &shared_secret,
            &dh_out,
            responder_secret,
            handshake.ephemeral_x25519,
        );

        let ack_key = derive_ack_key(&shared_secret);
        let ack_ciphertext = secretbox_seal(&ack_key, HANDSHAKE_ACK_PLAINTEXT)?;

        let response = HandshakeResponseEvent {
            in_response_to: handshake.handshake_hash(),
            responder_ephemeral: responder_public,
            kem_ciphertext,
            ack_ciphertext,
        };

        Ok((session, response))
    }

    /// Initiator side: a handshake-response log is blind to recipient
    /// address, so it can't be looked up by a single key. Every pending
    /// handshake's `(eSK, kemSK)` is tried against `(rPK, kemCiphertext)`
    /// — an O(pending) scan — and a candidate is accepted only once its
    /// derived shared secret successfully opens `ack_ciphertext` via
    /// authenticated decryption. `response.in_response_to` is public,
    /// attacker-controlled data (it's a hash over on-chain fields from
    /// the original [`HandshakeEvent`]), so it is never used to pick the
    /// match by itself; an entry is only ever removed from `pending`
    /// after its candidate ack has verified, so a forged response can't
    /// be used to evict a real pending handshake.
    pub async fn try_match_response(
        &self,
        response: &HandshakeResponseEvent,
        my_address: String,
    ) -> Result<Option<Session>> {
        let mut pending = self.pending.write().await;

        let mut matched: Option<([u8; 32], [u8; 32], [u8; 32], String)> = None;
        for (handshake_hash, entry) in pending.iter() {
            let dh_out =
                entry.ephemeral_secret.diffie_hellman(&response.responder_ephemeral).to_bytes();

            let shared_secret = match (&entry.kem_secret, response.kem_ciphertext.is_empty()) {
                (Some(kem_sk), false) => {
                    // ML-KEM has implicit rejection: decapsulating with the
                    // wrong key never errors, it silently yields an
                    // unrelated shared secret. The ack check below is what
                    // actually distinguishes a real match from noise.
                    match pq::decapsulate(kem_sk, &response.kem_ciphertext) {
                        Ok(pq_shared) => kdf_rk(&dh_out, &pq_shared).0,
                        Err(_) => dh_out,
                    }
                }
                _ => dh_out,
            };

            let ack_key = derive_ack_key(&shared_secret);
            let opened = secretbox_decrypt(&ack_key, &response.ack_ciphertext);
            let is_match = matches!(opened, Ok(ref p) if p.as_slice() == HANDSHAKE_ACK_PLAINTEXT);

            // Every candidate is evaluated regardless of earlier matches,
            // so the loop's cost doesn't depend on where in `pending` the
            // real entry sits.
            if is_match && matched.is_none() {
                matched =
                    Some((*handshake_hash, dh_out, shared_secret, entry.contact_address.clone()));
            }
        }

        let Some((handshake_hash, dh_out, shared_secret, contact_address)) = matched else {
            return Ok(None);
        };
        pending.remove(&handshake_hash);
        drop(pending);

        let conversation_id = crate::crypto::kdf::derive_conversation_id(
            &crate::crypto::kdf::derive_topic(
                &dh_out,
                crate::crypto::kdf::TopicDirection::Outbound,
                &response.in_response_to,
            ),
            &crate::crypto::kdf::derive_topic(
                &dh_out,
                crate::crypto::kdf::TopicDirection::Inbound,
                &response.in_response_to,
            ),
        );

        let session = Session::init_as_initiator(
            conversation_id,
            my_address,
            contact_address,
            &shared_secret,
            &dh_out,
            response.responder_ephemeral,
        );

        Ok(Some(session))
    }

    /// Drops pending handshakes older than `max_age_ms`. The embedder
    /// calls this on a timer; the driver itself runs no internal tasks.
    pub async fn prune_expired(&self, max_age_ms: u64) {
        let now = now_ms();
        self.pending.write().await.retain(|_, p| now.saturating_sub(p.created_at) <= max_age_ms);
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn classical_only_handshake_matches_and_derives_compatible_sessions() {
        let driver = HandshakeDriver::new();
        let alice_identity = Ed25519Identity::generate();
        let bob_identity = Ed25519Identity::generate();

        let handshake = driver
            .initiate("alice".into(), "bob".into(), &alice_identity, false)
            .await;

        let (bob_session, response) = driver
            .accept(&handshake, &alice_identity.verifying_key(), "bob".into())
            .unwrap();

        let alice_session = driver
            .try_match_response(&response, "alice".into())
            .await
            .unwrap()
            .expect("response must match the pending handshake");

        assert_eq!(alice_session.conversation_id, bob_session.conversation_id);
        assert_eq!(driver.pending_count().await, 0);
        let _ = bob_identity;
    }

    #[tokio::test]
    async fn hybrid_handshake_matches_with_pq_mixing() {
        let driver = HandshakeDriver::new();
        let alice_identity = Ed25519Identity::generate();

        let handshake = driver
            .initiate("alice".into(), "bob".into(), &alice_identity, true)
            .await;
        assert!(handshake.kem_public.is_some());

        let (bob_session, response) = driver
            .accept(&handshake, &alice_identity.verifying_key(), "bob".into())
            .unwrap();
        assert!(!response.kem_ciphertext.is_empty());

        let alice_session = driver
            .try_match_response(&response, "alice".into())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(alice_session.conversation_id, bob_session.conversation_id);
    }

    #[tokio::test]
    async fn forged_binding_proof_is_rejected() {
        let driver = HandshakeDriver::new();
        let alice_identity = Ed25519Identity::generate();
        let mallory_identity = Ed25519Identity::generate();

        let mut handshake = driver
            .initiate("alice".into(), "bob".into(), &alice_identity, false)
            .await;
        handshake.binding_proof = mallory_identity.sign(b"forged");

        let err = driver
            .accept(&handshake, &alice_identity.verifying_key(), "bob".into())
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidHandshake(_)));
    }

    #[tokio::test]
    async fn unmatched_response_returns_none() {
        let driver = HandshakeDriver::new();
        let response = HandshakeResponseEvent {
            in_response_to: [99u8; 32],
            responder_ephemeral: PublicKey::from(&StaticSecret::random_from_rng(rand::rngs::OsRng)),
            kem_ciphertext: Vec::new(),
            ack_ciphertext: vec![0u8; 40],
        };
        let result = driver.try_match_response(&response, "alice".into()).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn forged_response_with_matching_hash_does_not_evict_the_real_pending_handshake() {
        let driver = HandshakeDriver::new();
        let alice_identity = Ed25519Identity::generate();

        let handshake = driver
            .initiate("alice".into(), "bob".into(), &alice_identity, false)
            .await;
        assert_eq!(driver.pending_count().await, 1);

        // `in_response_to` is just a hash of public, on-chain fields from
        // `handshake` — a forger can reproduce it without ever holding the
        // real responder's key material.
        let forged = HandshakeResponseEvent {
            in_response_to: handshake.handshake_hash(),
            responder_ephemeral: PublicKey::from(&StaticSecret::random_from_rng(rand::rngs::OsRng)),
            kem_ciphertext: Vec::new(),
            ack_ciphertext: vec![0xAA; 40],
        };

        let result = driver.try_match_response(&forged, "alice".into()).await.unwrap();
        assert!(result.is_none(), "forged ack must not be accepted as a match");
        assert_eq!(
            driver.pending_count().await,
            1,
            "the real pending handshake must survive a forged response"
        );

        // The genuine response still matches afterwards.
        let (bob_session, real_response) = driver
            .accept(&handshake, &alice_identity.verifying_key(), "bob".into())
            .unwrap();
        let alice_session = driver
            .try_match_response(&real_response, "alice".into())
            .await
            .unwrap()
            .expect("the genuine response must still match");
        assert_eq!(alice_session.conversation_id, bob_session.conversation_id);
        assert_eq!(driver.pending_count().await, 0);
    }

    #[tokio::test]
    async fn prune_expired_drops_old_pending_handshakes() {
        let driver = HandshakeDriver::new();
        let alice_identity = Ed25519Identity::generate();
        driver.initiate("alice".into(), "bob".into(), &alice_identity, false).await;
        assert_eq!(driver.pending_count().await, 1);

        driver.prune_expired(0).await;
        assert_eq!(driver.pending_count().await, 0);
    }
}
