//! Session manager (cache + topic-indexed lookup + promotion) and
//! pending manager (two-phase commit around send).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::RatchetConfig;
use crate::crypto::ratchet::{ratchet_encrypt, Encrypted};
use crate::crypto::session::{Session, TopicMatch};
use crate::error::{CoreError, Result};
use crate::store::{PendingRecord, PendingStatus, PendingStore, SessionStore};

/// Per-conversation lock, held across the read-modify-commit window so
/// concurrent sends/receives on the same conversation can't race on the
/// same ratchet slot.
#[derive(Default)]
pub struct ConversationLock {
    locks: RwLock<HashMap<[u8; 32], Arc<Mutex<()>>>>,
}

impl ConversationLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire (creating if necessary) the mutex for `conversation_id`.
    /// Callers hold the returned guard across fetch -> encrypt/decrypt
    /// -> save.
    pub async fn acquire(&self, conversation_id: [u8; 32]) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.read().await.get(&conversation_id) {
            return lock.clone();
        }
        let mut locks = self.locks.write().await;
        locks
            .entry(conversation_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Memoized read-through cache over a [`SessionStore`], with
/// topic-indexed lookup and automatic promotion on a `next` match.
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    cache: RwLock<HashMap<[u8; 32], Session>>,
    config: RatchetConfig,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, config: RatchetConfig) -> Self {
        Self { store, cache: RwLock::new(HashMap::new()), config }
    }

    pub async fn get_by_conversation_id(&self, id: &[u8; 32]) -> Result<Option<Session>> {
        if let Some(session) = self.cache.read().await.get(id) {
            return Ok(Some(session.clone()));
        }
        let fetched = self.store.get(id).await?;
        if let Some(ref session) = fetched {
            self.cache.write().await.insert(*id, session.clone());
        }
        Ok(fetched)
    }

    /// Resolves an inbound topic against current/next/previous.
    /// On a `next` match, applies the promotion transform and writes
    /// the result back to both cache and store before returning it.
    pub async fn get_by_inbound_topic(
        &self,
        topic: &[u8; 32],
    ) -> Result<Option<(Session, TopicMatch)>> {
        // The cache is authoritative within a processing tick, so check
        // it first by scanning for a live topic match before falling
        // back to the store's index.
        {
            let cache = self.cache.read().await;
            for session in cache.values() {
                if let Some(slot) = session.topics.match_inbound(topic) {
                    if slot != TopicMatch::Next {
                        return Ok(Some((session.clone(), slot)));
                    }
                }
            }
        }

        let Some((session, slot)) = self.store.find_by_inbound_topic(topic).await? else {
            return Ok(None);
        };

        if slot != TopicMatch::Next {
            self.cache.write().await.insert(session.conversation_id, session.clone());
            return Ok(Some((session, slot)));
        }

        let mut promoted = session.clone();
        promoted.topics.promote(self.config.topic_transition_window_ms);
        promoted.touch();
        info!(
            conversation_id = hex::encode(promoted.conversation_id),
            epoch = promoted.topics.epoch,
            "promoted next topic to current"
        );
        self.save(promoted.clone()).await?;
        Ok(Some((promoted, TopicMatch::Next)))
    }

    /// Cache + store write, synchronous with respect to later reads
    /// (the store write happens before this returns).
    pub async fn save(&self, session: Session) -> Result<()> {
        self.cache.write().await.insert(session.conversation_id, session.clone());
        self.store.save(session).await
    }

    pub async fn invalidate(&self, id: &[u8; 32]) {
        self.cache.write().await.remove(id);
    }

    pub async fn clear_cache(&self) {
        self.cache.write().await.clear();
    }
}

/// The five-step two-phase commit around an outbound message.
/// Implementations of the actual log submission are supplied by the
/// caller (see [`crate::transport::LogTransport`]); this manager only
/// enforces the commit ordering.
pub struct PendingManager {
    store: Arc<dyn PendingStore>,
}

impl PendingManager {
    pub fn new(store: Arc<dyn PendingStore>) -> Self {
        Self { store }
    }

    /// Encrypts, persists a `preparing` pending record, then commits the
    /// new session to the session store. After this returns, the ratchet
    /// slot is burned even if transport submission never happens.
    pub async fn prepare_and_commit(
        &self,
        sessions: &SessionManager,
        session: &Session,
        plaintext: &[u8],
        signing_key: &ed25519_dalek::SigningKey,
        id: String,
    ) -> Result<(PendingRecord, Encrypted)> {
        let encrypted = ratchet_encrypt(session, plaintext, signing_key)?;

        let record = PendingRecord {
            id,
            conversation_id: session.conversation_id,
            topic: encrypted.topic,
            payload_hex: hex::encode(&encrypted.ciphertext),
            plaintext: plaintext.to_vec(),
            session_state_before: session.clone(),
            session_state_after: encrypted.session.clone(),
            created_at: crate::crypto::session::now_ms(),
            tx_hash: None,
            status: PendingStatus::Preparing,
        };
        self.store.save(record.clone()).await?;

        // Commits the ratchet slot. Must happen before transport
        // submission: any crash after this point is recoverable by
        // marking the pending record failed, never by retrying under
        // the same message key.
        sessions.save(encrypted.session.clone()).await?;
        debug!(
            conversation_id = hex::encode(record.conversation_id),
            n = encrypted.session.sending_msg_number,
            "committed ratchet slot before transport submission"
        );

        Ok((record, encrypted))
    }

    /// Step 4 on transport success: `preparing -> submitted`.
    pub async fn mark_submitted(&self, id: &str, tx_hash: String) -> Result<()> {
        self.store.update_status(id, PendingStatus::Submitted, Some(tx_hash)).await
    }

    /// Step 4 on transport failure: `preparing -> failed`. The ratchet
    /// slot stays burned; the caller's next encrypt uses the next slot.
    pub async fn mark_failed(&self, id: &str) -> Result<()> {
        warn!(pending_id = id, "outbound send failed after ratchet commit");
        self.store.update_status(id, PendingStatus::Failed, None).await
    }

    /// Step 5: the log scanner observed the confirmation event. Deletes
    /// the pending record; does not touch ratchet state.
    pub async fn finalize(&self, tx_hash: &str) -> Result<()> {
        let Some(record) = self.store.find_by_tx_hash(tx_hash).await? else {
            return Err(CoreError::StoreUnavailable(format!(
                "no pending record for tx {tx_hash}"
            )));
        };
        self.store.delete(&record.id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryPendingStore, InMemorySessionStore};
    use ed25519_dalek::SigningKey;
    use x25519_dalek::{PublicKey, StaticSecret};

    fn sample_session() -> Session {
        let responder_secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let initiator_secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let responder_public = PublicKey::from(&responder_secret);
        let initiator_public = PublicKey::from(&initiator_secret);
        let dh_out = initiator_secret.diffie_hellman(&responder_public).to_bytes();
        Session::init_as_initiator(
            [3u8; 32],
            "alice".into(),
            "bob".into(),
            &dh_out,
            &dh_out,
            responder_public,
        )
    }

    #[tokio::test]
    async fn get_by_conversation_id_populates_cache_from_store() {
        let store = Arc::new(InMemorySessionStore::new());
        let manager = SessionManager::new(store.clone(), RatchetConfig::default());
        let session = sample_session();
        store.save(session.clone()).await.unwrap();

        let fetched = manager.get_by_conversation_id(&[3u8; 32]).await.unwrap();
        assert!(fetched.is_some());
    }

    #[tokio::test]
    async fn next_topic_match_promotes_and_persists() {
        let store = Arc::new(InMemorySessionStore::new());
        let manager = SessionManager::new(store.clone(), RatchetConfig::default());
        let session = sample_session();
        let next_inbound = session.topics.next_inbound.unwrap();
        store.save(session).await.unwrap();

        let (promoted, slot) = manager.get_by_inbound_topic(&next_inbound).await.unwrap().unwrap();
        assert_eq!(slot, TopicMatch::Next);
        assert_eq!(promoted.topics.current_inbound, next_inbound);
        assert_eq!(promoted.topics.epoch, 1);

        let reloaded = store.get(&[3u8; 32]).await.unwrap().unwrap();
        assert_eq!(reloaded.topics.epoch, 1);
    }

    #[tokio::test]
    async fn two_phase_commit_burns_the_slot_before_submission() {
        let session_store = Arc::new(InMemorySessionStore::new());
        let pending_store = Arc::new(InMemoryPendingStore::new());
        let sessions = SessionManager::new(session_store.clone(), RatchetConfig::default());
        let pending = PendingManager::new(pending_store.clone());

        let session = sample_session();
        sessions.save(session.clone()).await.unwrap();
        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);

        let (record, _encrypted) = pending
            .prepare_and_commit(&sessions, &session, b"hi", &signing_key, "p1".into())
            .await
            .unwrap();

        let committed = sessions.get_by_conversation_id(&[3u8; 32]).await.unwrap().unwrap();
        assert_eq!(committed.sending_msg_number, 1);
        assert_eq!(record.status, PendingStatus::Preparing);

        pending.mark_failed(&record.id).await.unwrap();
        let after = pending_store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(after.status, PendingStatus::Failed);
        // The slot is still burned: a retry must use the next slot, not
        // this one.
        let still_committed = sessions.get_by_conversation_id(&[3u8; 32]).await.unwrap().unwrap();
        assert_eq!(still_committed.sending_msg_number, 1);
    }
}
