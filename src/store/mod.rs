//! Session and pending-record persistence traits, plus in-memory and
//! JSON-file-backed reference implementations.
//!
//! The crate defines these traits so an embedder can back them with a
//! real database; it ships the in-memory versions, built on
//! `tokio::sync::RwLock<HashMap<...>>`, for tests and single-process
//! use, plus a JSON-file-backed pair for embedders that want durability
//! across restarts without standing up a database.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::crypto::session::{Session, TopicMatch};
use crate::error::{CoreError, Result};

/// Two-phase-commit status of an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingStatus {
    Preparing,
    Submitted,
    Failed,
}

/// A pending outbound record. `session_state_after` is committed to the
/// session store *before* this record transitions to `Submitted` — see
/// [`crate::manager::PendingManager`].
#[derive(Clone, Serialize, Deserialize)]
pub struct PendingRecord {
    pub id: String,
    pub conversation_id: [u8; 32],
    pub topic: [u8; 32],
    pub payload_hex: String,
    pub plaintext: Vec<u8>,
    pub session_state_before: Session,
    pub session_state_after: Session,
    pub created_at: u64,
    pub tx_hash: Option<String>,
    pub status: PendingStatus,
}

/// Keyed by `conversation_id`; must support lookup by the three inbound
/// topic slots.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, conversation_id: &[u8; 32]) -> Result<Option<Session>>;
    async fn save(&self, session: Session) -> Result<()>;
    async fn find_by_inbound_topic(
        &self,
        topic: &[u8; 32],
    ) -> Result<Option<(Session, TopicMatch)>>;
    async fn delete(&self, conversation_id: &[u8; 32]) -> Result<()>;
}

/// Keyed by `id`; secondary indexes on `conversation_id` and `tx_hash`.
#[async_trait]
pub trait PendingStore: Send + Sync {
    async fn save(&self, record: PendingRecord) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<PendingRecord>>;
    async fn update_status(
        &self,
        id: &str,
        status: PendingStatus,
        tx_hash: Option<String>,
    ) -> Result<()>;
    async fn find_by_tx_hash(&self, tx_hash: &str) -> Result<Option<PendingRecord>>;
    async fn find_by_conversation_id(&self, conversation_id: &[u8; 32]) -> Result<Vec<PendingRecord>>;
    async fn delete(&self, id: &str) -> Result<()>;
}

#[derive(Default)]
struct SessionIndexes {
    current_inbound: HashMap<[u8; 32], [u8; 32]>,
    next_inbound: HashMap<[u8; 32], [u8; 32]>,
    previous_inbound: HashMap<[u8; 32], [u8; 32]>,
}

/// Process-scoped, RAM-only session store. Good for tests and
/// single-process embedders; anything that needs durability across
/// restarts backs [`SessionStore`] with its own engine.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<[u8; 32], Session>>,
    indexes: RwLock<SessionIndexes>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn reindex(&self, session: &Session) {
        let mut indexes = self.indexes.write().await;
        indexes.current_inbound.insert(session.topics.current_inbound, session.conversation_id);
        if let Some(next) = session.topics.next_inbound {
            indexes.next_inbound.insert(next, session.conversation_id);
        }
        if let Some(prev) = session.topics.previous_inbound {
            indexes.previous_inbound.insert(prev, session.conversation_id);
        }
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, conversation_id: &[u8; 32]) -> Result<Option<Session>> {
        Ok(self.sessions.read().await.get(conversation_id).cloned())
    }

    async fn save(&self, session: Session) -> Result<()> {
        self.reindex(&session).await;
        self.sessions.write().await.insert(session.conversation_id, session);
        Ok(())
    }

    async fn find_by_inbound_topic(
        &self,
        topic: &[u8; 32],
    ) -> Result<Option<(Session, TopicMatch)>> {
        let indexes = self.indexes.read().await;
        let hit = indexes
            .current_inbound
            .get(topic)
            .map(|id| (*id, TopicMatch::Current))
            .or_else(|| indexes.next_inbound.get(topic).map(|id| (*id, TopicMatch::Next)))
            .or_else(|| indexes.previous_inbound.get(topic).map(|id| (*id, TopicMatch::Previous)));

        let Some((conversation_id, slot)) = hit else {
            return Ok(None);
        };
        let sessions = self.sessions.read().await;
        let Some(session) = sessions.get(&conversation_id) else {
            return Ok(None);
        };
        // The index may be stale by one promotion; re-check against the
        // live session state rather than trusting the index slot alone.
        match session.topics.match_inbound(topic) {
            Some(actual) => Ok(Some((session.clone(), actual))),
            None => {
                let _ = slot;
                Ok(None)
            }
        }
    }

    async fn delete(&self, conversation_id: &[u8; 32]) -> Result<()> {
        self.sessions.write().await.remove(conversation_id);
        let mut indexes = self.indexes.write().await;
        indexes.current_inbound.retain(|_, id| id != conversation_id);
        indexes.next_inbound.retain(|_, id| id != conversation_id);
        indexes.previous_inbound.retain(|_, id| id != conversation_id);
        Ok(())
    }
}

/// Process-scoped, RAM-only pending store.
#[derive(Default)]
pub struct InMemoryPendingStore {
    records: RwLock<HashMap<String, PendingRecord>>,
}

impl InMemoryPendingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PendingStore for InMemoryPendingStore {
    async fn save(&self, record: PendingRecord) -> Result<()> {
        self.records.write().await.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<PendingRecord>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn update_status(
        &self,
        id: &str,
        status: PendingStatus,
        tx_hash: Option<String>,
    ) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| CoreError::StoreUnavailable(format!("no pending record {id}")))?;
        record.status = status;
        if tx_hash.is_some() {
            record.tx_hash = tx_hash;
        }
        Ok(())
    }

    async fn find_by_tx_hash(&self, tx_hash: &str) -> Result<Option<PendingRecord>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .find(|r| r.tx_hash.as_deref() == Some(tx_hash))
            .cloned())
    }

    async fn find_by_conversation_id(&self, conversation_id: &[u8; 32]) -> Result<Vec<PendingRecord>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| &r.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.records.write().await.remove(id);
        Ok(())
    }
}

fn store_io_err(err: impl std::fmt::Display) -> CoreError {
    CoreError::StoreUnavailable(err.to_string())
}

/// JSON-file-backed session store: one file per conversation, named by
/// its hex-encoded conversation id. Keeps the same [`InMemorySessionStore`]
/// as a read cache and index, and write-through persists every `save`/
/// `delete` to disk, so `find_by_inbound_topic` stays O(1) without
/// re-reading the directory on every call.
pub struct JsonFileSessionStore {
    inner: InMemorySessionStore,
    dir: PathBuf,
}

impl JsonFileSessionStore {
    /// Opens (creating if necessary) a session store rooted at `dir`,
    /// loading every `*.json` file already there into the in-memory
    /// index.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await.map_err(store_io_err)?;

        let inner = InMemorySessionStore::new();
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(store_io_err)?;
        while let Some(entry) = entries.next_entry().await.map_err(store_io_err)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await.map_err(store_io_err)?;
            let session: Session = serde_json::from_slice(&bytes).map_err(store_io_err)?;
            inner.save(session).await?;
        }
        Ok(Self { inner, dir })
    }

    fn path_for(&self, conversation_id: &[u8; 32]) -> PathBuf {
        self.dir.join(format!("{}.json", hex::encode(conversation_id)))
    }
}

#[async_trait]
impl SessionStore for JsonFileSessionStore {
    async fn get(&self, conversation_id: &[u8; 32]) -> Result<Option<Session>> {
        self.inner.get(conversation_id).await
    }

    async fn save(&self, session: Session) -> Result<()> {
        let path = self.path_for(&session.conversation_id);
        let bytes = serde_json::to_vec_pretty(&session).map_err(store_io_err)?;
        tokio::fs::write(&path, bytes).await.map_err(store_io_err)?;
        self.inner.save(session).await
    }

    async fn find_by_inbound_topic(
        &self,
        topic: &[u8; 32],
    ) -> Result<Option<(Session, TopicMatch)>> {
        self.inner.find_by_inbound_topic(topic).await
    }

    async fn delete(&self, conversation_id: &[u8; 32]) -> Result<()> {
        let path = self.path_for(conversation_id);
        if path.exists() {
            tokio::fs::remove_file(&path).await.map_err(store_io_err)?;
        }
        self.inner.delete(conversation_id).await
    }
}

/// JSON-file-backed pending store, mirroring [`JsonFileSessionStore`]:
/// one file per pending record, named by its `id`.
pub struct JsonFilePendingStore {
    inner: InMemoryPendingStore,
    dir: PathBuf,
}

impl JsonFilePendingStore {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await.map_err(store_io_err)?;

        let inner = InMemoryPendingStore::new();
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(store_io_err)?;
        while let Some(entry) = entries.next_entry().await.map_err(store_io_err)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await.map_err(store_io_err)?;
            let record: PendingRecord = serde_json::from_slice(&bytes).map_err(store_io_err)?;
            inner.save(record).await?;
        }
        Ok(Self { inner, dir })
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    async fn flush(&self, id: &str) -> Result<()> {
        match self.inner.get(id).await? {
            Some(record) => {
                let bytes = serde_json::to_vec_pretty(&record).map_err(store_io_err)?;
                tokio::fs::write(self.path_for(id), bytes).await.map_err(store_io_err)
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PendingStore for JsonFilePendingStore {
    async fn save(&self, record: PendingRecord) -> Result<()> {
        let id = record.id.clone();
        self.inner.save(record).await?;
        self.flush(&id).await
    }

    async fn get(&self, id: &str) -> Result<Option<PendingRecord>> {
        self.inner.get(id).await
    }

    async fn update_status(
        &self,
        id: &str,
        status: PendingStatus,
        tx_hash: Option<String>,
    ) -> Result<()> {
        self.inner.update_status(id, status, tx_hash).await?;
        self.flush(id).await
    }

    async fn find_by_tx_hash(&self, tx_hash: &str) -> Result<Option<PendingRecord>> {
        self.inner.find_by_tx_hash(tx_hash).await
    }

    async fn find_by_conversation_id(&self, conversation_id: &[u8; 32]) -> Result<Vec<PendingRecord>> {
        self.inner.find_by_conversation_id(conversation_id).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.inner.delete(id).await?;
        let path = self.path_for(id);
        if path.exists() {
            tokio::fs::remove_file(&path).await.map_err(store_io_err)?;
        }
        Ok(())
    }
}

/// Convenience alias for the `Arc`-wrapped trait object embedders pass
/// around.
pub type SharedSessionStore = Arc<dyn SessionStore>;
pub type SharedPendingStore = Arc<dyn PendingStore>;
