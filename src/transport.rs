//! The event families the core consumes from the log, and the trait
//! the embedder's log-scanner/submitter implements to hand events in
//! and take payloads out.

use async_trait::async_trait;

use crate::error::Result;
use crate::handshake::{HandshakeEvent, HandshakeResponseEvent};

/// `MessageSent` event data: the binary wire payload plus the
/// chain-level framing the core needs for ordering and replay defense.
#[derive(Debug, Clone)]
pub struct MessageSentEvent {
    pub sender_address: String,
    pub topic: [u8; 32],
    pub payload: Vec<u8>,
    /// Replay-protection monotonic counter, per sender/topic.
    pub nonce: u64,
    pub block_number: u64,
    pub log_index: u32,
    pub block_timestamp: u64,
}

impl MessageSentEvent {
    /// Ties are broken by (blockNumber, logIndex).
    pub fn ordering_key(&self) -> (u64, u32) {
        (self.block_number, self.log_index)
    }
}

/// The embedder implements this to submit payloads to the chain; the
/// crate defines only the trait and an in-memory fake for its own
/// tests. Log-scanning, backfill, and RPC selection are an embedder
/// concern.
#[async_trait]
pub trait LogTransport: Send + Sync {
    async fn submit_message(&self, topic: [u8; 32], payload: Vec<u8>) -> Result<String>;
    async fn submit_handshake(&self, event: HandshakeEvent) -> Result<String>;
    async fn submit_handshake_response(&self, event: HandshakeResponseEvent) -> Result<String>;
}

/// In-memory fake transport for tests: "submission" just appends to a
/// log the test can inspect, and always succeeds with a synthetic
/// `tx_hash`.
#[derive(Default)]
pub struct FakeLogTransport {
    pub sent_messages: tokio::sync::Mutex<Vec<(String, [u8; 32], Vec<u8>)>>,
    pub sent_handshakes: tokio::sync::Mutex<Vec<(String, HandshakeEvent)>>,
    pub sent_responses: tokio::sync::Mutex<Vec<(String, HandshakeResponseEvent)>>,
    next_tx: std::sync::atomic::AtomicU64,
}

impl FakeLogTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_tx_hash(&self) -> String {
        let n = self.next_tx.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        format!("0xfake{n:016x}")
    }
}

#[async_trait]
impl LogTransport for FakeLogTransport {
    async fn submit_message(&self, topic: [u8; 32], payload: Vec<u8>) -> Result<String> {
        let tx_hash = self.next_tx_hash();
        self.sent_messages.lock().await.push((tx_hash.clone(), topic, payload));
        Ok(tx_hash)
    }

    async fn submit_handshake(&self, event: HandshakeEvent) -> Result<String> {
        let tx_hash = self.next_tx_hash();
        self.sent_handshakes.lock().await.push((tx_hash.clone(), event));
        Ok(tx_hash)
    }

    async fn submit_handshake_response(&self, event: HandshakeResponseEvent) -> Result<String> {
        let tx_hash = self.next_tx_hash();
        self.sent_responses.lock().await.push((tx_hash.clone(), event));
        Ok(tx_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_transport_records_submissions_and_returns_distinct_hashes() {
        let transport = FakeLogTransport::new();
        let h1 = transport.submit_message([1u8; 32], vec![1, 2, 3]).await.unwrap();
        let h2 = transport.submit_message([2u8; 32], vec![4, 5, 6]).await.unwrap();
        assert_ne!(h1, h2);
        assert_eq!(transport.sent_messages.lock().await.len(), 2);
    }
}
