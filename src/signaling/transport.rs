//! Realtime publish/subscribe substrate
//!
//! The signaling channel sits on top of an externally provided topic bus. The
//! only guarantees assumed are at-least-once delivery to current subscribers
//! and no ordering across different sender/target pairs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::error::{Error, Result};

/// Default number of buffered messages per topic
pub const DEFAULT_TOPIC_CAPACITY: usize = 1024;

/// Topic-based publish/subscribe facility
#[async_trait]
pub trait RealtimeTransport: Send + Sync + 'static {
    /// Publish a message to every current subscriber of `topic`
    async fn publish(&self, topic: &str, message: Bytes) -> Result<()>;

    /// Subscribe to messages published on `topic` after this call
    async fn subscribe(&self, topic: &str) -> Result<broadcast::Receiver<Bytes>>;
}

/// In-process topic bus
///
/// Topics are created by their first subscriber and forgotten once the last
/// one leaves. Publishing to a topic with no subscribers succeeds and the
/// message is dropped, matching a real broker.
/// Two switches allow tests to degrade the bus: `set_offline` makes every
/// call fail and `set_duplicate_delivery` delivers each message twice.
pub struct MemoryRealtime {
    topics: RwLock<HashMap<String, broadcast::Sender<Bytes>>>,
    capacity: usize,
    offline: AtomicBool,
    duplicate: AtomicBool,
}

impl MemoryRealtime {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            offline: AtomicBool::new(false),
            duplicate: AtomicBool::new(false),
        }
    }

    /// Simulate the bus being unreachable
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }

    /// Deliver every message twice
    pub fn set_duplicate_delivery(&self, duplicate: bool) {
        self.duplicate.store(duplicate, Ordering::Relaxed);
    }

    /// Number of subscribers currently attached to `topic`
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Number of topics with at least one subscriber at their last use
    pub fn topic_count(&self) -> usize {
        self.topics.read().len()
    }

    /// Sender of a topic that still has subscribers
    ///
    /// A topic found without receivers is removed.
    fn live_sender(&self, topic: &str) -> Option<broadcast::Sender<Bytes>> {
        let tx = self.topics.read().get(topic).cloned()?;
        if tx.receiver_count() > 0 {
            return Some(tx);
        }
        let mut topics = self.topics.write();
        if topics.get(topic).is_some_and(|tx| tx.receiver_count() == 0) {
            topics.remove(topic);
        }
        None
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::Relaxed) {
            Err(Error::SignalingDeliveryFailure(
                "realtime transport unreachable".into(),
            ))
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryRealtime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RealtimeTransport for MemoryRealtime {
    async fn publish(&self, topic: &str, message: Bytes) -> Result<()> {
        self.check_online()?;

        let Some(tx) = self.live_sender(topic) else {
            return Ok(());
        };
        if self.duplicate.load(Ordering::Relaxed) {
            let _ = tx.send(message.clone());
        }
        // Err only means nobody is listening
        let _ = tx.send(message);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<broadcast::Receiver<Bytes>> {
        self.check_online()?;

        let mut topics = self.topics.write();
        topics.retain(|_, tx| tx.receiver_count() > 0);
        let tx = topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        Ok(tx.subscribe())
    }
}
