//! Session-scoped signaling relay
//!
//! Maps each live session onto one topic of the realtime transport and
//! converts between typed envelopes and their JSON wire form. The channel
//! neither acknowledges nor retries: a failed publish is surfaced to the
//! caller, and receivers are expected to treat duplicates as no-ops.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use bytes::Bytes;

use crate::error::{Error, Result};

use super::envelope::SignalingEnvelope;
use super::transport::{MemoryRealtime, RealtimeTransport, DEFAULT_TOPIC_CAPACITY};

/// Signaling channel configuration
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// Prefix of every session topic (`<prefix>:<session_id>`)
    pub topic_prefix: String,

    /// Messages buffered per topic on an in-process bus before slow
    /// subscribers start skipping
    pub bus_capacity: usize,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            topic_prefix: "live".into(),
            bus_capacity: DEFAULT_TOPIC_CAPACITY,
        }
    }
}

impl SignalingConfig {
    /// Set the topic prefix
    pub fn topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.topic_prefix = prefix.into();
        self
    }

    /// Set the per-topic buffer of an in-process bus
    pub fn bus_capacity(mut self, capacity: usize) -> Self {
        self.bus_capacity = capacity.max(1);
        self
    }
}

/// Relay for connection-setup envelopes between one broadcaster and its viewers
#[derive(Clone)]
pub struct SignalingChannel {
    transport: Arc<dyn RealtimeTransport>,
    config: SignalingConfig,
}

impl SignalingChannel {
    pub fn new(transport: Arc<dyn RealtimeTransport>) -> Self {
        Self::with_config(transport, SignalingConfig::default())
    }

    pub fn with_config(transport: Arc<dyn RealtimeTransport>, config: SignalingConfig) -> Self {
        Self { transport, config }
    }

    /// Channel over a private [`MemoryRealtime`] sized by `bus_capacity`
    pub fn in_memory(config: SignalingConfig) -> Self {
        let bus = MemoryRealtime::with_capacity(config.bus_capacity);
        Self::with_config(Arc::new(bus), config)
    }

    /// Topic name for a session
    pub fn topic(&self, session_id: &str) -> String {
        format!("{}:{}", self.config.topic_prefix, session_id)
    }

    /// Send an envelope to all current subscribers of the session
    pub async fn publish(&self, session_id: &str, envelope: &SignalingEnvelope) -> Result<()> {
        let message = envelope.encode()?;

        tracing::debug!(
            session = session_id,
            kind = %envelope.kind(),
            from = %envelope.from_id,
            to = ?envelope.to_id,
            "Publishing envelope"
        );

        self.transport
            .publish(&self.topic(session_id), message)
            .await
            .map_err(|e| match e {
                Error::SignalingDeliveryFailure(_) => e,
                other => Error::SignalingDeliveryFailure(other.to_string()),
            })
    }

    /// Subscribe to the session's envelopes
    ///
    /// Envelopes are queued on the returned subscription until the owner
    /// reads them. Dropping the subscription unsubscribes.
    pub async fn subscribe(&self, session_id: &str) -> Result<Subscription> {
        let rx = self
            .transport
            .subscribe(&self.topic(session_id))
            .await
            .map_err(|e| match e {
                Error::SignalingDeliveryFailure(_) => e,
                other => Error::SignalingDeliveryFailure(other.to_string()),
            })?;

        Ok(Subscription {
            session_id: session_id.to_string(),
            rx,
        })
    }

    /// Subscribe with a callback invoked once per delivered envelope
    ///
    /// The handler runs on a dedicated task until the returned handle is
    /// unsubscribed or dropped.
    pub async fn subscribe_with<F>(&self, session_id: &str, mut handler: F) -> Result<SubscriptionHandle>
    where
        F: FnMut(SignalingEnvelope) + Send + 'static,
    {
        let mut subscription = self.subscribe(session_id).await?;
        let task = tokio::spawn(async move {
            while let Some(envelope) = subscription.recv().await {
                handler(envelope);
            }
        });
        Ok(SubscriptionHandle { task })
    }
}

/// Queue of decoded envelopes for one session
pub struct Subscription {
    session_id: String,
    rx: broadcast::Receiver<Bytes>,
}

impl Subscription {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Wait for the next envelope
    ///
    /// Malformed messages and envelopes stamped with another session are
    /// skipped. Returns `None` once the transport closes the topic.
    pub async fn recv(&mut self) -> Option<SignalingEnvelope> {
        loop {
            match self.rx.recv().await {
                Ok(message) => match SignalingEnvelope::decode(&message) {
                    Ok(envelope) if envelope.session_id == self.session_id => return Some(envelope),
                    Ok(envelope) => {
                        tracing::debug!(
                            session = %self.session_id,
                            other = %envelope.session_id,
                            "Skipping envelope for another session"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(session = %self.session_id, error = %e, "Dropping malformed envelope");
                    }
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(session = %self.session_id, skipped, "Signaling subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Stop receiving envelopes
    pub fn unsubscribe(self) {}
}

/// Handle to a callback subscription
pub struct SubscriptionHandle {
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    /// Stop invoking the handler
    pub fn unsubscribe(self) {
        self.task.abort();
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::signaling::envelope::{JoinPayload, Signal};

    fn join(session: &str, viewer: &str) -> SignalingEnvelope {
        SignalingEnvelope::viewer_join(
            session,
            viewer,
            JoinPayload {
                instance: "i".into(),
                epoch: 1,
            },
        )
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let channel = SignalingChannel::new(Arc::new(MemoryRealtime::new()));
        let mut a = channel.subscribe("s1").await.unwrap();
        let mut b = channel.subscribe("s1").await.unwrap();

        channel.publish("s1", &join("s1", "v1")).await.unwrap();

        assert_eq!(a.recv().await.unwrap().from_id, "v1");
        assert_eq!(b.recv().await.unwrap().from_id, "v1");
    }

    #[tokio::test]
    async fn test_malformed_and_foreign_messages_skipped() {
        let bus = Arc::new(MemoryRealtime::new());
        let channel = SignalingChannel::new(bus.clone());
        let mut sub = channel.subscribe("s1").await.unwrap();

        bus.publish("live:s1", Bytes::from_static(b"not json")).await.unwrap();
        bus.publish("live:s1", join("s2", "stray").encode().unwrap())
            .await
            .unwrap();
        channel.publish("s1", &join("s1", "v1")).await.unwrap();

        let env = sub.recv().await.unwrap();
        assert_eq!(env.from_id, "v1");
        assert!(matches!(env.signal, Signal::ViewerJoin(_)));
    }

    #[test]
    fn test_config_builder() {
        let config = SignalingConfig::default()
            .topic_prefix("studio")
            .bus_capacity(0);
        assert_eq!(config.topic_prefix, "studio");
        assert_eq!(config.bus_capacity, 1);
        assert_eq!(SignalingConfig::default().bus_capacity, DEFAULT_TOPIC_CAPACITY);
    }

    #[tokio::test]
    async fn test_bus_capacity_bounds_backlog() {
        let channel = SignalingChannel::in_memory(
            SignalingConfig::default()
                .topic_prefix("studio")
                .bus_capacity(2),
        );
        assert_eq!(channel.topic("s1"), "studio:s1");
        let mut sub = channel.subscribe("s1").await.unwrap();

        for i in 0..5 {
            channel.publish("s1", &join("s1", &format!("v{}", i))).await.unwrap();
        }

        // Only the newest two survive a full buffer
        assert_eq!(sub.recv().await.unwrap().from_id, "v3");
        assert_eq!(sub.recv().await.unwrap().from_id, "v4");
    }

    #[tokio::test]
    async fn test_delivery_failure_surfaced() {
        let bus = Arc::new(MemoryRealtime::new());
        let channel = SignalingChannel::new(bus.clone());
        bus.set_offline(true);

        let result = channel.publish("s1", &join("s1", "v1")).await;
        assert!(matches!(result, Err(Error::SignalingDeliveryFailure(_))));
    }

    #[tokio::test]
    async fn test_callback_subscription_unsubscribe() {
        let channel = SignalingChannel::new(Arc::new(MemoryRealtime::new()));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let handle = channel
            .subscribe_with("s1", move |env| sink.lock().push(env.from_id))
            .await
            .unwrap();

        channel.publish("s1", &join("s1", "v1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*seen.lock(), vec!["v1".to_string()]);

        handle.unsubscribe();
        tokio::task::yield_now().await;
        channel.publish("s1", &join("s1", "v2")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.lock().len(), 1);
    }
}
