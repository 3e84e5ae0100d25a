//! Queue transport between tiers.
//!
//! Topics fan out to consumer groups: every group sees every message of its
//! topic, and inside one group each message goes to exactly one subscriber.
//! That is how a tier scales to a worker pool without two workers ever
//! handling the same packet.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, trace, warn};

use crate::config::DEFAULT_QUEUE_CAPACITY;
use crate::error::TransportError;

pub const TOPIC_LOGIC: &str = "message_topic_logic";
pub const TOPIC_DISPATCH: &str = "message_topic_dispatch";
pub const TOPIC_OFFLINE: &str = "message_topic_offline";

pub const GROUP_LOGIC_IM: &str = "message_channel_logic_im";
pub const GROUP_DISPATCH_STORE: &str = "message_channel_dispatch_store";
pub const GROUP_DISPATCH_PUSH: &str = "message_channel_dispatch_push";
pub const GROUP_OFFLINE_STORE: &str = "message_channel_offline_store";

/// Each comet instance reads the whole dispatch topic through its own group.
pub fn comet_group(instance_id: &str) -> String {
    format!("message_channel_dispatch_comet_{}", instance_id)
}

#[async_trait]
pub trait QueueTransport: Send + Sync {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError>;

    async fn subscribe(&self, topic: &str, group: &str) -> Result<Subscription, TransportError>;

    /// Detaches a consumer group; its subscribers observe end-of-stream.
    async fn unsubscribe(&self, topic: &str, group: &str) -> Result<(), TransportError>;
}

/// A consumer's handle on one (topic, group). Clones share the group's stream.
#[derive(Clone)]
pub struct Subscription {
    topic: String,
    group: String,
    rx: Arc<AsyncMutex<mpsc::Receiver<Bytes>>>,
}

impl Subscription {
    pub fn new(topic: &str, group: &str, rx: Arc<AsyncMutex<mpsc::Receiver<Bytes>>>) -> Self {
        Self {
            topic: topic.to_string(),
            group: group.to_string(),
            rx,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Next message for this group, or `None` once the group is detached.
    /// Cancel-safe: dropping the future never loses a message.
    pub async fn recv(&self) -> Option<Bytes> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }
}

struct GroupChannel {
    tx: mpsc::Sender<Bytes>,
    rx: Arc<AsyncMutex<mpsc::Receiver<Bytes>>>,
}

/// In-process queue with bounded per-group buffers. Publishing into a full
/// group waits for a consumer to make room.
pub struct MemoryQueue {
    topics: DashMap<String, HashMap<String, GroupChannel>>,
    capacity: usize,
    closed: AtomicBool,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Rejects further publishes and ends every subscription.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.topics.clear();
    }

    pub fn group_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|groups| groups.len()).unwrap_or(0)
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueTransport for MemoryQueue {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        // Snapshot the senders; never hold the map guard across an await.
        let senders: Vec<(String, mpsc::Sender<Bytes>)> = match self.topics.get(topic) {
            Some(groups) => groups
                .iter()
                .map(|(name, group)| (name.clone(), group.tx.clone()))
                .collect(),
            None => Vec::new(),
        };

        if senders.is_empty() {
            trace!(topic, "publish with no consumer groups; message dropped");
            return Ok(());
        }

        for (group, tx) in senders {
            if tx.send(payload.clone()).await.is_err() {
                debug!(topic, group = %group, "consumer group detached during publish");
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<Subscription, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let mut groups = self.topics.entry(topic.to_string()).or_default();
        let channel = groups.entry(group.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(self.capacity);
            GroupChannel {
                tx,
                rx: Arc::new(AsyncMutex::new(rx)),
            }
        });
        Ok(Subscription::new(topic, group, Arc::clone(&channel.rx)))
    }

    async fn unsubscribe(&self, topic: &str, group: &str) -> Result<(), TransportError> {
        if let Some(mut groups) = self.topics.get_mut(topic) {
            // Dropping the sender ends the stream once buffered messages are consumed.
            groups.remove(group);
        }
        Ok(())
    }
}

/// Exponential backoff with jitter for transport calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            base_delay: Duration::from_millis(25),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << attempt.min(16));
        let capped = exp.min(self.max_delay);
        let jitter = rand::thread_rng().gen_range(0..=capped.as_millis() as u64 / 4 + 1);
        capped + Duration::from_millis(jitter)
    }
}

/// Publishes, retrying with backoff. `Closed` is final and not retried.
pub async fn publish_with_retry(
    queue: &dyn QueueTransport,
    topic: &str,
    payload: Bytes,
    policy: &RetryPolicy,
) -> Result<(), TransportError> {
    let mut attempt = 0;
    loop {
        match queue.publish(topic, payload.clone()).await {
            Ok(()) => return Ok(()),
            Err(TransportError::Closed) => return Err(TransportError::Closed),
            Err(e) => {
                attempt += 1;
                if attempt >= policy.attempts.max(1) {
                    return Err(e);
                }
                let delay = policy.delay_for(attempt);
                warn!(topic, attempt, error = %e, "publish failed; retrying in {:?}", delay);
                tokio::time::sleep(delay).await;
            }
        }
    }
}
