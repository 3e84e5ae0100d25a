//! Push tier: notices dispatched packets whose recipient is offline.
//!
//! Offline recipients get a notification and, when an inbox is configured,
//! the packet is parked until their next successful AUTH.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::codec;
use crate::config::PushConfig;
use crate::error::TransportError;
use crate::monitor::GatewayMonitor;
use crate::packet::Packet;
use crate::presence::{user_online_key, PresenceStore};
use crate::queue::{QueueTransport, Subscription, GROUP_DISPATCH_PUSH, TOPIC_DISPATCH};

#[async_trait]
pub trait OfflineNotifier: Send + Sync {
    async fn notify(&self, recipient: i64, packet: &Packet) -> Result<(), TransportError>;
}

/// Writes notifications to the log instead of a push provider.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl OfflineNotifier for LogNotifier {
    async fn notify(&self, recipient: i64, packet: &Packet) -> Result<(), TransportError> {
        info!(recipient, sid = packet.sid, mid = packet.mid, mt = packet.mt, "offline notification");
        Ok(())
    }
}

/// Per-uid holding area for packets that found their recipient offline.
#[async_trait]
pub trait OfflineInbox: Send + Sync {
    async fn push(&self, uid: i64, packet: Packet) -> Result<(), TransportError>;

    /// Removes and returns everything parked for `uid`, oldest first.
    async fn drain(&self, uid: i64) -> Result<Vec<Packet>, TransportError>;
}

pub struct MemoryInbox {
    queues: DashMap<i64, VecDeque<Packet>>,
    capacity: usize,
}

impl MemoryInbox {
    /// Keeps at most `capacity` packets per uid, dropping the oldest.
    pub fn new(capacity: usize) -> Self {
        Self {
            queues: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn pending(&self, uid: i64) -> usize {
        self.queues.get(&uid).map(|q| q.len()).unwrap_or(0)
    }
}

#[async_trait]
impl OfflineInbox for MemoryInbox {
    async fn push(&self, uid: i64, packet: Packet) -> Result<(), TransportError> {
        let mut queue = self.queues.entry(uid).or_default();
        if queue.len() >= self.capacity {
            queue.pop_front();
            debug!(uid, "offline inbox full; dropped oldest packet");
        }
        queue.push_back(packet);
        Ok(())
    }

    async fn drain(&self, uid: i64) -> Result<Vec<Packet>, TransportError> {
        Ok(self
            .queues
            .remove(&uid)
            .map(|(_, queue)| queue.into_iter().collect())
            .unwrap_or_default())
    }
}

pub struct PushService {
    workers: usize,
    queue: Arc<dyn QueueTransport>,
    presence: Arc<dyn PresenceStore>,
    notifier: Arc<dyn OfflineNotifier>,
    inbox: Option<Arc<dyn OfflineInbox>>,
    monitor: Arc<GatewayMonitor>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl PushService {
    pub fn new(
        config: &PushConfig,
        queue: Arc<dyn QueueTransport>,
        presence: Arc<dyn PresenceStore>,
        notifier: Arc<dyn OfflineNotifier>,
        inbox: Option<Arc<dyn OfflineInbox>>,
        monitor: Arc<GatewayMonitor>,
    ) -> Self {
        Self {
            workers: config.workers.max(1),
            queue,
            presence,
            notifier,
            inbox,
            monitor,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub async fn start(self: &Arc<Self>) -> Result<(), TransportError> {
        for worker in 0..self.workers {
            let subscription = self.queue.subscribe(TOPIC_DISPATCH, GROUP_DISPATCH_PUSH).await?;
            self.tasks.spawn(push_worker(Arc::clone(self), worker, subscription));
        }
        info!("Push service started {} workers", self.workers);
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        info!("Push service stopped");
    }

    /// Returns true when the recipient was offline and got notified.
    pub async fn handle(&self, packet: Packet) -> bool {
        let rid = packet.rid;
        match self.presence.get(&user_online_key(rid)).await {
            Ok(Some(_)) => {
                trace!(rid, mid = packet.mid, "recipient online; no push");
                return false;
            }
            Ok(None) => {}
            Err(e) => {
                self.monitor.transport_errors.fetch_add(1, Ordering::Relaxed);
                warn!(rid, error = %e, "presence lookup failed; treating recipient as offline");
            }
        }

        if let Some(inbox) = &self.inbox {
            if let Err(e) = inbox.push(rid, packet.clone()).await {
                self.monitor.transport_errors.fetch_add(1, Ordering::Relaxed);
                warn!(rid, error = %e, "failed to park packet in offline inbox");
            }
        }

        match self.notifier.notify(rid, &packet).await {
            Ok(()) => {
                self.monitor.offline_notified.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.monitor.transport_errors.fetch_add(1, Ordering::Relaxed);
                warn!(rid, mid = packet.mid, error = %e, "offline notification failed");
                false
            }
        }
    }
}

async fn push_worker(service: Arc<PushService>, worker: usize, subscription: Subscription) {
    loop {
        let bytes = tokio::select! {
            biased;
            _ = service.shutdown.cancelled() => break,
            next = subscription.recv() => match next {
                Some(bytes) => bytes,
                None => break,
            },
        };
        match codec::deserialize(&bytes) {
            Ok(packet) => {
                service.handle(packet).await;
            }
            Err(e) => {
                service.monitor.protocol_errors.fetch_add(1, Ordering::Relaxed);
                warn!(worker, error = %e, "undecodable packet reached push");
            }
        }
    }
    debug!(worker, "push worker stopped");
}
