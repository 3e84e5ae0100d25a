//! Dispatch tier: consumes the logic topic, stamps message ids, expands
//! GROUP/ROOM packets into one copy per member and publishes the results on
//! the dispatch topic.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use crate::codec;
use crate::config::DispatchConfig;
use crate::error::{ConfigError, DispatchError, TransportError};
use crate::membership::MembershipStore;
use crate::monitor::GatewayMonitor;
use crate::packet::{MessageType, Packet};
use crate::queue::{publish_with_retry, QueueTransport, RetryPolicy, Subscription, GROUP_LOGIC_IM, TOPIC_DISPATCH, TOPIC_LOGIC};
use crate::snowflake::IdWorker;

pub struct Dispatcher {
    ids: IdWorker,
    queue: Arc<dyn QueueTransport>,
    membership: Arc<dyn MembershipStore>,
    monitor: Arc<GatewayMonitor>,
    retry: RetryPolicy,
    workers: usize,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Dispatcher {
    pub fn new(
        config: &DispatchConfig,
        queue: Arc<dyn QueueTransport>,
        membership: Arc<dyn MembershipStore>,
        monitor: Arc<GatewayMonitor>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            ids: IdWorker::new(config.worker_id)?,
            queue,
            membership,
            monitor,
            retry: RetryPolicy::default(),
            workers: config.workers.max(1),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn worker_id(&self) -> i64 {
        self.ids.worker_id()
    }

    /// Subscribes the worker pool to the logic topic. Workers share one
    /// consumer group, so each packet is resolved exactly once.
    pub async fn start(self: &Arc<Self>) -> Result<(), TransportError> {
        for worker in 0..self.workers {
            let subscription = self.queue.subscribe(TOPIC_LOGIC, GROUP_LOGIC_IM).await?;
            self.tasks.spawn(dispatch_worker(Arc::clone(self), worker, subscription));
        }
        info!("Dispatcher started {} workers (snowflake worker id {})", self.workers, self.worker_id());
        Ok(())
    }

    /// Stops the workers after their in-flight packet.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        info!("Dispatcher stopped");
    }

    /// Turns one logic packet into the stamped packets to publish.
    pub async fn resolve(&self, packet: &Packet) -> Result<Vec<Packet>, DispatchError> {
        match packet.message_type()? {
            MessageType::P2p => {
                let mut stamped = packet.clone();
                stamped.mid = self.ids.next_id();
                Ok(vec![stamped])
            }
            MessageType::Group | MessageType::Room => {
                let members = self.members(packet.rid).await?;
                if members.is_empty() {
                    warn!(id = packet.rid, sid = packet.sid, "no members to fan out to");
                }
                Ok(members
                    .into_iter()
                    .filter(|member| *member != packet.sid)
                    .map(|member| Packet {
                        ver: packet.ver,
                        mt: packet.mt,
                        mid: self.ids.next_id(),
                        sid: packet.rid,
                        rid: member,
                        ext: packet.ext.clone(),
                        pl: packet.pl.clone(),
                    })
                    .collect())
            }
            other => Err(DispatchError::NotRoutable(other)),
        }
    }

    /// Resolves and publishes one packet. Returns how many copies made it
    /// onto the dispatch topic; a failed copy does not stop the others.
    pub async fn handle(&self, packet: Packet) -> usize {
        let targets = match self.resolve(&packet).await {
            Ok(targets) => targets,
            Err(e) => {
                match e {
                    DispatchError::Membership { .. } => self.monitor.transport_errors.fetch_add(1, Ordering::Relaxed),
                    _ => self.monitor.protocol_errors.fetch_add(1, Ordering::Relaxed),
                };
                warn!(sid = packet.sid, rid = packet.rid, error = %e, "dropping logic packet");
                return 0;
            }
        };

        let results = join_all(targets.iter().map(|target| {
            publish_with_retry(self.queue.as_ref(), TOPIC_DISPATCH, codec::serialize(target), &self.retry)
        }))
        .await;

        let mut published = 0;
        for (target, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => {
                    published += 1;
                    self.monitor.dispatched.fetch_add(1, Ordering::Relaxed);
                    trace!(mid = target.mid, sid = target.sid, rid = target.rid, "dispatched");
                }
                Err(e) => {
                    self.monitor.fanout_failures.fetch_add(1, Ordering::Relaxed);
                    self.monitor.transport_errors.fetch_add(1, Ordering::Relaxed);
                    error!(mid = target.mid, rid = target.rid, error = %e, "failed to publish dispatched packet");
                }
            }
        }
        published
    }

    async fn members(&self, id: i64) -> Result<Vec<i64>, DispatchError> {
        let mut attempt = 0;
        loop {
            match self.membership.get_members(id).await {
                Ok(members) => return Ok(members),
                Err(source) => {
                    attempt += 1;
                    if matches!(source, TransportError::Closed) || attempt >= self.retry.attempts.max(1) {
                        return Err(DispatchError::Membership { id, source });
                    }
                    let delay = self.retry.delay_for(attempt);
                    warn!(id, attempt, error = %source, "membership lookup failed; retrying in {:?}", delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

async fn dispatch_worker(dispatcher: Arc<Dispatcher>, worker: usize, subscription: Subscription) {
    loop {
        let bytes = tokio::select! {
            biased;
            _ = dispatcher.shutdown.cancelled() => break,
            next = subscription.recv() => match next {
                Some(bytes) => bytes,
                None => break,
            },
        };
        match codec::deserialize(&bytes) {
            Ok(packet) => {
                dispatcher.handle(packet).await;
            }
            Err(e) => {
                dispatcher.monitor.protocol_errors.fetch_add(1, Ordering::Relaxed);
                warn!(worker, error = %e, "undecodable packet on logic topic");
            }
        }
    }
    debug!(worker, "dispatch worker stopped");
}
