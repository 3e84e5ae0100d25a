//! Comet tier: terminates client TCP connections.
//!
//! Inbound P2P/GROUP/ROOM packets are published to the logic topic; packets
//! arriving on the dispatch topic are handed to whichever local connection
//! owns their `rid`.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use crate::auth::CredentialValidator;
use crate::codec;
use crate::config::CometConfig;
use crate::connection::Connection;
use crate::error::TransportError;
use crate::monitor::GatewayMonitor;
use crate::packet::Packet;
use crate::presence::PresenceStore;
use crate::push::OfflineInbox;
use crate::queue::{comet_group, publish_with_retry, QueueTransport, RetryPolicy, Subscription, TOPIC_DISPATCH, TOPIC_LOGIC};
use crate::registry::Registry;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Everything a connection needs from its comet.
pub struct CometContext {
    pub instance_id: String,
    pub registry: Registry,
    pub presence: Arc<dyn PresenceStore>,
    pub validator: Arc<dyn CredentialValidator>,
    /// Packets parked for offline users, drained when they authenticate.
    pub inbox: Option<Arc<dyn OfflineInbox>>,
    pub monitor: Arc<GatewayMonitor>,
    /// Parent of every connection's cancellation token.
    pub shutdown: CancellationToken,
    /// Connection supervisors and presence cleanups.
    pub tasks: TaskTracker,
    pub queue_capacity: usize,
    pub max_frame_len: usize,
    logic_tx: mpsc::Sender<Packet>,
}

impl CometContext {
    /// Returns the context and the receiving end of the logic channel.
    pub fn new(
        config: &CometConfig,
        presence: Arc<dyn PresenceStore>,
        validator: Arc<dyn CredentialValidator>,
        inbox: Option<Arc<dyn OfflineInbox>>,
        monitor: Arc<GatewayMonitor>,
    ) -> (Arc<Self>, mpsc::Receiver<Packet>) {
        let (logic_tx, logic_rx) = mpsc::channel(config.queue_capacity.max(1));
        let ctx = Arc::new(Self {
            instance_id: config.instance_id.clone(),
            registry: Registry::new(),
            presence,
            validator,
            inbox,
            monitor,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            queue_capacity: config.queue_capacity,
            max_frame_len: config.max_frame_len,
            logic_tx,
        });
        (ctx, logic_rx)
    }

    pub(crate) fn logic_sender(&self) -> &mpsc::Sender<Packet> {
        &self.logic_tx
    }
}

pub struct Comet {
    config: CometConfig,
    ctx: Arc<CometContext>,
    queue: Arc<dyn QueueTransport>,
    logic_rx: Mutex<Option<mpsc::Receiver<Packet>>>,
    retry: RetryPolicy,
    /// Tells the logic publisher to flush and exit.
    drain_logic: CancellationToken,
    /// Delivery loop and logic publisher.
    background: TaskTracker,
    stopping: AtomicBool,
}

impl Comet {
    pub fn new(
        config: CometConfig,
        queue: Arc<dyn QueueTransport>,
        presence: Arc<dyn PresenceStore>,
        validator: Arc<dyn CredentialValidator>,
        inbox: Option<Arc<dyn OfflineInbox>>,
        monitor: Arc<GatewayMonitor>,
    ) -> Self {
        let (ctx, logic_rx) = CometContext::new(&config, presence, validator, inbox, monitor);
        Self {
            config,
            ctx,
            queue,
            logic_rx: Mutex::new(Some(logic_rx)),
            retry: RetryPolicy::default(),
            drain_logic: CancellationToken::new(),
            background: TaskTracker::new(),
            stopping: AtomicBool::new(false),
        }
    }

    pub fn context(&self) -> &Arc<CometContext> {
        &self.ctx
    }

    pub fn registry(&self) -> &Registry {
        &self.ctx.registry
    }

    pub async fn bind(&self) -> io::Result<TcpListener> {
        TcpListener::bind(&self.config.listen_addr).await
    }

    /// Subscribes to the dispatch topic, starts the background loops and
    /// accepts connections until [`Comet::shutdown`] is called.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), TransportError> {
        let group = comet_group(&self.config.instance_id);
        let subscription = self.queue.subscribe(TOPIC_DISPATCH, &group).await?;
        self.background.spawn(delivery_loop(Arc::clone(&self.ctx), subscription));

        let logic_rx = self.logic_rx.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(logic_rx) = logic_rx {
            self.background.spawn(logic_publisher(
                Arc::clone(&self.queue),
                logic_rx,
                self.drain_logic.clone(),
                self.retry.clone(),
                Arc::clone(&self.ctx.monitor),
            ));
        }

        match listener.local_addr() {
            Ok(addr) => info!("Comet {} listening on {}", self.config.instance_id, addr),
            Err(_) => info!("Comet {} listening", self.config.instance_id),
        }
        accept_loop(&self.ctx, listener).await;
        Ok(())
    }

    /// Binds the configured address and serves on it.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await?;
        Ok(())
    }

    /// Stops accepting, closes every connection, waits for their loops,
    /// detaches from the dispatch topic and finally flushes the logic
    /// publisher.
    pub async fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Comet {} shutting down", self.config.instance_id);
        self.ctx.shutdown.cancel();

        let connections = self.ctx.registry.connections();
        debug!(count = connections.len(), "closing registered connections");
        for conn in connections {
            conn.close();
        }

        self.ctx.tasks.close();
        self.ctx.tasks.wait().await;

        let group = comet_group(&self.config.instance_id);
        if let Err(e) = self.queue.unsubscribe(TOPIC_DISPATCH, &group).await {
            warn!(group = %group, error = %e, "failed to detach from dispatch topic");
        }

        self.drain_logic.cancel();
        self.background.close();
        self.background.wait().await;
        info!("Comet {} stopped", self.config.instance_id);
    }
}

async fn accept_loop(ctx: &Arc<CometContext>, listener: TcpListener) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = ctx.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                if ctx.shutdown.is_cancelled() {
                    break;
                }
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(peer = %peer, error = %e, "set_nodelay failed");
                }
                let conn = Connection::spawn(Arc::clone(ctx), stream, peer);
                debug!(conn = conn.id(), peer = %peer, "accepted connection");
            }
            Err(e) if is_transient_accept_error(&e) => {
                warn!(error = %e, "transient accept failure; retrying");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
            Err(e) => {
                error!(error = %e, "listener failed; no longer accepting connections");
                break;
            }
        }
    }
    debug!("accept loop stopped");
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    use io::ErrorKind::*;
    // EMFILE / ENFILE clear once connections close
    matches!(
        e.kind(),
        ConnectionAborted | ConnectionReset | ConnectionRefused | Interrupted | WouldBlock | TimedOut
    ) || matches!(e.raw_os_error(), Some(23) | Some(24))
}

/// Routes dispatched packets to the local owner of `rid`.
async fn delivery_loop(ctx: Arc<CometContext>, subscription: Subscription) {
    loop {
        let bytes = tokio::select! {
            biased;
            _ = ctx.shutdown.cancelled() => break,
            next = subscription.recv() => match next {
                Some(bytes) => bytes,
                None => break,
            },
        };

        let packet = match codec::deserialize_with_limit(&bytes, ctx.max_frame_len) {
            Ok(packet) => packet,
            Err(e) => {
                ctx.monitor.protocol_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "undecodable packet on dispatch topic");
                continue;
            }
        };

        let (rid, mid) = (packet.rid, packet.mid);
        match ctx.registry.get_by_uid(rid) {
            Some(conn) => match conn.enqueue(packet).await {
                Ok(()) => {
                    ctx.monitor.delivered.fetch_add(1, Ordering::Relaxed);
                    trace!(conn = conn.id(), rid, mid, "delivered");
                }
                Err(_) => debug!(rid, mid, "recipient closed before delivery"),
            },
            None => {
                ctx.monitor.undeliverable.fetch_add(1, Ordering::Relaxed);
                trace!(rid, mid, "recipient not connected to this comet");
            }
        }
    }
    debug!("delivery loop stopped");
}

/// Moves packets from the logic channel onto the logic topic.
async fn logic_publisher(
    queue: Arc<dyn QueueTransport>,
    mut logic_rx: mpsc::Receiver<Packet>,
    drain: CancellationToken,
    retry: RetryPolicy,
    monitor: Arc<GatewayMonitor>,
) {
    loop {
        let packet = tokio::select! {
            biased;
            next = logic_rx.recv() => match next {
                Some(packet) => packet,
                None => break,
            },
            _ = drain.cancelled() => break,
        };
        publish_logic(queue.as_ref(), packet, &retry, &monitor).await;
    }

    logic_rx.close();
    let mut flushed = 0usize;
    while let Ok(packet) = logic_rx.try_recv() {
        publish_logic(queue.as_ref(), packet, &retry, &monitor).await;
        flushed += 1;
    }
    debug!(flushed, "logic publisher stopped");
}

async fn publish_logic(queue: &dyn QueueTransport, packet: Packet, retry: &RetryPolicy, monitor: &GatewayMonitor) {
    if let Err(e) = publish_with_retry(queue, TOPIC_LOGIC, codec::serialize(&packet), retry).await {
        monitor.transport_errors.fetch_add(1, Ordering::Relaxed);
        error!(sid = packet.sid, rid = packet.rid, mt = packet.mt, error = %e, "dropping packet bound for logic topic");
    }
}
