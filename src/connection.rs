//! One client TCP session on a comet.
//!
//! A connection runs three loops: read (socket → inbound queue), handle
//! (inbound queue → control handling / logic forwarding) and write
//! (outbound queue → socket). A supervisor task closes the connection as
//! soon as any loop ends or panics. `close` is idempotent and is the only
//! place that unregisters identities.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::auth;
use crate::codec;
use crate::comet::CometContext;
use crate::error::{AuthError, ConnectionError, FrameError};
use crate::packet::{DeviceInfo, MessageType, Packet, STATUS_BAD_REQUEST, STATUS_OK};
use crate::presence::{device_online_key, user_online_key};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Registered,
    Authenticated,
    Closed,
}

#[derive(Debug, Clone, Default)]
struct Identity {
    uid: i64,
    device_token: String,
}

pub struct Connection {
    id: u64,
    peer: SocketAddr,
    identity: Mutex<Identity>,
    authenticated: AtomicBool,
    closed: AtomicBool,
    cancel: CancellationToken,
    outbound: mpsc::Sender<Packet>,
    ctx: Arc<CometContext>,
}

impl Connection {
    /// Builds a connection without a socket. The returned receiver is its
    /// outbound queue; `spawn` hands it to the write loop.
    pub fn new(ctx: Arc<CometContext>, peer: SocketAddr) -> (Arc<Self>, mpsc::Receiver<Packet>) {
        let (outbound, outbound_rx) = mpsc::channel(ctx.queue_capacity.max(1));
        let conn = Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            identity: Mutex::new(Identity::default()),
            authenticated: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            cancel: ctx.shutdown.child_token(),
            outbound,
            ctx,
        });
        (conn, outbound_rx)
    }

    /// Starts the read/handle/write loops for an accepted socket.
    pub fn spawn(ctx: Arc<CometContext>, stream: TcpStream, peer: SocketAddr) -> Arc<Self> {
        let (conn, outbound_rx) = Connection::new(Arc::clone(&ctx), peer);
        ctx.monitor.connection_opened();

        let (reader, writer) = stream.into_split();
        let (inbound_tx, inbound_rx) = mpsc::channel(ctx.queue_capacity.max(1));

        let mut loops = JoinSet::new();
        loops.spawn(read_loop(Arc::clone(&conn), BufReader::new(reader), inbound_tx));
        loops.spawn(handle_loop(Arc::clone(&conn), inbound_rx));
        loops.spawn(write_loop(Arc::clone(&conn), writer, outbound_rx));

        let supervised = Arc::clone(&conn);
        ctx.tasks.spawn(async move {
            while let Some(joined) = loops.join_next().await {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!(conn = supervised.id, error = %e, "connection loop ended"),
                    Err(e) => error!(conn = supervised.id, error = %e, "connection loop failed"),
                }
                supervised.close();
            }
        });

        conn
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn identity(&self) -> MutexGuard<'_, Identity> {
        self.identity.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn uid(&self) -> i64 {
        self.identity().uid
    }

    pub fn device_token(&self) -> String {
        self.identity().device_token.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ConnectionState {
        if self.is_closed() {
            ConnectionState::Closed
        } else if self.is_authenticated() {
            ConnectionState::Authenticated
        } else if !self.identity().device_token.is_empty() {
            ConnectionState::Registered
        } else {
            ConnectionState::Connected
        }
    }

    /// Tears the connection down. Only the first call has any effect.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.authenticated.store(false, Ordering::Release);
        self.cancel.cancel();

        let Identity { uid, device_token } = self.identity().clone();
        let released = self.ctx.registry.unregister(uid, &device_token, self.id);
        self.ctx.monitor.connection_closed();
        info!(conn = self.id, peer = %self.peer, uid, token = %device_token, "connection closed");

        if released.uid || released.device_token {
            let ctx = Arc::clone(&self.ctx);
            let conn = self.id;
            self.ctx.tasks.spawn(async move {
                if released.uid {
                    release_presence(&ctx, conn, &user_online_key(uid), || {
                        ctx.registry.get_by_uid(uid).is_some()
                    })
                    .await;
                }
                if released.device_token {
                    release_presence(&ctx, conn, &device_online_key(&device_token), || {
                        ctx.registry.get_by_device_token(&device_token).is_some()
                    })
                    .await;
                }
            });
        }
    }

    /// Queues a packet for the write loop. Waits while the queue is full.
    pub async fn enqueue(&self, packet: Packet) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ConnectionError::Closed),
            sent = self.outbound.send(packet) => sent.map_err(|_| ConnectionError::Closed),
        }
    }

    /// Handles one inbound packet. An error ends the connection.
    pub async fn handle_packet(self: &Arc<Self>, packet: Packet) -> Result<(), ConnectionError> {
        let mt = match packet.message_type() {
            Ok(mt) => mt,
            Err(e) => {
                self.ctx.monitor.protocol_errors.fetch_add(1, Ordering::Relaxed);
                warn!(conn = self.id, error = %e, "ignoring packet");
                return Ok(());
            }
        };

        match mt {
            MessageType::Heartbeat => {
                trace!(conn = self.id, "heartbeat");
                Ok(())
            }
            MessageType::Ping => self.enqueue(Packet::pong(packet.ver)).await,
            MessageType::Register => self.on_register(packet).await,
            MessageType::Auth => self.on_auth(packet).await,
            MessageType::P2p | MessageType::Group | MessageType::Room => self.on_route(packet).await,
            MessageType::Ack => {
                debug!(conn = self.id, mid = packet.mid, "ack");
                Ok(())
            }
            MessageType::Pong | MessageType::RegisterStatus | MessageType::AuthStatus => {
                debug!(conn = self.id, mt = packet.mt, "ignoring server-side message type from client");
                Ok(())
            }
        }
    }

    async fn on_register(self: &Arc<Self>, packet: Packet) -> Result<(), ConnectionError> {
        let token = match serde_json::from_slice::<DeviceInfo>(&packet.pl) {
            Ok(info) if !info.token.is_empty() => info.token,
            _ => {
                warn!(conn = self.id, "register without a usable device token");
                return self
                    .enqueue(Packet::status(
                        packet.ver,
                        MessageType::RegisterStatus,
                        STATUS_BAD_REQUEST,
                        "params decode err",
                    ))
                    .await;
            }
        };

        let previous = std::mem::replace(&mut self.identity().device_token, token.clone());
        if !previous.is_empty()
            && previous != token
            && self.ctx.registry.unregister(0, &previous, self.id).device_token
        {
            release_presence(&self.ctx, self.id, &device_online_key(&previous), || {
                self.ctx.registry.get_by_device_token(&previous).is_some()
            })
            .await;
        }

        if let Some(evicted) = self.ctx.registry.claim_device_token(&token, self) {
            info!(conn = self.id, evicted = evicted.id(), token = %token, "device token superseded");
            self.ctx.monitor.supersedes.fetch_add(1, Ordering::Relaxed);
            evicted.close();
        }

        if self.is_authenticated() {
            self.ctx.registry.register_by_uid(self.uid(), self);
        }

        // close() may have run between the claim and here
        if self.is_closed() {
            self.ctx.registry.unregister(self.uid(), &token, self.id);
            return Err(ConnectionError::Closed);
        }

        self.mark_present(&device_online_key(&token)).await;
        info!(conn = self.id, token = %token, "device registered");
        self.enqueue(Packet::status(packet.ver, MessageType::RegisterStatus, STATUS_OK, "ok"))
            .await
    }

    async fn on_auth(self: &Arc<Self>, packet: Packet) -> Result<(), ConnectionError> {
        let info = match auth::check_credentials(self.ctx.validator.as_ref(), &packet.pl).await {
            Ok(info) => info,
            Err(e) => {
                if matches!(e, AuthError::Rejected(_)) {
                    self.ctx.monitor.auth_failures.fetch_add(1, Ordering::Relaxed);
                }
                warn!(conn = self.id, error = %e, "auth failed");
                return self
                    .enqueue(Packet::status(packet.ver, MessageType::AuthStatus, e.status(), e.message()))
                    .await;
            }
        };
        let uid = info.uid;

        let previous = std::mem::replace(&mut self.identity().uid, uid);
        if previous != 0 && previous != uid && self.ctx.registry.unregister(previous, "", self.id).uid {
            release_presence(&self.ctx, self.id, &user_online_key(previous), || {
                self.ctx.registry.get_by_uid(previous).is_some()
            })
            .await;
        }

        if let Some(evicted) = self.ctx.registry.claim_uid(uid, self) {
            info!(conn = self.id, evicted = evicted.id(), uid, "uid superseded");
            self.ctx.monitor.supersedes.fetch_add(1, Ordering::Relaxed);
            evicted.close();
        }
        self.authenticated.store(true, Ordering::Release);

        let token = self.device_token();
        if !token.is_empty() {
            self.ctx.registry.register_by_device_token(&token, self);
        }

        if self.is_closed() {
            self.ctx.registry.unregister(uid, &token, self.id);
            return Err(ConnectionError::Closed);
        }

        self.mark_present(&user_online_key(uid)).await;
        info!(conn = self.id, uid, "authenticated");
        self.enqueue(Packet::status(packet.ver, MessageType::AuthStatus, STATUS_OK, "ok"))
            .await?;
        self.deliver_offline(uid).await
    }

    async fn on_route(&self, mut packet: Packet) -> Result<(), ConnectionError> {
        if !self.is_authenticated() {
            self.ctx.monitor.unauthenticated_drops.fetch_add(1, Ordering::Relaxed);
            debug!(conn = self.id, mt = packet.mt, rid = packet.rid, "dropping packet from unauthenticated connection");
            return Ok(());
        }

        // The sender is whoever authenticated, not whatever the client wrote.
        packet.sid = self.uid();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(ConnectionError::Closed),
            sent = self.ctx.logic_sender().send(packet) => sent.map_err(|_| ConnectionError::Closed)?,
        }
        self.ctx.monitor.forwarded.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn deliver_offline(&self, uid: i64) -> Result<(), ConnectionError> {
        let Some(inbox) = &self.ctx.inbox else {
            return Ok(());
        };
        match inbox.drain(uid).await {
            Ok(pending) => {
                if !pending.is_empty() {
                    info!(conn = self.id, uid, count = pending.len(), "delivering offline packets");
                }
                for packet in pending {
                    self.enqueue(packet).await?;
                }
            }
            Err(e) => warn!(conn = self.id, uid, error = %e, "could not drain offline inbox"),
        }
        Ok(())
    }

    async fn mark_present(&self, key: &str) {
        if let Err(e) = self.ctx.presence.set(key, &self.ctx.instance_id).await {
            self.ctx.monitor.transport_errors.fetch_add(1, Ordering::Relaxed);
            warn!(conn = self.id, key, error = %e, "failed to record presence");
        }
    }
}

/// Deletes a presence key this connection gave up, unless another local
/// session owns it now. `owned` is checked again after the delete, since a
/// new owner may have marked itself present while the delete was in flight.
async fn release_presence(ctx: &CometContext, conn: u64, key: &str, owned: impl Fn() -> bool) {
    if owned() {
        trace!(conn, key, "key has a new owner; presence kept");
        return;
    }
    if let Err(e) = ctx.presence.del(key).await {
        ctx.monitor.transport_errors.fetch_add(1, Ordering::Relaxed);
        warn!(conn, key, error = %e, "failed to clear presence");
        return;
    }
    if owned() {
        if let Err(e) = ctx.presence.set(key, &ctx.instance_id).await {
            ctx.monitor.transport_errors.fetch_add(1, Ordering::Relaxed);
            warn!(conn, key, error = %e, "failed to restore presence");
        }
    }
}

async fn read_loop(
    conn: Arc<Connection>,
    mut reader: BufReader<OwnedReadHalf>,
    inbound: mpsc::Sender<Packet>,
) -> Result<(), ConnectionError> {
    let max_frame_len = conn.ctx.max_frame_len;
    loop {
        let packet = tokio::select! {
            biased;
            _ = conn.cancel.cancelled() => return Ok(()),
            read = codec::read_packet(&mut reader, max_frame_len) => match read {
                Ok(packet) => packet,
                Err(FrameError::Closed) => {
                    debug!(conn = conn.id, "peer closed");
                    return Ok(());
                }
                Err(e) => {
                    warn!(conn = conn.id, peer = %conn.peer, error = %e, "bad frame; closing");
                    return Err(e.into());
                }
            },
        };
        conn.ctx.monitor.frames_in.fetch_add(1, Ordering::Relaxed);

        tokio::select! {
            biased;
            _ = conn.cancel.cancelled() => return Ok(()),
            sent = inbound.send(packet) => sent.map_err(|_| ConnectionError::Closed)?,
        }
    }
}

async fn handle_loop(conn: Arc<Connection>, mut inbound: mpsc::Receiver<Packet>) -> Result<(), ConnectionError> {
    loop {
        let packet = tokio::select! {
            biased;
            _ = conn.cancel.cancelled() => return Ok(()),
            next = inbound.recv() => match next {
                Some(packet) => packet,
                None => return Ok(()),
            },
        };
        conn.handle_packet(packet).await?;
    }
}

async fn write_loop(
    conn: Arc<Connection>,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Packet>,
) -> Result<(), ConnectionError> {
    loop {
        let packet = tokio::select! {
            biased;
            _ = conn.cancel.cancelled() => break,
            next = outbound.recv() => match next {
                Some(packet) => packet,
                None => break,
            },
        };
        codec::write_packet(&mut writer, &packet).await?;
        conn.ctx.monitor.frames_out.fetch_add(1, Ordering::Relaxed);
    }
    let _ = writer.shutdown().await;
    Ok(())
}
