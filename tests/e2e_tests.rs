#[cfg(test)]
mod e2e_tests {
    use async_trait::async_trait;
    use im_gateway::auth::{CredentialValidator, StaticTokenValidator};
    use im_gateway::codec::{self, DEFAULT_MAX_FRAME_LEN};
    use im_gateway::comet::Comet;
    use im_gateway::config::{CometConfig, DispatchConfig, StoreConfig};
    use im_gateway::dispatch::Dispatcher;
    use im_gateway::error::FrameError;
    use im_gateway::membership::MemoryMembership;
    use im_gateway::monitor::GatewayMonitor;
    use im_gateway::packet::{AuthInfo, DeviceInfo, MessageType, Packet, ResponseInfo};
    use im_gateway::presence::MemoryPresence;
    use im_gateway::queue::{MemoryQueue, QueueTransport};
    use im_gateway::store::{FileMessageStore, MessageStore, StoreService};
    use std::net::SocketAddr;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{AsyncWriteExt, BufReader};
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    const WAIT: Duration = Duration::from_secs(5);

    struct Gateway {
        addr: SocketAddr,
        comet: Arc<Comet>,
        dispatcher: Arc<Dispatcher>,
        store_service: Arc<StoreService>,
        store: Arc<FileMessageStore>,
        monitor: Arc<GatewayMonitor>,
        server: JoinHandle<()>,
        _dir: TempDir,
    }

    impl Gateway {
        async fn start(membership: MemoryMembership) -> Self {
            Self::start_with_validator(membership, Arc::new(StaticTokenValidator::default())).await
        }

        async fn start_with_validator(membership: MemoryMembership, validator: Arc<dyn CredentialValidator>) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let monitor = Arc::new(GatewayMonitor::new());
            let queue: Arc<dyn QueueTransport> = Arc::new(MemoryQueue::new());

            let store = Arc::new(FileMessageStore::open(dir.path().join("messages.log")).unwrap());
            let store_config = StoreConfig {
                batch_size: 1,
                ..Default::default()
            };
            let store_service = Arc::new(StoreService::new(
                store_config,
                store.clone(),
                Arc::clone(&queue),
                monitor.clone(),
            ));
            store_service.start().await.unwrap();

            let dispatch_config = DispatchConfig {
                workers: 2,
                ..Default::default()
            };
            let dispatcher = Arc::new(
                Dispatcher::new(&dispatch_config, Arc::clone(&queue), Arc::new(membership), monitor.clone()).unwrap(),
            );
            dispatcher.start().await.unwrap();

            let comet = Arc::new(Comet::new(
                CometConfig::default(),
                Arc::clone(&queue),
                Arc::new(MemoryPresence::new()),
                validator,
                None,
                monitor.clone(),
            ));
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let serving = Arc::clone(&comet);
            let server = tokio::spawn(async move {
                serving.serve(listener).await.unwrap();
            });

            Gateway {
                addr,
                comet,
                dispatcher,
                store_service,
                store,
                monitor,
                server,
                _dir: dir,
            }
        }

        async fn stop(self) {
            self.comet.shutdown().await;
            self.server.await.unwrap();
            self.dispatcher.shutdown().await;
            self.store_service.shutdown().await;
        }
    }

    struct Client {
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    }

    impl Client {
        async fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (reader, writer) = stream.into_split();
            Client {
                reader: BufReader::new(reader),
                writer,
            }
        }

        async fn login(addr: SocketAddr, token: &str, uid: i64) -> Self {
            let mut client = Self::connect(addr).await;
            let device = serde_json::to_vec(&DeviceInfo { token: token.to_string() }).unwrap();
            client.send(&Packet::new(MessageType::Register).with_payload(device)).await;
            assert_eq!(client.status(MessageType::RegisterStatus).await, 0);

            let auth = serde_json::to_vec(&AuthInfo {
                uid,
                token: "123".to_string(),
            })
            .unwrap();
            client.send(&Packet::new(MessageType::Auth).with_payload(auth)).await;
            assert_eq!(client.status(MessageType::AuthStatus).await, 0);
            client
        }

        async fn send(&mut self, p: &Packet) {
            codec::write_packet(&mut self.writer, p).await.unwrap();
        }

        async fn recv(&mut self) -> Result<Packet, FrameError> {
            tokio::time::timeout(WAIT, codec::read_packet(&mut self.reader, DEFAULT_MAX_FRAME_LEN))
                .await
                .expect("timed out waiting for a packet")
        }

        async fn status(&mut self, mt: MessageType) -> i64 {
            let p = self.recv().await.unwrap();
            assert_eq!(p.mt, mt.as_i32());
            ResponseInfo::decode(&p.pl).unwrap().status
        }

        async fn silent_for(&mut self, window: Duration) -> bool {
            tokio::time::timeout(window, codec::read_packet(&mut self.reader, DEFAULT_MAX_FRAME_LEN))
                .await
                .is_err()
        }
    }

    #[tokio::test]
    async fn test_p2p_message_reaches_recipient() {
        let gw = Gateway::start(MemoryMembership::new()).await;
        let mut bob = Client::login(gw.addr, "bob-phone", 2).await;
        let mut alice = Client::login(gw.addr, "alice-phone", 1).await;

        alice
            .send(&Packet::new(MessageType::P2p).with_route(0, 2).with_payload("hi"))
            .await;

        let got = bob.recv().await.unwrap();
        assert_eq!(got.mt, MessageType::P2p.as_i32());
        assert_eq!((got.sid, got.rid), (1, 2));
        assert_eq!(&got.pl[..], b"hi");
        assert_ne!(got.mid, 0);
        assert!(alice.silent_for(Duration::from_millis(100)).await);

        tokio::time::timeout(WAIT, async {
            while gw.monitor.stored.load(Ordering::Relaxed) < 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("message never stored");
        assert_eq!(gw.store.range(2, 0, 10).unwrap()[0].mid, got.mid);

        gw.stop().await;
    }

    #[tokio::test]
    async fn test_group_message_fans_out() {
        let membership = MemoryMembership::new();
        membership.set_members(100, [1, 2, 3]);
        let gw = Gateway::start(membership).await;

        let mut one = Client::login(gw.addr, "d1", 1).await;
        let mut two = Client::login(gw.addr, "d2", 2).await;
        let mut three = Client::login(gw.addr, "d3", 3).await;

        one.send(&Packet::new(MessageType::Group).with_route(1, 100).with_payload("all"))
            .await;

        for (client, uid) in [(&mut two, 2), (&mut three, 3)] {
            let got = client.recv().await.unwrap();
            assert_eq!((got.sid, got.rid), (100, uid));
            assert_eq!(&got.pl[..], b"all");
        }
        assert!(one.silent_for(Duration::from_millis(100)).await);

        gw.stop().await;
    }

    #[tokio::test]
    async fn test_new_login_disconnects_old_session() {
        let gw = Gateway::start(MemoryMembership::new()).await;
        let mut old = Client::login(gw.addr, "laptop", 7).await;
        let _new = Client::login(gw.addr, "phone", 7).await;

        assert!(matches!(old.recv().await, Err(FrameError::Closed) | Err(FrameError::Io(_))));
        assert_eq!(gw.monitor.supersedes.load(Ordering::Relaxed), 1);
        assert_eq!(gw.comet.registry().get_by_uid(7).map(|c| c.device_token()), Some("phone".to_string()));

        gw.stop().await;
    }

    #[tokio::test]
    async fn test_unauthenticated_traffic_and_keepalive() {
        let gw = Gateway::start(MemoryMembership::new()).await;
        let mut target = Client::login(gw.addr, "t", 2).await;
        let mut anon = Client::connect(gw.addr).await;

        anon.send(&Packet::new(MessageType::P2p).with_route(9, 2).with_payload("spoof"))
            .await;
        anon.send(&Packet::new(MessageType::Heartbeat)).await;
        anon.send(&Packet::new(MessageType::Ping)).await;

        let pong = anon.recv().await.unwrap();
        assert_eq!(pong.mt, MessageType::Pong.as_i32());
        assert!(target.silent_for(Duration::from_millis(100)).await);
        assert_eq!(gw.monitor.unauthenticated_drops.load(Ordering::Relaxed), 1);

        gw.stop().await;
    }

    /// Panics while checking uid 666; accepts the default token otherwise.
    struct PanickingValidator;

    #[async_trait]
    impl CredentialValidator for PanickingValidator {
        async fn validate(&self, uid: i64, token: &str) -> bool {
            if uid == 666 {
                panic!("validator blew up for uid {}", uid);
            }
            token == "123"
        }
    }

    #[tokio::test]
    async fn test_handler_panic_closes_only_that_connection() {
        let gw = Gateway::start_with_validator(MemoryMembership::new(), Arc::new(PanickingValidator)).await;
        let mut good = Client::login(gw.addr, "good", 1).await;

        let mut bad = Client::connect(gw.addr).await;
        let device = serde_json::to_vec(&DeviceInfo { token: "bad".to_string() }).unwrap();
        bad.send(&Packet::new(MessageType::Register).with_payload(device)).await;
        assert_eq!(bad.status(MessageType::RegisterStatus).await, 0);
        let auth = serde_json::to_vec(&AuthInfo {
            uid: 666,
            token: "123".to_string(),
        })
        .unwrap();
        bad.send(&Packet::new(MessageType::Auth).with_payload(auth)).await;
        assert!(bad.recv().await.is_err());

        good.send(&Packet::new(MessageType::Ping)).await;
        assert_eq!(good.recv().await.unwrap().mt, MessageType::Pong.as_i32());

        // still accepting
        let mut later = Client::login(gw.addr, "later", 2).await;
        later.send(&Packet::new(MessageType::Ping)).await;
        assert_eq!(later.recv().await.unwrap().mt, MessageType::Pong.as_i32());

        assert_eq!(gw.comet.registry().get_by_uid(1).map(|c| c.device_token()), Some("good".to_string()));
        gw.stop().await;
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_connection() {
        let gw = Gateway::start(MemoryMembership::new()).await;
        let mut client = Client::connect(gw.addr).await;

        client
            .writer
            .write_all(&((DEFAULT_MAX_FRAME_LEN as u32) + 1).to_be_bytes())
            .await
            .unwrap();
        assert!(client.recv().await.is_err());

        gw.stop().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_clients() {
        let gw = Gateway::start(MemoryMembership::new()).await;
        let mut client = Client::login(gw.addr, "d", 1).await;
        let monitor = gw.monitor.clone();

        gw.stop().await;
        assert!(client.recv().await.is_err());
        assert_eq!(monitor.active_connections.load(Ordering::Relaxed), 0);
    }
}
