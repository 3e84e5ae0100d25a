#[cfg(test)]
mod store_tests {
    use im_gateway::codec;
    use im_gateway::config::StoreConfig;
    use im_gateway::error::PersistenceError;
    use im_gateway::monitor::GatewayMonitor;
    use im_gateway::packet::{MessageType, Packet};
    use im_gateway::queue::{MemoryQueue, QueueTransport, TOPIC_DISPATCH, TOPIC_OFFLINE};
    use im_gateway::store::{FileMessageStore, MessageStore, StoreService};
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    fn message(mid: i64, rid: i64, body: &str) -> Packet {
        Packet {
            mid,
            ..Packet::new(MessageType::P2p).with_route(1, rid).with_payload(body.to_string())
        }
    }

    fn mids(packets: &[Packet]) -> Vec<i64> {
        packets.iter().map(|p| p.mid).collect()
    }

    #[test]
    fn test_range_is_newest_first_and_bounded() {
        let dir = tempdir().unwrap();
        let store = FileMessageStore::open(dir.path().join("nested/messages.log")).unwrap();

        store.save(&message(10, 7, "a")).unwrap();
        store
            .save_multi(&[message(20, 7, "b"), message(30, 7, "c"), message(15, 8, "other")])
            .unwrap();

        assert_eq!(mids(&store.range(7, 0, 10).unwrap()), vec![30, 20, 10]);
        assert_eq!(mids(&store.range(7, 10, 10).unwrap()), vec![30, 20]);
        assert_eq!(mids(&store.range(7, 0, 1).unwrap()), vec![30]);
        assert_eq!(mids(&store.range(8, 0, 10).unwrap()), vec![15]);
        assert!(store.range(9, 0, 10).unwrap().is_empty());
        assert!(store.range(7, 30, 10).unwrap().is_empty());
        assert_eq!(&store.range(7, 25, 10).unwrap()[0].pl[..], b"c");
        assert_eq!(store.len(), 4);
    }

    #[test]
    fn test_records_carry_creation_time() {
        let dir = tempdir().unwrap();
        let store = FileMessageStore::open(dir.path().join("messages.log")).unwrap();
        let before = chrono::Utc::now().timestamp_millis();
        store.save(&message(1, 2, "x")).unwrap();

        let records = store.records(2, 0, 10).unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].created_at >= before);
        assert_eq!(records[0].packet, message(1, 2, "x"));
    }

    #[test]
    fn test_reopen_replays_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("messages.log");
        {
            let store = FileMessageStore::open(&path).unwrap();
            store.save_multi(&[message(1, 3, "one"), message(2, 3, "two")]).unwrap();
        }

        let store = FileMessageStore::open(&path).unwrap();
        assert_eq!(store.len(), 2);
        let got = store.range(3, 0, 10).unwrap();
        assert_eq!(got, vec![message(2, 3, "two"), message(1, 3, "one")]);

        store.save(&message(3, 3, "three")).unwrap();
        assert_eq!(mids(&store.range(3, 0, 10).unwrap()), vec![3, 2, 1]);
    }

    #[test]
    fn test_duplicate_mid_keeps_latest_copy() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("messages.log");
        let store = FileMessageStore::open(&path).unwrap();
        store.save(&message(5, 1, "first")).unwrap();
        store.save(&message(5, 1, "second")).unwrap();

        let got = store.range(1, 0, 10).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(&got[0].pl[..], b"second");
        drop(store);

        let reopened = FileMessageStore::open(&path).unwrap();
        assert_eq!(&reopened.range(1, 0, 10).unwrap()[0].pl[..], b"second");
    }

    #[test]
    fn test_torn_tail_is_discarded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("messages.log");
        {
            let store = FileMessageStore::open(&path).unwrap();
            store.save(&message(1, 4, "kept")).unwrap();
        }
        let good_len = std::fs::metadata(&path).unwrap().len();

        // half of a second record
        let mut partial = 0i64.to_be_bytes().to_vec();
        let frame = codec::serialize(&message(2, 4, "lost"));
        partial.extend_from_slice(&frame[..frame.len() / 2]);
        OpenOptions::new().append(true).open(&path).unwrap().write_all(&partial).unwrap();

        let store = FileMessageStore::open(&path).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), good_len);

        store.save(&message(3, 4, "after")).unwrap();
        assert_eq!(mids(&store.range(4, 0, 10).unwrap()), vec![3, 1]);
    }

    #[test]
    fn test_corrupt_record_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("messages.log");
        let mut garbage = 0i64.to_be_bytes().to_vec();
        garbage.extend_from_slice(&5u32.to_be_bytes());
        garbage.extend_from_slice(&[0xAB; 64]);
        std::fs::write(&path, &garbage).unwrap();

        match FileMessageStore::open(&path) {
            Err(PersistenceError::Corrupt { offset: 0, .. }) => {}
            Err(e) => panic!("expected Corrupt, got {}", e),
            Ok(_) => panic!("corrupt log opened"),
        }
    }

    struct BrokenDisk;

    impl MessageStore for BrokenDisk {
        fn save(&self, _packet: &Packet) -> Result<(), PersistenceError> {
            Err(PersistenceError::Worker("disk full".to_string()))
        }

        fn save_multi(&self, _packets: &[Packet]) -> Result<(), PersistenceError> {
            Err(PersistenceError::Worker("disk full".to_string()))
        }

        fn range(&self, _rid: i64, _after_mid: i64, _limit: usize) -> Result<Vec<Packet>, PersistenceError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_persist_failure_is_counted() {
        let monitor = Arc::new(GatewayMonitor::new());
        let service = StoreService::new(
            StoreConfig::default(),
            Arc::new(BrokenDisk),
            Arc::new(MemoryQueue::new()),
            monitor.clone(),
        );
        assert_eq!(service.persist(vec![message(1, 1, "x"), message(2, 1, "y")]).await, 0);
        assert_eq!(monitor.persistence_errors.load(Ordering::Relaxed), 2);
        assert_eq!(monitor.stored.load(Ordering::Relaxed), 0);
    }

    async fn wait_for_stored(monitor: &GatewayMonitor, expected: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while monitor.stored.load(Ordering::Relaxed) < expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("store service did not persist in time");
    }

    #[tokio::test]
    async fn test_service_persists_dispatch_and_offline_topics() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FileMessageStore::open(dir.path().join("messages.log")).unwrap());
        let queue = Arc::new(MemoryQueue::new());
        let monitor = Arc::new(GatewayMonitor::new());
        let config = StoreConfig {
            workers: 2,
            batch_size: 2,
            flush_interval_ms: 10,
            subscribe_offline: true,
            ..Default::default()
        };
        let service = Arc::new(StoreService::new(config, store.clone(), queue.clone(), monitor.clone()));
        service.start().await.unwrap();

        for mid in 1..=5 {
            queue
                .publish(TOPIC_DISPATCH, codec::serialize(&message(mid, 9, "d")))
                .await
                .unwrap();
        }
        queue
            .publish(TOPIC_OFFLINE, codec::serialize(&message(6, 9, "o")))
            .await
            .unwrap();

        wait_for_stored(&monitor, 6).await;
        service.shutdown().await;

        assert_eq!(mids(&store.range(9, 0, 10).unwrap()), vec![6, 5, 4, 3, 2, 1]);
        assert_eq!(monitor.persistence_errors.load(Ordering::Relaxed), 0);
    }
}
