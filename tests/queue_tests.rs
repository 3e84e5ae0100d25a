#[cfg(test)]
mod queue_tests {
    use async_trait::async_trait;
    use bytes::Bytes;
    use im_gateway::error::TransportError;
    use im_gateway::queue::{publish_with_retry, MemoryQueue, QueueTransport, RetryPolicy, Subscription};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    const TOPIC: &str = "topic_under_test";

    fn fast_retry(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn test_every_group_sees_every_message() {
        let queue = MemoryQueue::new();
        let store = queue.subscribe(TOPIC, "store").await.unwrap();
        let push = queue.subscribe(TOPIC, "push").await.unwrap();

        queue.publish(TOPIC, Bytes::from_static(b"one")).await.unwrap();
        queue.publish(TOPIC, Bytes::from_static(b"two")).await.unwrap();

        for sub in [&store, &push] {
            assert_eq!(sub.recv().await.unwrap(), Bytes::from_static(b"one"));
            assert_eq!(sub.recv().await.unwrap(), Bytes::from_static(b"two"));
        }
        assert_eq!(queue.group_count(TOPIC), 2);
    }

    #[tokio::test]
    async fn test_group_members_split_the_stream() {
        let queue = MemoryQueue::new();
        let a = queue.subscribe(TOPIC, "workers").await.unwrap();
        let b = queue.subscribe(TOPIC, "workers").await.unwrap();
        assert_eq!(queue.group_count(TOPIC), 1);

        for i in 0..100u32 {
            queue.publish(TOPIC, Bytes::from(i.to_be_bytes().to_vec())).await.unwrap();
        }

        async fn drain(sub: Subscription) -> Vec<Bytes> {
            let mut got = Vec::new();
            while let Ok(Some(msg)) = tokio::time::timeout(Duration::from_millis(50), sub.recv()).await {
                got.push(msg);
            }
            got
        }
        let (from_a, from_b) = tokio::join!(drain(a), drain(b));

        let mut all: Vec<Bytes> = from_a.into_iter().chain(from_b).collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 100);
    }

    #[tokio::test]
    async fn test_publish_without_groups_is_dropped() {
        let queue = MemoryQueue::new();
        queue.publish(TOPIC, Bytes::from_static(b"lost")).await.unwrap();

        let late = queue.subscribe(TOPIC, "late").await.unwrap();
        queue.publish(TOPIC, Bytes::from_static(b"kept")).await.unwrap();
        assert_eq!(late.recv().await.unwrap(), Bytes::from_static(b"kept"));
    }

    #[tokio::test]
    async fn test_unsubscribe_ends_stream_after_buffered_messages() {
        let queue = MemoryQueue::new();
        let sub = queue.subscribe(TOPIC, "g").await.unwrap();
        queue.publish(TOPIC, Bytes::from_static(b"last")).await.unwrap();
        queue.unsubscribe(TOPIC, "g").await.unwrap();

        assert_eq!(sub.recv().await.unwrap(), Bytes::from_static(b"last"));
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_publish() {
        let queue = MemoryQueue::new();
        let sub = queue.subscribe(TOPIC, "g").await.unwrap();
        queue.close();

        assert_eq!(queue.publish(TOPIC, Bytes::new()).await, Err(TransportError::Closed));
        assert!(queue.subscribe(TOPIC, "g").await.is_err());
        assert!(sub.recv().await.is_none());
    }

    struct Flaky {
        inner: MemoryQueue,
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl QueueTransport for Flaky {
        async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(TransportError::Publish {
                    topic: topic.to_string(),
                    reason: "injected".to_string(),
                });
            }
            self.inner.publish(topic, payload).await
        }

        async fn subscribe(&self, topic: &str, group: &str) -> Result<Subscription, TransportError> {
            self.inner.subscribe(topic, group).await
        }

        async fn unsubscribe(&self, topic: &str, group: &str) -> Result<(), TransportError> {
            self.inner.unsubscribe(topic, group).await
        }
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failures() {
        let queue = Flaky {
            inner: MemoryQueue::new(),
            failures_left: AtomicU32::new(2),
            calls: AtomicU32::new(0),
        };
        let sub = queue.subscribe(TOPIC, "g").await.unwrap();

        publish_with_retry(&queue, TOPIC, Bytes::from_static(b"x"), &fast_retry(4))
            .await
            .unwrap();
        assert_eq!(queue.calls.load(Ordering::SeqCst), 3);
        assert_eq!(sub.recv().await.unwrap(), Bytes::from_static(b"x"));
    }

    #[tokio::test]
    async fn test_retry_gives_up_and_never_retries_closed() {
        let queue = Flaky {
            inner: MemoryQueue::new(),
            failures_left: AtomicU32::new(10),
            calls: AtomicU32::new(0),
        };
        let err = publish_with_retry(&queue, TOPIC, Bytes::new(), &fast_retry(3)).await.unwrap_err();
        assert!(matches!(err, TransportError::Publish { .. }));
        assert_eq!(queue.calls.load(Ordering::SeqCst), 3);

        let closed = MemoryQueue::new();
        closed.close();
        assert_eq!(
            publish_with_retry(&closed, TOPIC, Bytes::new(), &fast_retry(3)).await,
            Err(TransportError::Closed)
        );
    }

    #[test]
    fn test_retry_delay_is_capped() {
        let policy = RetryPolicy::default();
        for attempt in 0..40 {
            let delay = policy.delay_for(attempt);
            assert!(delay >= policy.base_delay.min(policy.max_delay));
            assert!(delay <= policy.max_delay + policy.max_delay / 4 + Duration::from_millis(1));
        }
    }
}
