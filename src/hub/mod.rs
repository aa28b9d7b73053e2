//! Realtime broadcast hub: topic pub/sub over WebSocket
//!
//! The hub owns the connection/subscription map; the rest of the gateway only
//! sees [`BroadcastHub::broadcast`] and the counters. Metric ticks run only
//! while at least one connection is open.

mod connection;
pub mod metrics;
pub mod protocol;
pub mod session;

pub use connection::serve_connection;
pub use metrics::{DatabaseProbe, MetricsSource, SystemCollector};
pub use protocol::{ServerMessage, Topic};

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Per-connection outbound queue depth
const OUTBOUND_BUFFER: usize = 256;

struct ConnectionEntry {
    topics: BTreeSet<Topic>,
    tx: mpsc::Sender<ServerMessage>,
}

/// Connection registry plus the shared metrics ticker
pub struct BroadcastHub {
    connections: RwLock<HashMap<u64, ConnectionEntry>>,
    next_id: AtomicU64,
    metrics: Arc<dyn MetricsSource>,
    tick_interval: Duration,
    ticker: Mutex<Option<CancellationToken>>,
}

impl BroadcastHub {
    pub fn new(metrics: Arc<dyn MetricsSource>, tick_interval: Duration) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            metrics,
            tick_interval,
            ticker: Mutex::new(None),
        }
    }

    /// Register a connection with no topics and queue its `welcome`
    ///
    /// Starts the ticker when this is the first live connection.
    pub fn connect(self: &Arc<Self>) -> (u64, mpsc::Receiver<ServerMessage>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let _ = tx.try_send(ServerMessage::welcome(id));

        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        connections.insert(
            id,
            ConnectionEntry {
                topics: BTreeSet::new(),
                tx,
            },
        );
        if connections.len() == 1 {
            self.start_ticker();
        }
        tracing::debug!(connection = id, total = connections.len(), "Hub connection opened");

        (id, rx)
    }

    /// Drop a connection; stops the ticker when it was the last one
    pub fn disconnect(&self, id: u64) {
        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        if connections.remove(&id).is_none() {
            return;
        }
        if connections.is_empty() {
            self.stop_ticker();
        }
        tracing::debug!(connection = id, total = connections.len(), "Hub connection closed");
    }

    /// Replace a connection's topic set
    pub fn set_topics(&self, id: u64, topics: BTreeSet<Topic>) {
        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = connections.get_mut(&id) {
            entry.topics = topics;
        }
    }

    /// Queue a message for one connection, waiting for room in its queue
    ///
    /// Returns false if the connection is gone.
    pub async fn send_to(&self, id: u64, msg: ServerMessage) -> bool {
        let tx = {
            let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
            match connections.get(&id) {
                Some(entry) => entry.tx.clone(),
                None => return false,
            }
        };
        tx.send(msg).await.is_ok()
    }

    /// Deliver `msg` to every connection subscribed to `topic`
    ///
    /// A connection whose queue is full misses this message. Returns the
    /// number of connections the message was queued for.
    pub fn broadcast(&self, topic: Topic, msg: ServerMessage) -> usize {
        let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
        let mut delivered = 0;
        for (id, entry) in connections.iter() {
            if !entry.topics.contains(&topic) {
                continue;
            }
            match entry.tx.try_send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(connection = *id, topic = %topic, "Hub client lagging, message dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    /// Number of connections subscribed to `topic`
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|entry| entry.topics.contains(&topic))
            .count()
    }

    /// Number of open connections
    pub fn connection_count(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Whether the metrics ticker is running
    pub fn is_ticking(&self) -> bool {
        self.ticker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Current value for a topic (None for event-only topics)
    pub async fn snapshot(&self, topic: Topic) -> Option<ServerMessage> {
        let timestamp = chrono::Utc::now();
        match topic {
            Topic::System => Some(ServerMessage::SystemStats {
                data: self.metrics.system_stats().await,
                timestamp,
            }),
            Topic::Database => Some(ServerMessage::DatabaseStatus {
                data: self.metrics.database_status().await,
                timestamp,
            }),
            Topic::Services => Some(self.services_status().await),
            Topic::Notifications => None,
        }
    }

    /// `services-status` message for a direct request
    pub async fn services_status(&self) -> ServerMessage {
        ServerMessage::ServicesStatus {
            data: self.metrics.services_status().await,
            timestamp: chrono::Utc::now(),
        }
    }

    /// One tick: compute each subscribed topic once and fan it out
    ///
    /// Returns the number of messages queued.
    pub async fn tick(&self) -> usize {
        let subscribed: BTreeSet<Topic> = {
            let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
            connections
                .values()
                .flat_map(|entry| entry.topics.iter().copied())
                .collect()
        };

        let mut delivered = 0;
        for topic in subscribed {
            if let Some(msg) = self.snapshot(topic).await {
                delivered += self.broadcast(topic, msg);
            }
        }
        tracing::trace!(delivered, "Hub tick");
        delivered
    }

    /// Stop the ticker and drop every connection's queue
    ///
    /// Writers see their queue close and shut their sockets.
    pub fn shutdown(&self) {
        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        connections.clear();
        self.stop_ticker();
    }

    fn start_ticker(self: &Arc<Self>) {
        let mut ticker = self.ticker.lock().unwrap_or_else(|e| e.into_inner());
        if ticker.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let hub = Arc::downgrade(self);
        let period = self.tick_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; subscribers already got a snapshot
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(hub) = hub.upgrade() else { break };
                        hub.tick().await;
                    }
                }
            }
            tracing::debug!("Hub ticker stopped");
        });

        tracing::debug!(interval_secs = period.as_secs(), "Hub ticker started");
        *ticker = Some(token);
    }

    fn stop_ticker(&self) {
        if let Some(token) = self
            .ticker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            token.cancel();
        }
    }
}

impl Drop for BroadcastHub {
    fn drop(&mut self) {
        self.stop_ticker();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::metrics::{DatabaseStatus, ServicesStatus, SystemStats};
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Metrics source that counts how often each topic is computed
    #[derive(Default)]
    pub(crate) struct CountingMetrics {
        pub system: AtomicUsize,
        pub database: AtomicUsize,
        pub services: AtomicUsize,
    }

    #[async_trait]
    impl MetricsSource for CountingMetrics {
        async fn system_stats(&self) -> SystemStats {
            self.system.fetch_add(1, Ordering::SeqCst);
            SystemStats {
                pid: 42,
                ..SystemStats::default()
            }
        }

        async fn database_status(&self) -> DatabaseStatus {
            self.database.fetch_add(1, Ordering::SeqCst);
            DatabaseStatus::default()
        }

        async fn services_status(&self) -> ServicesStatus {
            self.services.fetch_add(1, Ordering::SeqCst);
            ServicesStatus::new()
        }
    }

    fn hub_with(interval: Duration) -> (Arc<BroadcastHub>, Arc<CountingMetrics>) {
        let metrics = Arc::new(CountingMetrics::default());
        let hub = Arc::new(BroadcastHub::new(metrics.clone(), interval));
        (hub, metrics)
    }

    #[tokio::test]
    async fn test_connect_sends_welcome() {
        let (hub, _) = hub_with(Duration::from_secs(30));
        let (id, mut rx) = hub.connect();
        match rx.recv().await.unwrap() {
            ServerMessage::Welcome {
                connection_id,
                available_subscriptions,
                ..
            } => {
                assert_eq!(connection_id, id);
                assert_eq!(available_subscriptions, Topic::ALL.to_vec());
            }
            other => panic!("expected welcome, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_connection_ids_unique() {
        let (hub, _) = hub_with(Duration::from_secs(30));
        let (a, _rx_a) = hub.connect();
        let (b, _rx_b) = hub.connect();
        hub.disconnect(a);
        let (c, _rx_c) = hub.connect();
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
    }

    #[tokio::test]
    async fn test_ticker_follows_connection_count() {
        let (hub, _) = hub_with(Duration::from_secs(30));
        assert!(!hub.is_ticking());

        let (a, _rx_a) = hub.connect();
        assert!(hub.is_ticking());
        let (b, _rx_b) = hub.connect();
        assert_eq!(hub.connection_count(), 2);

        hub.disconnect(a);
        assert!(hub.is_ticking());
        hub.disconnect(b);
        assert!(!hub.is_ticking());
        assert_eq!(hub.connection_count(), 0);

        // Unknown id is a no-op
        hub.disconnect(b);
        assert!(!hub.is_ticking());
    }

    #[tokio::test]
    async fn test_broadcast_only_reaches_subscribers() {
        let (hub, _) = hub_with(Duration::from_secs(30));
        let (a, mut rx_a) = hub.connect();
        let (b, mut rx_b) = hub.connect();
        rx_a.recv().await.unwrap();
        rx_b.recv().await.unwrap();

        hub.set_topics(a, BTreeSet::from([Topic::Notifications]));
        assert_eq!(hub.subscriber_count(Topic::Notifications), 1);
        assert_eq!(hub.subscriber_count(Topic::System), 0);

        let sent = hub.broadcast(
            Topic::Notifications,
            ServerMessage::notification(serde_json::json!({"event": "exited"})),
        );
        assert_eq!(sent, 1);
        assert_eq!(rx_a.recv().await.unwrap().kind(), "notification");
        assert!(rx_b.try_recv().is_err());
        let _ = b;
    }

    #[tokio::test]
    async fn test_tick_computes_each_topic_once() {
        let (hub, metrics) = hub_with(Duration::from_secs(30));
        let mut receivers = Vec::new();
        for _ in 0..5 {
            let (id, mut rx) = hub.connect();
            rx.recv().await.unwrap();
            hub.set_topics(id, BTreeSet::from([Topic::System, Topic::Database]));
            receivers.push(rx);
        }

        let delivered = hub.tick().await;
        assert_eq!(delivered, 10);
        assert_eq!(metrics.system.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.database.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.services.load(Ordering::SeqCst), 0);

        for rx in receivers.iter_mut() {
            assert_eq!(rx.recv().await.unwrap().kind(), "system-stats");
            assert_eq!(rx.recv().await.unwrap().kind(), "database-status");
        }
    }

    #[tokio::test]
    async fn test_tick_without_subscribers_does_no_work() {
        let (hub, metrics) = hub_with(Duration::from_secs(30));
        let (_id, _rx) = hub.connect();
        assert_eq!(hub.tick().await, 0);
        assert_eq!(metrics.system.load(Ordering::SeqCst), 0);
        assert_eq!(metrics.database.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_pushes_on_interval() {
        let (hub, metrics) = hub_with(Duration::from_secs(30));
        let (id, mut rx) = hub.connect();
        rx.recv().await.unwrap();
        hub.set_topics(id, BTreeSet::from([Topic::System]));

        let msg = tokio::time::timeout(Duration::from_secs(31), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.kind(), "system-stats");
        assert_eq!(metrics.system.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_stops_after_last_disconnect() {
        let (hub, metrics) = hub_with(Duration::from_secs(30));
        let (id, _rx) = hub.connect();
        hub.set_topics(id, BTreeSet::from([Topic::Database]));
        hub.disconnect(id);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(metrics.database.load(Ordering::SeqCst), 0);
        assert!(!hub.is_ticking());
    }

    #[tokio::test]
    async fn test_send_to_closed_connection() {
        let (hub, _) = hub_with(Duration::from_secs(30));
        let (id, rx) = hub.connect();
        drop(rx);
        assert!(!hub.send_to(id, ServerMessage::pong()).await);
        hub.disconnect(id);
        assert!(!hub.send_to(id, ServerMessage::pong()).await);
    }

    #[tokio::test]
    async fn test_shutdown_closes_queues() {
        let (hub, _) = hub_with(Duration::from_secs(30));
        let (_id, mut rx) = hub.connect();
        rx.recv().await.unwrap();
        hub.shutdown();
        assert!(rx.recv().await.is_none());
        assert!(!hub.is_ticking());
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_notifications_is_none() {
        let (hub, _) = hub_with(Duration::from_secs(30));
        assert!(hub.snapshot(Topic::Notifications).await.is_none());
        assert_eq!(
            hub.snapshot(Topic::Services).await.unwrap().kind(),
            "services-status"
        );
    }
}
