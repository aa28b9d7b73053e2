//! Gateway orchestrator: wires supervisor, router, proxy, health and hub
//!
//! Owns the lifecycle: start the configured services, bind the public port,
//! serve until a shutdown signal, then stop accepting, close hub connections
//! and terminate every child.

use crate::config::{GatewayConfig, ListenConfig};
use crate::dashboard::DashboardApi;
use crate::entrypoint::{self, GatewayContext};
use crate::error::Result;
use crate::hub::metrics::{
    compose_services_status, DatabaseStatus, ServicesStatus, SystemStats,
};
use crate::hub::{BroadcastHub, DatabaseProbe, MetricsSource, ServerMessage, SystemCollector, Topic};
use crate::observability::{AccessLog, AccessStats};
use crate::proxy::HttpProxy;
use crate::router::RouterTable;
use crate::service::{CompositeHealth, HealthAggregator, ServiceRegistry};
use crate::supervisor::{ProcessEvent, Supervisor};
use crate::GatewayState;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Hub topic values backed by the live gateway components
struct GatewayMetrics {
    system: SystemCollector,
    database: DatabaseProbe,
    health: Arc<HealthAggregator>,
    supervisor: Arc<Supervisor>,
}

#[async_trait]
impl MetricsSource for GatewayMetrics {
    async fn system_stats(&self) -> SystemStats {
        self.system.collect()
    }

    async fn database_status(&self) -> DatabaseStatus {
        self.database.check().await
    }

    async fn services_status(&self) -> ServicesStatus {
        let health = self.health.refresh().await;
        let targets: Vec<_> = self.supervisor.descriptors().cloned().collect();
        compose_services_status(&targets, &health, &self.supervisor.snapshot())
    }
}

/// The main Gateway: coordinates all components
pub struct Gateway {
    ctx: Arc<GatewayContext>,
    listen: ListenConfig,
    /// Shutdown flag
    shutdown: AtomicBool,
    /// Stops the accept loop and the event forwarder
    stop: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
    local_addr: RwLock<Option<SocketAddr>>,
}

impl Gateway {
    /// Create a new gateway from configuration
    ///
    /// Must be called inside a tokio runtime (the database probe pool is
    /// created lazily on it).
    pub fn new(config: GatewayConfig) -> Result<Self> {
        config.validate()?;

        let registry = ServiceRegistry::from_config(&config)?;
        let router_table = RouterTable::from_registry(&registry)?;
        tracing::info!(
            services = registry.len(),
            routes = router_table.len(),
            "Router table compiled"
        );

        let supervisor = Arc::new(Supervisor::new(
            registry.iter().cloned(),
            Duration::from_secs(config.supervisor.shutdown_grace_secs),
        ));
        let health = Arc::new(HealthAggregator::new(
            &registry,
            Duration::from_millis(config.health.timeout_ms),
        ));
        let database = DatabaseProbe::new(
            config.hub.database_url.as_deref(),
            Duration::from_millis(config.hub.database_timeout_ms),
        )?;

        let metrics = Arc::new(GatewayMetrics {
            system: SystemCollector::new(),
            database,
            health: health.clone(),
            supervisor: supervisor.clone(),
        });
        let hub = Arc::new(BroadcastHub::new(
            metrics,
            Duration::from_secs(config.hub.tick_interval_secs),
        ));

        let ctx = GatewayContext {
            router_table: Arc::new(router_table),
            http_proxy: HttpProxy::with_timeout(Duration::from_secs(config.proxy.timeout_secs)),
            health,
            hub,
            hub_path: config.hub.path.clone(),
            supervisor,
            access_log: AccessLog::new(),
            dashboard: DashboardApi::new("/status"),
            lifecycle: RwLock::new(GatewayState::Created),
            started_at: Instant::now(),
            bound_port: AtomicU16::new(0),
        };

        Ok(Self {
            ctx: Arc::new(ctx),
            listen: config.listen,
            shutdown: AtomicBool::new(false),
            stop: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
            local_addr: RwLock::new(None),
        })
    }

    /// Start services, bind the public port and begin accepting connections
    ///
    /// A service that fails to launch is logged and left `Failed`; only a
    /// bind failure aborts startup. Returns the address actually bound.
    pub async fn start(&self) -> Result<SocketAddr> {
        self.set_state(GatewayState::Starting);

        let forwarder = self.forward_process_events();
        self.push_handle(forwarder);

        for (name, result) in self.ctx.supervisor.start_all().await {
            if let Err(e) = result {
                tracing::error!(service = name, error = %e, "Service failed to start");
            }
        }

        let (listener, addr) = entrypoint::bind_with_fallback(
            &self.listen.host,
            self.listen.port,
            self.listen.max_port_retries,
        )
        .await?;

        self.ctx.bound_port.store(addr.port(), Ordering::Relaxed);
        *self.local_addr.write().unwrap_or_else(|e| e.into_inner()) = Some(addr);

        let accept = entrypoint::serve(listener, self.ctx.clone(), self.stop.clone());
        self.push_handle(accept);

        self.set_state(GatewayState::Running);
        tracing::info!(address = %addr, port = addr.port(), "Gateway listening");

        Ok(addr)
    }

    /// Initiate graceful shutdown
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return; // Already shutting down
        }

        self.set_state(GatewayState::Stopping);
        tracing::info!("Gateway shutting down");

        self.stop.cancel();
        let handles = std::mem::take(&mut *self.handles.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            let _ = handle.await;
        }

        self.ctx.hub.shutdown();
        self.ctx.supervisor.terminate_all().await;

        self.set_state(GatewayState::Stopped);
        tracing::info!("Gateway stopped");
    }

    /// Wait for Ctrl+C or SIGTERM, then shut down
    pub async fn wait_for_shutdown(&self) {
        shutdown_signal().await;
        self.shutdown().await;
    }

    /// Get the current gateway state
    pub fn state(&self) -> GatewayState {
        self.ctx.state()
    }

    /// Check if the gateway is running
    pub fn is_running(&self) -> bool {
        self.state() == GatewayState::Running
    }

    /// Check if shutdown has been requested
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Address the listener is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Composite health from the latest probes (no probing)
    pub fn health(&self) -> CompositeHealth {
        self.ctx.health.composite()
    }

    /// Request counters from the access log
    pub fn access_stats(&self) -> AccessStats {
        self.ctx.access_log.stats()
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.ctx.supervisor
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.ctx.hub
    }

    /// Publish supervisor lifecycle events on the `notifications` topic
    fn forward_process_events(&self) -> JoinHandle<()> {
        let mut events = self.ctx.supervisor.subscribe();
        let hub = self.ctx.hub.clone();
        let stop = self.stop.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = stop.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(event) => publish_event(&hub, &event),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Process event forwarder lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn push_handle(&self, handle: JoinHandle<()>) {
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    fn set_state(&self, new_state: GatewayState) {
        let old = self.ctx.set_state(new_state);
        tracing::debug!(from = %old, to = %new_state, "State transition");
    }
}

fn publish_event(hub: &BroadcastHub, event: &ProcessEvent) {
    match serde_json::to_value(event) {
        Ok(payload) => {
            let delivered = hub.broadcast(Topic::Notifications, ServerMessage::notification(payload));
            tracing::debug!(delivered, "Process event published");
        }
        Err(e) => tracing::warn!(error = %e, "Failed to encode process event"),
    }
}

/// Resolves on Ctrl+C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::tests::make_config;
    use crate::supervisor::ProcessStatus;

    fn local_config(services: &[(&str, &str, u16)]) -> GatewayConfig {
        let mut config = make_config(services);
        config.listen.host = "127.0.0.1".to_string();
        config.listen.port = 0;
        config.health.timeout_ms = 300;
        config
    }

    #[tokio::test]
    async fn test_gateway_new() {
        let gw = Gateway::new(local_config(&[("brands", "/brands", 5000)])).unwrap();
        assert_eq!(gw.state(), GatewayState::Created);
        assert!(!gw.is_running());
        assert!(gw.local_addr().is_none());
        assert_eq!(gw.supervisor().descriptors().count(), 1);
    }

    #[tokio::test]
    async fn test_gateway_new_invalid_config() {
        let config = local_config(&[("a", "/same", 5000), ("b", "/same", 5001)]);
        assert!(Gateway::new(config).is_err());
    }

    #[tokio::test]
    async fn test_gateway_new_rejects_bad_database_url() {
        let mut config = local_config(&[]);
        config.hub.database_url = Some("not a url".to_string());
        assert!(Gateway::new(config).is_err());
    }

    #[tokio::test]
    async fn test_gateway_start_and_shutdown() {
        let gw = Gateway::new(local_config(&[("wallet", "/wallet", 1)])).unwrap();
        let addr = gw.start().await.unwrap();
        assert!(gw.is_running());
        assert_eq!(gw.local_addr(), Some(addr));

        let resp = reqwest::get(format!("http://{}/health", addr)).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "degraded");
        assert_eq!(gw.access_stats().total_requests, 1);

        gw.shutdown().await;
        assert_eq!(gw.state(), GatewayState::Stopped);
        assert!(gw.is_shutdown());
        assert!(reqwest::get(format!("http://{}/health", addr)).await.is_err());
    }

    #[tokio::test]
    async fn test_gateway_double_shutdown() {
        let gw = Gateway::new(local_config(&[])).unwrap();
        gw.start().await.unwrap();
        gw.shutdown().await;
        gw.shutdown().await;
        assert_eq!(gw.state(), GatewayState::Stopped);
    }

    #[tokio::test]
    async fn test_spawn_failure_does_not_abort_start() {
        let mut config = local_config(&[("broken", "/broken", 5010)]);
        if let Some(svc) = config.services.get_mut("broken") {
            svc.command = Some("/nonexistent/multigate-test-binary".to_string());
            svc.autostart = true;
        }

        let gw = Gateway::new(config).unwrap();
        gw.start().await.unwrap();
        let handle = gw.supervisor().status("broken").unwrap();
        assert_eq!(handle.status, ProcessStatus::Failed);
        assert!(handle.last_error.is_some());
        gw.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_exit_published_as_notification() {
        let mut config = local_config(&[("short", "/short", 5011)]);
        if let Some(svc) = config.services.get_mut("short") {
            svc.command = Some("sh".to_string());
            svc.args = vec!["-c".to_string(), "sleep 0.2; exit 3".to_string()];
            svc.autostart = true;
        }
        let gw = Gateway::new(config).unwrap();

        let (id, mut rx) = gw.hub().connect();
        gw.hub()
            .set_topics(id, [Topic::Notifications].into_iter().collect());
        gw.start().await.unwrap();

        let exited = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(msg) = rx.recv().await {
                if let ServerMessage::Notification { data, .. } = msg {
                    if data["event"] == "exited" {
                        return data;
                    }
                }
            }
            panic!("hub queue closed before the exit notification");
        })
        .await
        .unwrap();

        assert_eq!(exited["service"], "short");
        assert_eq!(exited["exitCode"], 3);
        assert_eq!(exited["requested"], false);
        gw.shutdown().await;
    }
}
