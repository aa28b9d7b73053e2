//! Metric sources behind the hub topics
//!
//! `system` comes from the gateway process itself (sysinfo), `database` from
//! a single `SELECT 1` probe, and `services` from the health aggregator plus
//! the supervisor's process table.

use crate::error::{GatewayError, Result};
use crate::service::{HealthSnapshot, ServiceDescriptor, ServiceHealthState};
use crate::supervisor::{ProcessStatus, ServiceProcessHandle};
use async_trait::async_trait;
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sysinfo::{ProcessesToUpdate, System};

/// Payload of `system-stats`
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStats {
    pub pid: u32,
    /// Gateway process uptime
    pub uptime_secs: u64,
    /// Resident set size of the gateway process
    pub memory_rss_bytes: u64,
    pub memory_virtual_bytes: u64,
    pub system_memory_used_bytes: u64,
    pub system_memory_total_bytes: u64,
    pub system_uptime_secs: u64,
    pub cpu_count: usize,
}

/// Payload of `database-status`
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseStatus {
    /// False when no database URL is configured
    pub configured: bool,
    pub reachable: bool,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

/// One service's entry in `services-status`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub upstream: String,
    pub health: ServiceHealthState,
    pub latency_ms: Option<u64>,
    /// None when the gateway does not manage the process
    pub process: Option<ProcessStatus>,
    pub pid: Option<u32>,
}

/// Payload of `services-status`, keyed by service name
pub type ServicesStatus = BTreeMap<String, ServiceStatus>;

/// Where the hub gets topic values from
///
/// Each method is called at most once per tick regardless of how many
/// connections are subscribed.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn system_stats(&self) -> SystemStats;
    async fn database_status(&self) -> DatabaseStatus;
    async fn services_status(&self) -> ServicesStatus;
}

/// Samples the gateway process with sysinfo
pub struct SystemCollector {
    system: Mutex<System>,
    started: Instant,
}

impl SystemCollector {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            started: Instant::now(),
        }
    }

    /// Take one sample
    pub fn collect(&self) -> SystemStats {
        let mut sys = self.system.lock().unwrap_or_else(|e| e.into_inner());
        sys.refresh_memory();

        let mut stats = SystemStats {
            uptime_secs: self.started.elapsed().as_secs(),
            system_memory_used_bytes: sys.used_memory(),
            system_memory_total_bytes: sys.total_memory(),
            system_uptime_secs: System::uptime(),
            cpu_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            ..SystemStats::default()
        };

        if let Ok(pid) = sysinfo::get_current_pid() {
            sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
            stats.pid = pid.as_u32();
            if let Some(process) = sys.process(pid) {
                stats.memory_rss_bytes = process.memory();
                stats.memory_virtual_bytes = process.virtual_memory();
            }
        }

        stats
    }
}

impl Default for SystemCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Database reachability probe: one trivial query, nothing else
pub struct DatabaseProbe {
    pool: Option<PgPool>,
    timeout: Duration,
}

impl DatabaseProbe {
    /// Build a probe; the pool connects lazily on first check
    pub fn new(database_url: Option<&str>, timeout: Duration) -> Result<Self> {
        let pool = database_url
            .map(|url| {
                PgPoolOptions::new()
                    .max_connections(1)
                    .acquire_timeout(timeout)
                    .connect_lazy(url)
            })
            .transpose()
            .map_err(|e| GatewayError::Config(format!("Invalid database_url: {}", e)))?;

        Ok(Self { pool, timeout })
    }

    pub fn is_configured(&self) -> bool {
        self.pool.is_some()
    }

    /// Run `SELECT 1` bounded by the probe timeout
    pub async fn check(&self) -> DatabaseStatus {
        let Some(pool) = &self.pool else {
            return DatabaseStatus::default();
        };

        let start = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, sqlx::query("SELECT 1").execute(pool)).await;
        let latency_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(_)) => DatabaseStatus {
                configured: true,
                reachable: true,
                latency_ms: Some(latency_ms),
                error: None,
            },
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "Database probe failed");
                DatabaseStatus {
                    configured: true,
                    reachable: false,
                    latency_ms: None,
                    error: Some(e.to_string()),
                }
            }
            Err(_) => DatabaseStatus {
                configured: true,
                reachable: false,
                latency_ms: None,
                error: Some(format!(
                    "Probe timed out after {}ms",
                    self.timeout.as_millis()
                )),
            },
        }
    }
}

/// Merge health snapshots and process handles into the `services-status` payload
pub fn compose_services_status(
    targets: &[Arc<ServiceDescriptor>],
    health: &HashMap<String, HealthSnapshot>,
    processes: &[ServiceProcessHandle],
) -> ServicesStatus {
    targets
        .iter()
        .map(|target| {
            let snap = health.get(&target.name);
            let handle = processes.iter().find(|h| h.service == target.name);
            let health = ServiceHealthState::from_snapshot(snap);
            (
                target.name.clone(),
                ServiceStatus {
                    upstream: target.base_url(),
                    health,
                    latency_ms: snap.filter(|s| s.reachable).map(|s| s.latency_ms),
                    process: handle.map(|h| h.status),
                    pid: handle.and_then(|h| h.pid),
                },
            )
        })
        .collect()
}
