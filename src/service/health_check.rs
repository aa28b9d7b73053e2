//! Health aggregator: parallel HTTP probes folded into one composite status

use super::{ServiceDescriptor, ServiceRegistry};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// Latest probe result for one service
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub service_name: String,
    pub reachable: bool,
    pub latency_ms: u64,
    pub last_checked_at: DateTime<Utc>,
    /// Parsed JSON body of the health endpoint, or the failure reason
    pub detail: serde_json::Value,
}

/// Whole-system judgment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompositeStatus {
    Online,
    Degraded,
    Offline,
}

impl CompositeStatus {
    /// Fold per-service reachability into one status
    pub fn classify(reachable: impl IntoIterator<Item = bool>) -> Self {
        let (mut up, mut total) = (0usize, 0usize);
        for ok in reachable {
            total += 1;
            if ok {
                up += 1;
            }
        }
        if up == total {
            Self::Online
        } else if up > 0 {
            Self::Degraded
        } else {
            Self::Offline
        }
    }
}

/// Per-service entry of the `/health` document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceHealthState {
    Running,
    Unreachable,
    /// Never probed yet
    Unknown,
}

impl ServiceHealthState {
    /// State implied by a service's latest probe, if any
    pub fn from_snapshot(snapshot: Option<&HealthSnapshot>) -> Self {
        match snapshot {
            Some(snap) if snap.reachable => Self::Running,
            Some(_) => Self::Unreachable,
            None => Self::Unknown,
        }
    }
}

/// Document served at `/health`
#[derive(Debug, Clone, Serialize)]
pub struct CompositeHealth {
    pub status: CompositeStatus,
    pub services: BTreeMap<String, ServiceHealthState>,
    pub timestamp: DateTime<Utc>,
}

/// Polls every service's health endpoint and keeps the latest snapshot per service
pub struct HealthAggregator {
    targets: Vec<Arc<ServiceDescriptor>>,
    client: reqwest::Client,
    timeout: Duration,
    latest: RwLock<HashMap<String, HealthSnapshot>>,
}

impl HealthAggregator {
    /// Create an aggregator covering every registered service
    pub fn new(registry: &ServiceRegistry, timeout: Duration) -> Self {
        Self::with_targets(registry.iter().cloned().collect(), timeout)
    }

    /// Create an aggregator for an explicit target list
    pub fn with_targets(targets: Vec<Arc<ServiceDescriptor>>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .build()
            .unwrap_or_default();

        Self {
            targets,
            client,
            timeout,
            latest: RwLock::new(HashMap::new()),
        }
    }

    /// Default per-probe timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Probe every service with the default timeout
    pub async fn refresh(&self) -> HashMap<String, HealthSnapshot> {
        self.poll_all(self.timeout).await
    }

    /// Probe every service in parallel, each bounded by `timeout`
    ///
    /// A failing probe yields `reachable = false`; it never aborts the others.
    pub async fn poll_all(&self, timeout: Duration) -> HashMap<String, HealthSnapshot> {
        let probes = self
            .targets
            .iter()
            .map(|target| probe(&self.client, target, timeout));
        let results: HashMap<String, HealthSnapshot> = join_all(probes)
            .await
            .into_iter()
            .map(|snap| (snap.service_name.clone(), snap))
            .collect();

        let mut latest = self.latest.write().unwrap_or_else(|e| e.into_inner());
        for (name, snap) in &results {
            latest.insert(name.clone(), snap.clone());
        }

        results
    }

    /// Latest snapshot per service (no probing)
    pub fn latest(&self) -> HashMap<String, HealthSnapshot> {
        self.latest
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Compose the `/health` document from the latest snapshots
    ///
    /// The gateway answering this call counts as one reachable member, so a
    /// gateway whose services are all down reports `degraded`, not `offline`.
    pub fn composite(&self) -> CompositeHealth {
        let latest = self.latest.read().unwrap_or_else(|e| e.into_inner());

        let services: BTreeMap<String, ServiceHealthState> = self
            .targets
            .iter()
            .map(|target| {
                let state = ServiceHealthState::from_snapshot(latest.get(&target.name));
                (target.name.clone(), state)
            })
            .collect();

        let status = CompositeStatus::classify(
            std::iter::once(true).chain(
                services
                    .values()
                    .map(|state| *state == ServiceHealthState::Running),
            ),
        );

        CompositeHealth {
            status,
            services,
            timestamp: Utc::now(),
        }
    }
}

/// Probe one service's health endpoint
async fn probe(
    client: &reqwest::Client,
    target: &ServiceDescriptor,
    timeout: Duration,
) -> HealthSnapshot {
    let url = target.health_url();
    let start = Instant::now();

    let outcome = match client.get(&url).timeout(timeout).send().await {
        Ok(resp) => {
            let status = resp.status();
            let detail = match resp.bytes().await {
                Ok(body) => serde_json::from_slice(&body)
                    .unwrap_or_else(|_| serde_json::json!({ "httpStatus": status.as_u16() })),
                Err(e) => serde_json::json!({ "httpStatus": status.as_u16(), "error": e.to_string() }),
            };
            (status.is_success(), detail)
        }
        Err(e) => {
            let reason = if e.is_timeout() {
                format!("timed out after {}ms", timeout.as_millis())
            } else {
                e.to_string()
            };
            tracing::debug!(service = target.name, url, error = %reason, "Health probe failed");
            (false, serde_json::json!({ "error": reason }))
        }
    };

    HealthSnapshot {
        service_name: target.name.clone(),
        reachable: outcome.0,
        latency_ms: start.elapsed().as_millis() as u64,
        last_checked_at: Utc::now(),
        detail: outcome.1,
    }
}
