//! Status API: read-only JSON views of the running gateway
//!
//! Served under `/status`: the gateway summary, every service with its
//! process and health state, and the route table.

use crate::entrypoint::GatewayContext;
use crate::hub::Topic;
use crate::observability::AccessStats;
use crate::router::{prefix_matches, RouteInfo};
use crate::service::{CompositeStatus, ServiceHealthState};
use crate::supervisor::ProcessStatus;
use crate::GatewayState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

/// Summary served at `/status`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStatus {
    pub name: &'static str,
    pub version: &'static str,
    pub state: GatewayState,
    pub uptime_secs: u64,
    /// Port actually bound (may differ from the configured one)
    pub port: Option<u16>,
    /// Composite status from the latest health poll
    pub health: CompositeStatus,
    pub services: usize,
    pub routes: usize,
    pub hub: HubStatus,
    pub requests: AccessStats,
}

/// Hub counters
#[derive(Debug, Clone, Serialize)]
pub struct HubStatus {
    pub path: String,
    pub connections: usize,
    pub subscribers: BTreeMap<Topic, usize>,
}

/// One service with its process and health state
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    pub name: String,
    pub path_prefix: String,
    pub upstream: String,
    pub rewrite: String,
    /// Whether the gateway launches this service itself
    pub managed: bool,
    pub autostart: bool,
    pub process: Option<ProcessStatus>,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub health: ServiceHealthState,
}

/// Gateway version information
#[derive(Debug, Clone, Serialize)]
pub struct VersionInfo {
    pub name: &'static str,
    pub version: &'static str,
}

impl VersionInfo {
    pub(crate) fn current() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

// ---------------------------------------------------------------------------
// Dashboard API handler
// ---------------------------------------------------------------------------

/// Status API handler
pub struct DashboardApi {
    /// Path prefix for the API
    pub path_prefix: String,
}

impl DashboardApi {
    pub fn new(path_prefix: impl Into<String>) -> Self {
        Self {
            path_prefix: path_prefix.into(),
        }
    }

    /// Check if a request path belongs to the API
    pub fn matches(&self, path: &str) -> bool {
        prefix_matches(&self.path_prefix, path)
    }

    /// Handle a status API request
    pub(crate) fn handle(&self, path: &str, ctx: &GatewayContext) -> Option<DashboardResponse> {
        let sub_path = path.strip_prefix(&self.path_prefix)?;

        match sub_path {
            "" | "/" => Some(DashboardResponse::json(200, &gateway_status(ctx))),
            "/services" | "/services/" => Some(DashboardResponse::json(200, &services(ctx))),
            "/routes" | "/routes/" => {
                Some(DashboardResponse::json(200, &ctx.router_table.routes_info()))
            }
            "/version" | "/version/" => Some(DashboardResponse::json(200, &VersionInfo::current())),
            s if s.starts_with("/services/") => {
                let name = s["/services/".len()..].trim_end_matches('/');
                match services(ctx).into_iter().find(|svc| svc.name == name) {
                    Some(svc) => Some(DashboardResponse::json(200, &svc)),
                    None => Some(DashboardResponse::not_found("Service not found")),
                }
            }
            _ => Some(DashboardResponse::not_found("Not found")),
        }
    }
}

fn gateway_status(ctx: &GatewayContext) -> GatewayStatus {
    let version = VersionInfo::current();
    let routes: Vec<RouteInfo> = ctx.router_table.routes_info();
    GatewayStatus {
        name: version.name,
        version: version.version,
        state: ctx.state(),
        uptime_secs: ctx.started_at.elapsed().as_secs(),
        port: ctx.bound_port(),
        health: ctx.health.composite().status,
        services: ctx.supervisor.descriptors().count(),
        routes: routes.len(),
        hub: HubStatus {
            path: ctx.hub_path.clone(),
            connections: ctx.hub.connection_count(),
            subscribers: Topic::ALL
                .into_iter()
                .map(|topic| (topic, ctx.hub.subscriber_count(topic)))
                .collect(),
        },
        requests: ctx.access_log.stats(),
    }
}

fn services(ctx: &GatewayContext) -> Vec<ServiceInfo> {
    let health = ctx.health.latest();
    ctx.supervisor
        .descriptors()
        .map(|d| {
            let handle = ctx.supervisor.status(&d.name);
            let health = ServiceHealthState::from_snapshot(health.get(&d.name));
            ServiceInfo {
                name: d.name.clone(),
                path_prefix: d.path_prefix.clone(),
                upstream: d.base_url(),
                rewrite: d.rewrite.to_string(),
                managed: d.spawn_command.is_some(),
                autostart: d.autostart,
                process: handle.as_ref().map(|h| h.status),
                pid: handle.as_ref().and_then(|h| h.pid),
                exit_code: handle.as_ref().and_then(|h| h.exit_code),
                last_error: handle.as_ref().and_then(|h| h.last_error.clone()),
                started_at: handle.as_ref().and_then(|h| h.started_at),
                health,
            }
        })
        .collect()
}

/// Response from the status API
#[derive(Debug, Clone)]
pub struct DashboardResponse {
    /// HTTP status code
    pub status: u16,
    /// Content-Type header
    pub content_type: String,
    /// Response body
    pub body: String,
}

impl DashboardResponse {
    pub(crate) fn json<T: Serialize>(status: u16, value: &T) -> Self {
        Self {
            status,
            content_type: "application/json".to_string(),
            body: serde_json::to_string_pretty(value).unwrap_or_default(),
        }
    }

    pub(crate) fn not_found(message: &str) -> Self {
        Self::json(404, &serde_json::json!({ "error": message }))
    }
}
