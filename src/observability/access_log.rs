//! Structured access log: one `access_log` event per handled request
//!
//! Besides emitting the event, the log keeps running totals that the status
//! API reports.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Instant;

/// How the gateway handled a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestKind {
    Proxy,
    WebSocket,
    Hub,
    Health,
    Status,
    NotFound,
}

impl RequestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Proxy => "proxy",
            Self::WebSocket => "websocket",
            Self::Hub => "hub",
            Self::Health => "health",
            Self::Status => "status",
            Self::NotFound => "not-found",
        }
    }
}

/// A single access log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessLogEntry {
    /// RFC 3339 timestamp
    pub timestamp: String,
    pub client_ip: String,
    pub method: String,
    /// Path as received, before rewriting
    pub path: String,
    pub status: u16,
    /// Time until response headers were ready
    pub duration_ms: u64,
    pub kind: RequestKind,
    /// Service the request was routed to
    pub service: Option<String>,
    /// Upstream base URL
    pub upstream: Option<String>,
}

/// Running totals for the status API
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessStats {
    pub total_requests: u64,
    pub status_2xx: u64,
    pub status_3xx: u64,
    pub status_4xx: u64,
    pub status_5xx: u64,
    pub by_service: BTreeMap<String, u64>,
}

/// Access log manager: emits entries and counts them
#[derive(Default)]
pub struct AccessLog {
    total_entries: AtomicU64,
    status_classes: [AtomicU64; 4],
    by_service: RwLock<BTreeMap<String, u64>>,
}

impl AccessLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a request
    pub fn start_request(&self) -> RequestTracker {
        RequestTracker {
            start: Instant::now(),
        }
    }

    /// Record and emit a log entry
    pub fn record(&self, entry: &AccessLogEntry) {
        self.total_entries.fetch_add(1, Ordering::Relaxed);
        if let Some(slot) = (entry.status / 100)
            .checked_sub(2)
            .and_then(|class| self.status_classes.get(class as usize))
        {
            slot.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(service) = &entry.service {
            let mut by_service = self.by_service.write().unwrap_or_else(|e| e.into_inner());
            *by_service.entry(service.clone()).or_insert(0) += 1;
        }

        tracing::info!(
            target: "access_log",
            client_ip = %entry.client_ip,
            method = %entry.method,
            path = %entry.path,
            status = entry.status,
            duration_ms = entry.duration_ms,
            kind = entry.kind.as_str(),
            service = entry.service.as_deref().unwrap_or("-"),
            upstream = entry.upstream.as_deref().unwrap_or("-"),
            "{} {} {}",
            entry.method,
            entry.path,
            entry.status
        );
    }

    /// Total number of logged entries
    pub fn total_entries(&self) -> u64 {
        self.total_entries.load(Ordering::Relaxed)
    }

    /// Copy of the running totals
    pub fn stats(&self) -> AccessStats {
        let class = |i: usize| self.status_classes[i].load(Ordering::Relaxed);
        AccessStats {
            total_requests: self.total_entries(),
            status_2xx: class(0),
            status_3xx: class(1),
            status_4xx: class(2),
            status_5xx: class(3),
            by_service: self
                .by_service
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }
}

/// Tracks request duration
pub struct RequestTracker {
    start: Instant,
}

impl RequestTracker {
    /// Milliseconds since the request started
    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Build an entry from the tracked request
    pub fn build_entry(
        &self,
        client: Option<SocketAddr>,
        method: &http::Method,
        path: &str,
        status: u16,
        kind: RequestKind,
        target: Option<(&str, String)>,
    ) -> AccessLogEntry {
        let (service, upstream) = match target {
            Some((service, upstream)) => (Some(service.to_string()), Some(upstream)),
            None => (None, None),
        };
        AccessLogEntry {
            timestamp: chrono::Utc::now().to_rfc3339(),
            client_ip: client
                .map(|addr| addr.ip().to_string())
                .unwrap_or_else(|| "-".to_string()),
            method: method.to_string(),
            path: path.to_string(),
            status,
            duration_ms: self.elapsed_ms(),
            kind,
            service,
            upstream,
        }
    }
}
