//! Entrypoint: the public listener and per-request dispatch
//!
//! Binds the gateway port (walking forward when it is taken), accepts
//! connections and sends each request to the hub, the health document, the
//! status API or the reverse proxy.

use crate::dashboard::{DashboardApi, DashboardResponse};
use crate::error::{GatewayError, Result};
use crate::hub::{serve_connection, BroadcastHub};
use crate::observability::{AccessLog, RequestKind};
use crate::proxy::websocket::{
    accept_key, accept_upgrade, bad_handshake, is_websocket_upgrade, proxy_upgrade,
    switching_protocols,
};
use crate::proxy::{full, json_response, HttpProxy, ResponseBody};
use crate::router::RouterTable;
use crate::service::{CompositeStatus, HealthAggregator, ServiceDescriptor};
use crate::supervisor::Supervisor;
use crate::GatewayState;
use http::header::{HeaderValue, CONTENT_TYPE, UPGRADE};
use http::{Method, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Shared state for request handling
pub(crate) struct GatewayContext {
    pub router_table: Arc<RouterTable>,
    pub http_proxy: HttpProxy,
    pub health: Arc<HealthAggregator>,
    pub hub: Arc<BroadcastHub>,
    /// Upgrade path served by the hub instead of the proxy
    pub hub_path: String,
    pub supervisor: Arc<Supervisor>,
    pub access_log: AccessLog,
    pub dashboard: DashboardApi,
    pub lifecycle: RwLock<GatewayState>,
    pub started_at: Instant,
    /// 0 until the listener is bound
    pub bound_port: AtomicU16,
}

impl GatewayContext {
    pub fn state(&self) -> GatewayState {
        *self.lifecycle.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the lifecycle state, returning the previous one
    pub fn set_state(&self, state: GatewayState) -> GatewayState {
        let mut current = self.lifecycle.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *current, state)
    }

    pub fn bound_port(&self) -> Option<u16> {
        match self.bound_port.load(Ordering::Relaxed) {
            0 => None,
            port => Some(port),
        }
    }
}

/// Bind `host:port`, moving to the next port while the current one is in use
///
/// Tries at most `max_retries` ports after the preferred one. Errors other
/// than "address in use" are returned immediately.
pub async fn bind_with_fallback(
    host: &str,
    port: u16,
    max_retries: u16,
) -> Result<(TcpListener, SocketAddr)> {
    let last = port.saturating_add(max_retries);

    for candidate in port..=last {
        match TcpListener::bind((host, candidate)).await {
            Ok(listener) => {
                let addr = listener.local_addr()?;
                if candidate != port {
                    tracing::info!(
                        preferred = port,
                        port = addr.port(),
                        "Preferred port unavailable, using fallback"
                    );
                }
                return Ok((listener, addr));
            }
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                tracing::warn!(port = candidate, "Port already in use");
            }
            Err(e) => {
                return Err(GatewayError::Other(format!(
                    "Failed to bind {}:{}: {}",
                    host, candidate, e
                )));
            }
        }
    }

    Err(GatewayError::PortsExhausted { first: port, last })
}

/// Run the accept loop until `shutdown` is cancelled
pub(crate) fn serve(
    listener: TcpListener,
    ctx: Arc<GatewayContext>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (stream, remote_addr) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to accept connection");
                        continue;
                    }
                },
            };

            let ctx = ctx.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let result = http1::Builder::new()
                    .serve_connection(
                        io,
                        service_fn(|req| handle_http_request(req, remote_addr, ctx.clone())),
                    )
                    .with_upgrades()
                    .await;
                if let Err(e) = result {
                    tracing::debug!(client = %remote_addr, error = %e, "Connection closed with error");
                }
            });
        }
        tracing::debug!("Accept loop stopped");
    })
}

/// Handle an individual HTTP request and log it
async fn handle_http_request(
    req: Request<Incoming>,
    remote_addr: SocketAddr,
    ctx: Arc<GatewayContext>,
) -> std::result::Result<Response<ResponseBody>, Infallible> {
    let tracker = ctx.access_log.start_request();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let (response, kind, target) = dispatch(req, remote_addr, &ctx).await;

    let entry = tracker.build_entry(
        Some(remote_addr),
        &method,
        &path,
        response.status().as_u16(),
        kind,
        target.as_ref().map(|t| (t.name.as_str(), t.base_url())),
    );
    ctx.access_log.record(&entry);

    Ok(response)
}

async fn dispatch(
    req: Request<Incoming>,
    remote_addr: SocketAddr,
    ctx: &GatewayContext,
) -> (Response<ResponseBody>, RequestKind, Option<Arc<ServiceDescriptor>>) {
    let path = req.uri().path();

    if path == ctx.hub_path {
        return (hub_upgrade(req, ctx), RequestKind::Hub, None);
    }
    if path == "/health" {
        return (health_response(ctx).await, RequestKind::Health, None);
    }
    if ctx.dashboard.matches(path) {
        return (status_response(&req, ctx), RequestKind::Status, None);
    }

    let Some(route) = ctx.router_table.route(path) else {
        let resp = json_response(
            StatusCode::NOT_FOUND,
            &serde_json::json!({ "error": "Not Found", "path": path }),
        );
        return (resp, RequestKind::NotFound, None);
    };

    let target = route.target.clone();
    if is_websocket_upgrade(req.headers()) {
        let resp = proxy_upgrade(route, req, ctx.http_proxy.timeout()).await;
        (resp, RequestKind::WebSocket, Some(target))
    } else {
        let resp = ctx.http_proxy.handle(route, req, Some(remote_addr)).await;
        (resp, RequestKind::Proxy, Some(target))
    }
}

/// Accept a hub WebSocket and hand the upgraded socket to the hub
fn hub_upgrade(mut req: Request<Incoming>, ctx: &GatewayContext) -> Response<ResponseBody> {
    if !is_websocket_upgrade(req.headers()) {
        let mut resp = json_response(
            StatusCode::UPGRADE_REQUIRED,
            &serde_json::json!({
                "error": "Upgrade Required",
                "detail": format!("{} only accepts WebSocket connections", ctx.hub_path),
            }),
        );
        resp.headers_mut()
            .insert(UPGRADE, HeaderValue::from_static("websocket"));
        return resp;
    }
    let Some(accept) = accept_key(req.headers()) else {
        return bad_handshake();
    };

    let response = match switching_protocols(&accept, None) {
        Ok(resp) => resp,
        Err(e) => {
            tracing::error!(error = %e, "Failed to build hub handshake");
            return json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &serde_json::json!({ "error": "Internal Server Error" }),
            );
        }
    };

    let on_upgrade = hyper::upgrade::on(&mut req);
    let hub = ctx.hub.clone();
    tokio::spawn(async move {
        match accept_upgrade(on_upgrade).await {
            Ok(ws) => serve_connection(hub, ws).await,
            Err(e) => tracing::warn!(error = %e, "Hub upgrade failed"),
        }
    });

    response
}

/// Probe every service and serve the composite document (503 when offline)
async fn health_response(ctx: &GatewayContext) -> Response<ResponseBody> {
    ctx.health.refresh().await;
    let composite = ctx.health.composite();
    let status = match composite.status {
        CompositeStatus::Offline => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    json_response(status, &composite)
}

fn status_response(req: &Request<Incoming>, ctx: &GatewayContext) -> Response<ResponseBody> {
    if req.method() != Method::GET && req.method() != Method::HEAD {
        return json_response(
            StatusCode::METHOD_NOT_ALLOWED,
            &serde_json::json!({ "error": "Method Not Allowed" }),
        );
    }

    let resp = ctx
        .dashboard
        .handle(req.uri().path(), ctx)
        .unwrap_or_else(|| DashboardResponse::not_found("Not found"));

    let mut response = Response::new(full(resp.body));
    *response.status_mut() =
        StatusCode::from_u16(resp.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if let Ok(content_type) = HeaderValue::from_str(&resp.content_type) {
        response.headers_mut().insert(CONTENT_TYPE, content_type);
    }
    response
}
