//! WebSocket proxy: bidirectional relay between client and upstream
//!
//! The upstream socket is opened first so a dead service is reported as a
//! plain 502 instead of a half-open upgrade. Only after that does the gateway
//! answer `101 Switching Protocols` and splice the two sockets together.

use super::{
    is_hop_by_hop, json_response, upstream_error_response, ResponseBody, ORIGINAL_PATH_HEADER,
    PROXIED_BY, PROXIED_BY_HEADER,
};
use crate::error::{GatewayError, Result};
use crate::router::ProxyRoute;
use futures_util::{SinkExt, StreamExt};
use http::header::{
    HeaderValue, CONNECTION, HOST, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_EXTENSIONS,
    SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL, SEC_WEBSOCKET_VERSION, UPGRADE,
};
use http::{HeaderMap, Request, Response, StatusCode};
use hyper::upgrade::{OnUpgrade, Upgraded};
use hyper_util::rt::TokioIo;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Server side of an upgraded client connection
pub type ServerSocket = WebSocketStream<TokioIo<Upgraded>>;

/// Client side of an upstream connection
pub type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Check if an HTTP request is a WebSocket upgrade request
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Build the upstream WebSocket URL from the service URL and rewritten URI
pub fn build_ws_url(base_url: &str, uri: &http::Uri) -> String {
    let base = base_url.trim_end_matches('/');
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    // Convert http(s) to ws(s)
    let ws_url = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else {
        format!("ws://{}", base)
    };

    format!("{}{}", ws_url, path)
}

/// `Sec-WebSocket-Accept` value for the client's handshake, if it sent a key
pub fn accept_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SEC_WEBSOCKET_KEY)
        .map(|key| derive_accept_key(key.as_bytes()))
}

/// `101 Switching Protocols` response completing the server handshake
pub fn switching_protocols(
    accept: &str,
    protocol: Option<HeaderValue>,
) -> Result<Response<ResponseBody>> {
    let mut builder = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(CONNECTION, "Upgrade")
        .header(UPGRADE, "websocket")
        .header(SEC_WEBSOCKET_ACCEPT, accept);
    if let Some(protocol) = protocol {
        builder = builder.header(SEC_WEBSOCKET_PROTOCOL, protocol);
    }
    builder
        .body(super::empty())
        .map_err(|e| GatewayError::Other(format!("Invalid upgrade response: {}", e)))
}

/// 400 for an upgrade request without a handshake key
pub fn bad_handshake() -> Response<ResponseBody> {
    json_response(
        StatusCode::BAD_REQUEST,
        &serde_json::json!({
            "error": "Bad Request",
            "detail": "Missing Sec-WebSocket-Key header",
        }),
    )
}

/// Wait for hyper to hand over the upgraded connection and wrap it
pub async fn accept_upgrade(on_upgrade: OnUpgrade) -> Result<ServerSocket> {
    let upgraded = on_upgrade
        .await
        .map_err(|e| GatewayError::Other(format!("WebSocket upgrade failed: {}", e)))?;
    Ok(WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await)
}

/// Relay messages bidirectionally between two WebSocket streams
pub async fn relay_websocket<C, U>(mut client: WebSocketStream<C>, mut upstream: WebSocketStream<U>)
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            msg = client.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        if msg.is_close() {
                            let _ = upstream.close(None).await;
                            break;
                        }
                        if upstream.send(msg).await.is_err() {
                            break;
                        }
                    }
                    _ => break,
                }
            }
            msg = upstream.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        if msg.is_close() {
                            let _ = client.close(None).await;
                            break;
                        }
                        if client.send(msg).await.is_err() {
                            break;
                        }
                    }
                    _ => break,
                }
            }
        }
    }

    // Best-effort close both sides
    let _ = client.close(None).await;
    let _ = upstream.close(None).await;
}

/// Connect to an upstream WebSocket server, passing selected client headers along
pub async fn connect_upstream(
    url: &str,
    client_headers: &HeaderMap,
    original_path: &str,
    timeout: Duration,
) -> Result<(UpstreamSocket, Option<HeaderValue>)> {
    let mut request = url
        .into_client_request()
        .map_err(|e| GatewayError::Other(format!("Invalid upstream WebSocket URL {}: {}", url, e)))?;

    let headers = request.headers_mut();
    for (key, value) in client_headers.iter() {
        if is_handshake_header(key) || is_hop_by_hop(key.as_str()) {
            continue;
        }
        headers.append(key.clone(), value.clone());
    }
    headers.insert(PROXIED_BY_HEADER, HeaderValue::from_static(PROXIED_BY));
    if let Ok(path) = HeaderValue::from_str(original_path) {
        headers.insert(ORIGINAL_PATH_HEADER, path);
    }

    let (ws_stream, response) = tokio::time::timeout(timeout, connect_async(request))
        .await
        .map_err(|_| GatewayError::UpstreamTimeout(timeout.as_millis() as u64))?
        .map_err(|e| {
            GatewayError::ServiceUnavailable(format!("WebSocket upstream connection failed: {}", e))
        })?;

    let protocol = response.headers().get(SEC_WEBSOCKET_PROTOCOL).cloned();
    Ok((ws_stream, protocol))
}

/// Proxy a WebSocket upgrade request to the route's service
pub async fn proxy_upgrade<B>(
    route: &ProxyRoute,
    mut req: Request<B>,
    timeout: Duration,
) -> Response<ResponseBody> {
    let Some(accept) = accept_key(req.headers()) else {
        return bad_handshake();
    };

    let upstream_uri = route.upstream_uri(req.uri());
    let ws_url = build_ws_url(&route.target.base_url(), &upstream_uri);
    let (upstream, protocol) =
        match connect_upstream(&ws_url, req.headers(), req.uri().path(), timeout).await {
            Ok(connected) => connected,
            Err(e) => {
                tracing::warn!(
                    service = %route.target.name,
                    url = %ws_url,
                    error = %e,
                    "WebSocket upstream unavailable"
                );
                return upstream_error_response(&route.target.name, &e);
            }
        };

    let response = match switching_protocols(&accept, protocol) {
        Ok(resp) => resp,
        Err(e) => return upstream_error_response(&route.target.name, &e),
    };

    let on_upgrade = hyper::upgrade::on(&mut req);
    let service = route.target.name.clone();
    tokio::spawn(async move {
        match accept_upgrade(on_upgrade).await {
            Ok(client) => {
                tracing::debug!(service = %service, "WebSocket relay started");
                relay_websocket(client, upstream).await;
                tracing::debug!(service = %service, "WebSocket relay closed");
            }
            Err(e) => tracing::warn!(service = %service, error = %e, "WebSocket upgrade failed"),
        }
    });

    response
}

fn is_handshake_header(name: &http::header::HeaderName) -> bool {
    name == HOST
        || name == SEC_WEBSOCKET_KEY
        || name == SEC_WEBSOCKET_VERSION
        || name == SEC_WEBSOCKET_EXTENSIONS
        || name == SEC_WEBSOCKET_ACCEPT
        || name == http::header::CONTENT_LENGTH
}
