//! HTTP reverse proxy: forwards requests to upstream services
//!
//! Request and response bodies are streamed, never buffered whole. Upstream
//! failures become a JSON 502 naming the service so one dead process never
//! takes the gateway down with it.

use super::{
    is_hop_by_hop, json_response, ResponseBody, ORIGINAL_PATH_HEADER, PROXIED_BY,
    PROXIED_BY_HEADER,
};
use crate::error::{GatewayError, Result};
use crate::router::ProxyRoute;
use bytes::Bytes;
use futures_util::TryStreamExt;
use http::header::{HeaderValue, HOST};
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Body, Frame};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;

/// HTTP reverse proxy
pub struct HttpProxy {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpProxy {
    /// Create a new HTTP proxy with default settings
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    /// Create a new HTTP proxy with custom timeout
    ///
    /// The timeout bounds connecting and waiting for response headers. While a
    /// request body is still uploading it applies per chunk instead, so a slow
    /// but steady upload is never cut off; the response body is not bounded.
    pub fn with_timeout(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(32)
            .build()
            .unwrap_or_default();

        Self { client, timeout }
    }

    /// Configured upstream timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Forward a request, turning any upstream failure into a 502/504 response
    pub async fn handle<B>(
        &self,
        route: &ProxyRoute,
        req: Request<B>,
        client_addr: Option<SocketAddr>,
    ) -> Response<ResponseBody>
    where
        B: Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>> + Send,
    {
        match self.forward(route, req, client_addr).await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(
                    service = %route.target.name,
                    upstream = %route.target.base_url(),
                    error = %e,
                    "Upstream request failed"
                );
                upstream_error_response(&route.target.name, &e)
            }
        }
    }

    /// Forward a request to the route's service
    pub async fn forward<B>(
        &self,
        route: &ProxyRoute,
        req: Request<B>,
        client_addr: Option<SocketAddr>,
    ) -> Result<Response<ResponseBody>>
    where
        B: Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>> + Send,
    {
        let (parts, body) = req.into_parts();
        let target = &route.target;

        let upstream_uri = route.upstream_uri(&parts.uri);
        let path_and_query = upstream_uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let upstream_url = format!("{}{}", target.base_url(), path_and_query);

        let mut req_builder = self.client.request(parts.method.clone(), &upstream_url);

        // Forward headers (skip hop-by-hop headers and Host)
        for (key, value) in parts.headers.iter() {
            if key == HOST || is_hop_by_hop(key.as_str()) {
                continue;
            }
            req_builder = req_builder.header(key.clone(), value.clone());
        }

        req_builder = req_builder
            .header(PROXIED_BY_HEADER, PROXIED_BY)
            .header(ORIGINAL_PATH_HEADER, parts.uri.path())
            .header("x-forwarded-proto", "http");
        if let Some(host) = parts.headers.get(HOST) {
            req_builder = req_builder.header("x-forwarded-host", host.clone());
        }
        if let Some(addr) = client_addr {
            let forwarded_for = match parts
                .headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
            {
                Some(prior) => format!("{}, {}", prior, addr.ip()),
                None => addr.ip().to_string(),
            };
            req_builder = req_builder.header("x-forwarded-for", forwarded_for);
        }

        let mut upload = None;
        if body.size_hint().exact() != Some(0) {
            let (stream, progress) = stream_body(body);
            req_builder = req_builder.body(reqwest::Body::wrap_stream(stream));
            upload = Some(progress);
        }

        let response = self
            .await_response(req_builder.send(), upload)
            .await?
            .map_err(|e| {
                if e.is_timeout() {
                    self.timeout_error()
                } else if e.is_connect() {
                    GatewayError::ServiceUnavailable(format!(
                        "Cannot connect to {} at {}: {}",
                        target.name,
                        target.base_url(),
                        e
                    ))
                } else {
                    GatewayError::Http(e)
                }
            })?;

        let mut builder = Response::builder().status(response.status());
        if let Some(headers) = builder.headers_mut() {
            for (key, value) in response.headers().iter() {
                if !is_hop_by_hop(key.as_str()) {
                    headers.append(key.clone(), value.clone());
                }
            }
        }

        let body = StreamBody::new(
            response
                .bytes_stream()
                .map_ok(Frame::data)
                .map_err(GatewayError::Http),
        )
        .boxed_unsync();

        builder
            .body(body)
            .map_err(|e| GatewayError::Other(format!("Invalid upstream response: {}", e)))
    }
}

impl HttpProxy {
    /// Wait for response headers
    ///
    /// Until the request body is fully handed over, the deadline restarts on
    /// every chunk; after that it covers the wait for headers only.
    async fn await_response<F>(
        &self,
        send: F,
        upload: Option<watch::Receiver<bool>>,
    ) -> Result<reqwest::Result<reqwest::Response>>
    where
        F: std::future::Future<Output = reqwest::Result<reqwest::Response>>,
    {
        let mut send = std::pin::pin!(send);

        if let Some(mut progress) = upload {
            while !*progress.borrow_and_update() {
                tokio::select! {
                    res = &mut send => return Ok(res),
                    changed = tokio::time::timeout(self.timeout, progress.changed()) => {
                        match changed {
                            Err(_) => return Err(self.timeout_error()),
                            // Pump finished or gave up on an error
                            Ok(Err(_)) => break,
                            Ok(Ok(())) => {}
                        }
                    }
                }
            }
        }

        tokio::time::timeout(self.timeout, send)
            .await
            .map_err(|_| self.timeout_error())
    }

    fn timeout_error(&self) -> GatewayError {
        GatewayError::UpstreamTimeout(self.timeout.as_millis() as u64)
    }
}

impl Default for HttpProxy {
    fn default() -> Self {
        Self::new()
    }
}

/// JSON error response for a failed upstream call
pub fn upstream_error_response(service: &str, err: &GatewayError) -> Response<ResponseBody> {
    let (status, error) = match err {
        GatewayError::UpstreamTimeout(_) => (StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout"),
        _ => (StatusCode::BAD_GATEWAY, "Bad Gateway"),
    };
    let mut resp = json_response(
        status,
        &serde_json::json!({
            "error": error,
            "service": service,
            "detail": err.to_string(),
        }),
    );
    resp.headers_mut()
        .insert(PROXIED_BY_HEADER, HeaderValue::from_static(PROXIED_BY));
    resp
}

/// Pump request body frames through a channel so reqwest gets a `Send + Sync` stream
///
/// The watch channel ticks once per chunk handed to reqwest and flips to
/// `true` when the body is exhausted.
fn stream_body<B>(
    mut body: B,
) -> (ReceiverStream<std::io::Result<Bytes>>, watch::Receiver<bool>)
where
    B: Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>> + Send,
{
    let (tx, rx) = mpsc::channel(16);
    let (progress_tx, progress_rx) = watch::channel(false);
    tokio::spawn(async move {
        while let Some(frame) = body.frame().await {
            match frame {
                Ok(frame) => {
                    let Ok(data) = frame.into_data() else {
                        continue;
                    };
                    if tx.send(Ok(data)).await.is_err() {
                        return;
                    }
                    progress_tx.send_replace(false);
                }
                Err(e) => {
                    let _ = tx.send(Err(std::io::Error::other(e))).await;
                    return;
                }
            }
        }
        progress_tx.send_replace(true);
    });
    (ReceiverStream::new(rx), progress_rx)
}
