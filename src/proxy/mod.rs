//! Proxy layer: request forwarding to upstream services
//!
//! Handles plain HTTP (streamed in both directions) and WebSocket relaying.

pub mod http_proxy;
pub mod websocket;

pub use http_proxy::{upstream_error_response, HttpProxy};

use crate::error::GatewayError;
use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use serde::Serialize;

/// Body type of every response the gateway produces
pub type ResponseBody = UnsyncBoxBody<Bytes, GatewayError>;

/// Header naming the gateway on forwarded requests
pub const PROXIED_BY_HEADER: &str = "x-proxied-by";

/// Header carrying the path as the client sent it
pub const ORIGINAL_PATH_HEADER: &str = "x-original-path";

/// Value of [`PROXIED_BY_HEADER`]
pub const PROXIED_BY: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// A fully buffered body
pub fn full(body: impl Into<Bytes>) -> ResponseBody {
    Full::new(body.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// An empty body
pub fn empty() -> ResponseBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// JSON response with the given status
pub fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<ResponseBody> {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    let mut resp = Response::new(full(body));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

/// Check if a header is a hop-by-hop header that should not be forwarded
pub fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}
