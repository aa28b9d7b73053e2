//! Router: longest-prefix request matching
//!
//! Routes are derived once from the service registry and are read-only
//! afterwards. A prefix matches on whole path segments only, and the most
//! specific (longest) prefix wins, so a catch-all `/` never shadows
//! `/wallet`.

mod rewrite;

pub use rewrite::rewrite_uri;

use crate::config::RewriteRule;
use crate::error::{GatewayError, Result};
use crate::service::{ServiceDescriptor, ServiceRegistry};
use serde::Serialize;
use std::sync::Arc;

/// One prefix → service mapping
#[derive(Debug, Clone)]
pub struct ProxyRoute {
    pub path_prefix: String,
    pub rewrite: RewriteRule,
    pub target: Arc<ServiceDescriptor>,
}

impl ProxyRoute {
    /// Whether `path` falls under this route's prefix
    pub fn matches(&self, path: &str) -> bool {
        prefix_matches(&self.path_prefix, path)
    }

    /// Upstream URI for a request matched by this route
    pub fn upstream_uri(&self, uri: &http::Uri) -> http::Uri {
        rewrite_uri(&self.rewrite, &self.path_prefix, uri)
    }
}

/// Router table: routes sorted most specific first
pub struct RouterTable {
    routes: Vec<ProxyRoute>,
}

impl RouterTable {
    /// Build the table from every registered service
    pub fn from_registry(registry: &ServiceRegistry) -> Result<Self> {
        Self::from_routes(
            registry
                .iter()
                .map(|target| ProxyRoute {
                    path_prefix: target.path_prefix.clone(),
                    rewrite: target.rewrite.clone(),
                    target: target.clone(),
                })
                .collect(),
        )
    }

    /// Build the table from explicit routes
    pub fn from_routes(mut routes: Vec<ProxyRoute>) -> Result<Self> {
        routes.sort_by(|a, b| {
            b.path_prefix
                .len()
                .cmp(&a.path_prefix.len())
                .then_with(|| a.path_prefix.cmp(&b.path_prefix))
        });

        if let Some(pair) = routes
            .windows(2)
            .find(|pair| pair[0].path_prefix == pair[1].path_prefix)
        {
            return Err(GatewayError::Config(format!(
                "Prefix '{}' is claimed by both '{}' and '{}'",
                pair[0].path_prefix, pair[0].target.name, pair[1].target.name
            )));
        }

        Ok(Self { routes })
    }

    /// Resolve the route for a request path (None = 404)
    pub fn route(&self, path: &str) -> Option<&ProxyRoute> {
        self.routes.iter().find(|route| route.matches(path))
    }

    /// Number of routes
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Route metadata for the status API
    pub fn routes_info(&self) -> Vec<RouteInfo> {
        self.routes
            .iter()
            .map(|r| RouteInfo {
                path_prefix: r.path_prefix.clone(),
                rewrite: r.rewrite.to_string(),
                service: r.target.name.clone(),
                upstream: r.target.base_url(),
            })
            .collect()
    }
}

/// Snapshot of a route for the status API
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteInfo {
    pub path_prefix: String,
    pub rewrite: String,
    pub service: String,
    pub upstream: String,
}

/// Segment-boundary prefix test: `/wallet` matches `/wallet` and `/wallet/x`, not `/walletx`
pub fn prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}
