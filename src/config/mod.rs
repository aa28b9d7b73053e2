//! Configuration types for the gateway
//!
//! One public listener, a set of supervised services (each owning a path
//! prefix), and the tuning knobs for health checks, proxying, the realtime
//! hub and child shutdown. Uses HCL as the configuration format, with a
//! handful of environment overrides applied on top.

mod entrypoint;
mod hub;
mod service;

pub use entrypoint::ListenConfig;
pub use hub::HubConfig;
pub use service::{RewriteRule, ServiceConfig};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::error::{GatewayError, Result};

/// Top-level gateway configuration
///
/// # HCL Example
///
/// ```hcl
/// listen {
///   port = 3000
/// }
///
/// services "brands" {
///   path_prefix   = "/brands"
///   upstream_port = 5000
///   command       = "node"
///   args          = ["brands/server.js"]
/// }
///
/// hub {
///   path = "/ws"
/// }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Public listener
    #[serde(default)]
    pub listen: ListenConfig,

    /// Services: name → descriptor config
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,

    /// Health aggregation settings
    #[serde(default)]
    pub health: HealthConfig,

    /// Reverse proxy settings
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Realtime hub settings
    #[serde(default)]
    pub hub: HubConfig,

    /// Child process settings
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

/// Health aggregation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Per-service probe timeout in milliseconds
    #[serde(default = "default_health_timeout")]
    pub timeout_ms: u64,
}

fn default_health_timeout() -> u64 {
    3000
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_health_timeout(),
        }
    }
}

/// Reverse proxy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Upstream request timeout in seconds
    #[serde(default = "default_proxy_timeout")]
    pub timeout_secs: u64,
}

fn default_proxy_timeout() -> u64 {
    30
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_proxy_timeout(),
        }
    }
}

/// Child process settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Seconds a child gets after SIGINT before it is killed
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_shutdown_grace() -> u64 {
    5
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from an HCL file.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            GatewayError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_hcl(&content)
    }

    /// Parse configuration from an HCL string
    pub fn from_hcl(content: &str) -> Result<Self> {
        hcl::from_str(content)
            .map_err(|e| GatewayError::Config(format!("Failed to parse HCL config: {}", e)))
    }

    /// Apply environment overrides from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Apply environment overrides using a custom lookup
    ///
    /// `PORT` sets the gateway port, `UPSTREAM_HOST` every service host,
    /// `<NAME>_PORT` a single service port and `DATABASE_URL` the hub probe.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT") {
            self.listen.port = parse_port("PORT", &port)?;
        }

        let upstream_host = lookup("UPSTREAM_HOST");
        for (name, svc) in self.services.iter_mut() {
            if let Some(host) = &upstream_host {
                svc.upstream_host = host.clone();
            }
            let key = port_env_key(name);
            if let Some(port) = lookup(&key) {
                svc.upstream_port = parse_port(&key, &port)?;
            }
        }

        if let Some(url) = lookup("DATABASE_URL") {
            self.hub.database_url = Some(url);
        }

        Ok(())
    }

    /// Validate the configuration for consistency
    /// Ports the gateway may bind, empty when the OS picks one (`port = 0`)
    fn listen_port_range(&self) -> std::ops::RangeInclusive<u16> {
        match self.listen.port {
            0 => 1..=0,
            port => port..=port.saturating_add(self.listen.max_port_retries),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut prefixes: HashMap<&str, &str> = HashMap::new();
        let mut ports: HashMap<u16, &str> = HashMap::new();

        for (name, svc) in &self.services {
            if name.trim().is_empty() {
                return Err(GatewayError::Config("Service name must not be empty".into()));
            }

            if !svc.path_prefix.starts_with('/') {
                return Err(GatewayError::Config(format!(
                    "Service '{}': path_prefix '{}' must start with '/'",
                    name, svc.path_prefix
                )));
            }
            let prefix = normalize_prefix(&svc.path_prefix);
            if let Some(other) = prefixes.insert(prefix, name) {
                return Err(GatewayError::Config(format!(
                    "Services '{}' and '{}' share path prefix '{}'",
                    other, name, prefix
                )));
            }

            if svc.upstream_port == 0 {
                return Err(GatewayError::Config(format!(
                    "Service '{}' has no upstream_port",
                    name
                )));
            }
            if let Some(other) = ports.insert(svc.upstream_port, name) {
                return Err(GatewayError::Config(format!(
                    "Services '{}' and '{}' share upstream port {}",
                    other, name, svc.upstream_port
                )));
            }
            if self.listen_port_range().contains(&svc.upstream_port) {
                return Err(GatewayError::Config(format!(
                    "Service '{}' upstream port {} falls inside the gateway port range {}..={}",
                    name,
                    svc.upstream_port,
                    self.listen.port,
                    self.listen.port.saturating_add(self.listen.max_port_retries)
                )));
            }

            if svc.autostart && svc.command.as_deref().map_or(true, str::is_empty) {
                return Err(GatewayError::Config(format!(
                    "Service '{}' has autostart enabled but no command",
                    name
                )));
            }

            if !svc.health_path.starts_with('/') {
                return Err(GatewayError::Config(format!(
                    "Service '{}': health_path '{}' must start with '/'",
                    name, svc.health_path
                )));
            }
        }

        if !self.hub.path.starts_with('/') {
            return Err(GatewayError::Config(format!(
                "Hub path '{}' must start with '/'",
                self.hub.path
            )));
        }
        if let Some(name) = prefixes.get(normalize_prefix(&self.hub.path)) {
            return Err(GatewayError::Config(format!(
                "Hub path '{}' collides with the prefix of service '{}'",
                self.hub.path, name
            )));
        }

        if RESERVED_PATHS.iter().any(|r| is_under(normalize_prefix(&self.hub.path), r)) {
            return Err(GatewayError::Config(format!(
                "Hub path '{}' is reserved by the gateway",
                self.hub.path
            )));
        }

        if let Some((prefix, name)) = prefixes
            .iter()
            .find(|(prefix, _)| RESERVED_PATHS.iter().any(|r| is_under(prefix, r)))
        {
            return Err(GatewayError::Config(format!(
                "Service '{}': path prefix '{}' is reserved by the gateway",
                name, prefix
            )));
        }

        if self.hub.tick_interval_secs == 0 {
            return Err(GatewayError::Config(
                "hub.tick_interval_secs must be greater than zero".into(),
            ));
        }
        if self.health.timeout_ms == 0 || self.proxy.timeout_secs == 0 {
            return Err(GatewayError::Config("Timeouts must be greater than zero".into()));
        }

        Ok(())
    }
}

/// Environment variable carrying a service's port override (`app-3` → `APP_3_PORT`)
pub fn port_env_key(service: &str) -> String {
    format!("{}_PORT", service.to_uppercase().replace('-', "_"))
}

/// Paths the gateway answers itself
pub const RESERVED_PATHS: [&str; 2] = ["/health", "/status"];

fn is_under(prefix: &str, reserved: &str) -> bool {
    prefix == reserved
        || prefix
            .strip_prefix(reserved)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Strip trailing slashes, keeping a lone `/`
pub(crate) fn normalize_prefix(prefix: &str) -> &str {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        "/"
    } else {
        trimmed
    }
}

fn parse_port(key: &str, value: &str) -> Result<u16> {
    value
        .trim()
        .parse::<u16>()
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| GatewayError::Config(format!("{} is not a valid port: '{}'", key, value)))
}
