//! Service layer: static descriptors and health aggregation
//!
//! Descriptors are built once from configuration and never change for the
//! lifetime of the process; the supervisor, router and health aggregator all
//! share them through `Arc`.

mod health_check;

pub use health_check::{
    CompositeHealth, CompositeStatus, HealthAggregator, HealthSnapshot, ServiceHealthState,
};

use crate::config::{GatewayConfig, RewriteRule};
use crate::error::Result;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Static description of one backend service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub name: String,
    pub path_prefix: String,
    pub upstream_host: String,
    pub upstream_port: u16,
    pub health_path: String,
    pub spawn_command: Option<String>,
    pub spawn_args: Vec<String>,
    pub env_overrides: BTreeMap<String, String>,
    pub forward_env: Vec<String>,
    pub working_dir: Option<String>,
    pub autostart: bool,
    pub rewrite: RewriteRule,
}

impl ServiceDescriptor {
    /// Base URL of the upstream (`http://host:port`)
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.upstream_host, self.upstream_port)
    }

    /// Full URL of the health endpoint
    pub fn health_url(&self) -> String {
        format!("{}{}", self.base_url(), self.health_path)
    }
}

/// Service registry: holds every configured descriptor, keyed by name
pub struct ServiceRegistry {
    services: BTreeMap<String, Arc<ServiceDescriptor>>,
}

impl ServiceRegistry {
    /// Build a service registry from a validated configuration
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        config.validate()?;

        let services = config
            .services
            .iter()
            .map(|(name, svc)| {
                let descriptor = ServiceDescriptor {
                    name: name.clone(),
                    path_prefix: crate::config::normalize_prefix(&svc.path_prefix).to_string(),
                    upstream_host: svc.upstream_host.clone(),
                    upstream_port: svc.upstream_port,
                    health_path: svc.health_path.clone(),
                    spawn_command: svc.command.clone().filter(|c| !c.is_empty()),
                    spawn_args: svc.args.clone(),
                    env_overrides: svc.env.clone(),
                    forward_env: svc.forward_env.clone(),
                    working_dir: svc.working_dir.clone(),
                    autostart: svc.autostart,
                    rewrite: svc.rewrite.clone(),
                };
                (name.clone(), Arc::new(descriptor))
            })
            .collect();

        Ok(Self { services })
    }

    /// Get a service by name
    pub fn get(&self, name: &str) -> Option<Arc<ServiceDescriptor>> {
        self.services.get(name).cloned()
    }

    /// Number of registered services
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Iterate over all descriptors in name order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ServiceDescriptor>> {
        self.services.values()
    }
}
