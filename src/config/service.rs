//! Service configuration: one supervised backend and how to reach it

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How the matched path prefix is rewritten before forwarding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(try_from = "String", into = "String")]
pub enum RewriteRule {
    /// Remove the prefix (`/wallet/api` → `/api`)
    #[default]
    StripPrefix,
    /// Forward the path unchanged
    Preserve,
    /// Swap the prefix for another one (`/wallet/api` → `/v2/api`)
    Replace(String),
}

impl std::str::FromStr for RewriteRule {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "strip-prefix" => Ok(Self::StripPrefix),
            "preserve" => Ok(Self::Preserve),
            other => match other.strip_prefix("replace:") {
                Some(prefix) if prefix.starts_with('/') => Ok(Self::Replace(prefix.to_string())),
                Some(prefix) => Err(format!(
                    "replacement prefix must start with '/': {}",
                    prefix
                )),
                None => Err(format!("unknown rewrite rule: {}", other)),
            },
        }
    }
}

impl TryFrom<String> for RewriteRule {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RewriteRule> for String {
    fn from(rule: RewriteRule) -> Self {
        rule.to_string()
    }
}

impl std::fmt::Display for RewriteRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StripPrefix => write!(f, "strip-prefix"),
            Self::Preserve => write!(f, "preserve"),
            Self::Replace(prefix) => write!(f, "replace:{}", prefix),
        }
    }
}

/// Service configuration: a backend process the gateway launches and proxies to
///
/// # Example
///
/// ```hcl
/// services "wallet" {
///   path_prefix   = "/wallet"
///   upstream_port = 5001
///   command       = "node"
///   args          = ["wallet/server.js"]
///   forward_env   = ["WALLET_SECRET"]
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Request path prefix routed to this service
    pub path_prefix: String,

    /// Host the service listens on
    #[serde(default = "default_upstream_host")]
    pub upstream_host: String,

    /// Port the service listens on; handed to the child as `PORT`
    pub upstream_port: u16,

    /// Health endpoint polled by the aggregator
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Executable to launch (None = externally managed service)
    #[serde(default)]
    pub command: Option<String>,

    /// Arguments passed to the command
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables set on the child
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Variables copied from the gateway's own environment (secrets)
    #[serde(default)]
    pub forward_env: Vec<String>,

    /// Working directory for the child
    #[serde(default)]
    pub working_dir: Option<String>,

    /// Launch the child when the gateway starts
    #[serde(default = "default_autostart")]
    pub autostart: bool,

    /// Path rewrite applied before forwarding
    #[serde(default)]
    pub rewrite: RewriteRule,
}

fn default_upstream_host() -> String {
    "127.0.0.1".to_string()
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_autostart() -> bool {
    true
}
