//! Realtime hub configuration

use serde::{Deserialize, Serialize};

/// Broadcast hub settings
///
/// # Example
///
/// ```hcl
/// hub {
///   path               = "/ws"
///   tick_interval_secs = 30
///   database_url       = "postgres://app@localhost/app"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Upgrade path handled by the hub instead of the proxy
    #[serde(default = "default_path")]
    pub path: String,

    /// Seconds between metric broadcasts
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,

    /// Connection string for the database reachability probe
    #[serde(default)]
    pub database_url: Option<String>,

    /// Probe timeout in milliseconds
    #[serde(default = "default_database_timeout")]
    pub database_timeout_ms: u64,
}

fn default_path() -> String {
    "/ws".to_string()
}

fn default_tick_interval() -> u64 {
    30
}

fn default_database_timeout() -> u64 {
    2000
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            tick_interval_secs: default_tick_interval(),
            database_url: None,
            database_timeout_ms: default_database_timeout(),
        }
    }
}
