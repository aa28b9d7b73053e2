//! Listener configuration: the single public port

use serde::{Deserialize, Serialize};

/// Public listener configuration
///
/// # Example
///
/// ```hcl
/// listen {
///   host             = "0.0.0.0"
///   port             = 3000
///   max_port_retries = 10
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    /// Bind host
    #[serde(default = "default_host")]
    pub host: String,

    /// Preferred port; the next ones are tried when it is taken
    #[serde(default = "default_port")]
    pub port: u16,

    /// How many successive ports to try after the preferred one
    #[serde(default = "default_max_port_retries")]
    pub max_port_retries: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_max_port_retries() -> u16 {
    10
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_port_retries: default_max_port_retries(),
        }
    }
}
