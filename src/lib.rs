//! # multigate
//!
//! A single-port front door for a handful of locally supervised services.
//!
//! ## Architecture
//!
//! ```text
//!                    ┌──────────── /health ──────────→ HealthAggregator
//! Entrypoint ────────┼──────────── /status ──────────→ DashboardApi
//!  (port fallback)   ├──────────── <hub path> ───────→ BroadcastHub (WebSocket)
//!                    └──────────── everything else ──→ RouterTable → HttpProxy / WebSocket relay
//!
//! Supervisor ── spawns / terminates ──→ child service processes
//! ```
//!
//! ## Core Features
//!
//! - **Process supervision**: isolated child environments, graceful termination with a kill deadline
//! - **Prefix routing**: longest whole-segment prefix wins, per-route path rewriting
//! - **Streaming proxy**: bodies are never buffered; upstream failures become JSON 502s
//! - **Health aggregation**: parallel probes folded into online / degraded / offline
//! - **Realtime hub**: topic subscriptions with immediate snapshots and a shared ticker
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use multigate::{config::GatewayConfig, Gateway};
//!
//! #[tokio::main]
//! async fn main() -> multigate::Result<()> {
//!     let config = GatewayConfig::from_file("gateway.hcl").await?;
//!     let gateway = Gateway::new(config)?;
//!     gateway.start().await?;
//!     gateway.wait_for_shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dashboard;
pub mod entrypoint;
pub mod error;
pub mod gateway;
pub mod hub;
pub mod observability;
pub(crate) mod proxy;
pub mod router;
pub mod service;
pub mod supervisor;

// Re-export main types
pub use error::{GatewayError, Result};
pub use gateway::Gateway;
pub use hub::{BroadcastHub, Topic};
pub use supervisor::{ProcessStatus, Supervisor};

use serde::{Deserialize, Serialize};

/// Gateway runtime state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayState {
    /// Gateway has been created but not yet started
    #[default]
    Created,
    /// Spawning services and binding the listener
    Starting,
    /// Actively accepting and proxying requests
    Running,
    /// Terminating children and closing connections
    Stopping,
    /// Gateway has fully stopped
    Stopped,
}

impl std::fmt::Display for GatewayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}
