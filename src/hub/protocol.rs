//! Hub wire protocol: JSON text frames tagged by `type`

use super::metrics::{DatabaseStatus, ServicesStatus, SystemStats};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Broadcast topic a connection may subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    System,
    Database,
    Services,
    Notifications,
}

impl Topic {
    /// Every valid topic, in delivery order
    pub const ALL: [Topic; 4] = [
        Topic::System,
        Topic::Database,
        Topic::Services,
        Topic::Notifications,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Database => "database",
            Self::Services => "services",
            Self::Notifications => "notifications",
        }
    }

    /// Parse a channel name; unknown names yield `None`
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|topic| topic.as_str().eq_ignore_ascii_case(name.trim()))
    }

    /// Whether the topic has a current value to send on subscribe
    ///
    /// Notifications are event-driven and have nothing to catch up on.
    pub fn has_snapshot(self) -> bool {
        !matches!(self, Self::Notifications)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors caused by a bad client frame; the text goes back in an `error` message
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Invalid message format: expected a JSON object such as {{\"type\":\"ping\"}}")]
    InvalidJson,

    #[error("Invalid message format: missing string field \"type\"")]
    MissingType,

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Binary frames are not supported; send JSON text frames")]
    BinaryFrame,
}

/// Client → server message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Subscribe { channels: Vec<String> },
    Unsubscribe { channels: Vec<String> },
    Ping,
    GetServicesStatus,
}

impl ClientMessage {
    /// Parse one text frame
    ///
    /// A missing or malformed `channels` field is read as an empty list, and
    /// non-string entries are dropped; filtering against the topic set
    /// happens in the session.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|_| ProtocolError::InvalidJson)?;
        if !value.is_object() {
            return Err(ProtocolError::InvalidJson);
        }

        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or(ProtocolError::MissingType)?;

        match kind {
            "subscribe" => Ok(Self::Subscribe {
                channels: channels(&value),
            }),
            "unsubscribe" => Ok(Self::Unsubscribe {
                channels: channels(&value),
            }),
            "ping" => Ok(Self::Ping),
            "get-services-status" => Ok(Self::GetServicesStatus),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

fn channels(value: &serde_json::Value) -> Vec<String> {
    value
        .get("channels")
        .and_then(|c| c.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Server → client message
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    Welcome {
        #[serde(rename = "connectionId")]
        connection_id: u64,
        #[serde(rename = "availableSubscriptions")]
        available_subscriptions: Vec<Topic>,
        timestamp: DateTime<Utc>,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
    SubscriptionUpdate {
        subscriptions: Vec<Topic>,
        timestamp: DateTime<Utc>,
    },
    SystemStats {
        data: SystemStats,
        timestamp: DateTime<Utc>,
    },
    DatabaseStatus {
        data: DatabaseStatus,
        timestamp: DateTime<Utc>,
    },
    ServicesStatus {
        data: ServicesStatus,
        timestamp: DateTime<Utc>,
    },
    Notification {
        data: serde_json::Value,
        timestamp: DateTime<Utc>,
    },
    Error {
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl ServerMessage {
    pub fn welcome(connection_id: u64) -> Self {
        Self::Welcome {
            connection_id,
            available_subscriptions: Topic::ALL.to_vec(),
            timestamp: Utc::now(),
        }
    }

    pub fn pong() -> Self {
        Self::Pong {
            timestamp: Utc::now(),
        }
    }

    pub fn subscription_update(topics: impl IntoIterator<Item = Topic>) -> Self {
        Self::SubscriptionUpdate {
            subscriptions: topics.into_iter().collect(),
            timestamp: Utc::now(),
        }
    }

    pub fn notification(data: serde_json::Value) -> Self {
        Self::Notification {
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn error(err: &ProtocolError) -> Self {
        Self::Error {
            message: err.to_string(),
            timestamp: Utc::now(),
        }
    }

    /// The `type` tag as it appears on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Welcome { .. } => "welcome",
            Self::Pong { .. } => "pong",
            Self::SubscriptionUpdate { .. } => "subscription-update",
            Self::SystemStats { .. } => "system-stats",
            Self::DatabaseStatus { .. } => "database-status",
            Self::ServicesStatus { .. } => "services-status",
            Self::Notification { .. } => "notification",
            Self::Error { .. } => "error",
        }
    }

    /// Serialize to a text frame payload
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                "{{\"type\":\"error\",\"message\":\"serialization failed: {}\"}}",
                e
            )
        })
    }
}
