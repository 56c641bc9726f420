//! Read models for health and metrics endpoints.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Event bus snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventBusStatus {
    pub connected: bool,
    /// Last time the broker connection was (re)established.
    pub last_connected: Option<DateTime<Utc>>,
    pub messages_published: u64,
    pub messages_received: u64,
    /// Publish failures plus messages left unacked by subscribers.
    pub errors: u64,
}

/// RPC client snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientStatus {
    pub service_name: String,
    pub address: String,
    pub connected: bool,
    /// Transport connectivity state, e.g. `READY`.
    pub connection_state: String,
    /// Most recent connect or call failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Combined snapshot of the whole layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommsStatus {
    pub event_bus: EventBusStatus,
    pub chat: ClientStatus,
    pub stream: ClientStatus,
}

/// Health of one component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentHealth {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentHealth {
    pub fn from_result<E: std::fmt::Display>(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Self {
                healthy: true,
                error: None,
            },
            Err(e) => Self {
                healthy: false,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Result of actively probing every component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// True when every component is healthy.
    pub healthy: bool,
    pub event_bus: ComponentHealth,
    pub chat: ComponentHealth,
    pub stream: ComponentHealth,
}
