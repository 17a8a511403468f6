//! Connection lifecycle payloads and the data-channel messages nodes exchange.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use uuid::Uuid;

/// The connection is fully established on this node.
#[derive(Debug, Clone)]
pub struct PostLoginEvent {
    pub id: Uuid,
    pub name: String,
    pub address: IpAddr,
}

#[derive(Debug, Clone)]
pub struct DisconnectEvent {
    pub id: Uuid,
}

/// The connection moved to another server behind this node.
#[derive(Debug, Clone)]
pub struct ServerSwitchEvent {
    pub id: Uuid,
    pub previous: Option<String>,
    pub server: String,
}

/// Liveness probe; `online` is what will be reported back.
#[derive(Debug, Clone)]
pub struct PingEvent {
    pub address: IpAddr,
    /// The probe targeted a forced host.
    pub forced_host: bool,
    /// The listener forwards probes for forced hosts to the backend.
    pub ping_passthrough: bool,
    pub online: usize,
}

/// JSON messages published on the data channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataPayload {
    Join {
        id: Uuid,
        node: String,
    },
    Leave {
        id: Uuid,
        node: String,
        timestamp: i64,
    },
    ServerChange {
        id: Uuid,
        previous: Option<String>,
        server: String,
    },
    /// Ask `node` to terminate its session for `id`.
    Kick {
        id: Uuid,
        node: String,
        reason: String,
    },
}

impl DataPayload {
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}
