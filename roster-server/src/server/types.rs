use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub(crate) struct ErrorResponse {
    pub(crate) error: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct HealthResponse {
    pub(crate) status: String,
    pub(crate) node_id: String,
    pub(crate) online: usize,
}

#[derive(Debug, Serialize)]
pub(crate) struct NodesResponse {
    pub(crate) nodes: Vec<NodeItem>,
    /// Nodes without a live heartbeat that still list players.
    pub(crate) orphaned: Vec<OrphanedItem>,
}

#[derive(Debug, Serialize)]
pub(crate) struct OrphanedItem {
    pub(crate) node_id: String,
    pub(crate) online: usize,
}

#[derive(Debug, Serialize)]
pub(crate) struct NodeItem {
    pub(crate) node_id: String,
    pub(crate) last_heartbeat: i64,
    pub(crate) online: usize,
    pub(crate) local: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LoginRequest {
    pub(crate) id: Uuid,
    pub(crate) name: String,
    pub(crate) address: IpAddr,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct LoginResponse {
    pub(crate) allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ConnectedRequest {
    pub(crate) name: String,
    pub(crate) address: IpAddr,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServerSwitchRequest {
    pub(crate) server: String,
    #[serde(default)]
    pub(crate) previous: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct DisconnectResponse {
    pub(crate) kicked_elsewhere: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct SessionResponse {
    pub(crate) id: Uuid,
    pub(crate) name: Option<String>,
    /// Client address, when the session is on this node.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) address: Option<IpAddr>,
    pub(crate) node: Option<String>,
    pub(crate) server: Option<String>,
    pub(crate) last_online: i64,
    pub(crate) kicked_elsewhere: bool,
    /// Set when a takeover asked this proxy to close the session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) kick_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PingRequest {
    pub(crate) address: IpAddr,
    #[serde(default)]
    pub(crate) forced_host: bool,
    #[serde(default)]
    pub(crate) ping_passthrough: bool,
    #[serde(default)]
    pub(crate) online: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct PingResponse {
    pub(crate) online: usize,
}

#[derive(Debug, Deserialize)]
pub(crate) struct BridgeQuery {
    /// `false` when the message came from a client connection.
    #[serde(default = "default_from_backend")]
    pub(crate) from_backend: bool,
}

fn default_from_backend() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct CommandsResponse {
    pub(crate) commands: Vec<String>,
}
