//! Key and channel naming shared by every node.
//!
//! These names are part of the cluster's compatibility surface: nodes running
//! different builds must agree on them.

use uuid::Uuid;

/// Hash of node id to last heartbeat (unix seconds).
pub const HEARTBEATS_KEY: &str = "heartbeats";

/// Hash of lowercase display name to identity.
pub const IDENTITY_NAMES_KEY: &str = "identity:names";

/// Hash of identity to display name.
pub const IDENTITY_IDS_KEY: &str = "identity:ids";

pub const FIELD_PROXY: &str = "proxy";
pub const FIELD_SERVER: &str = "server";
pub const FIELD_IP: &str = "ip";
pub const FIELD_ONLINE: &str = "online";

/// Glob matching every node's online set.
pub const ONLINE_SET_PATTERN: &str = "proxy:*:usersOnline";

pub fn online_set_key(node_id: &str) -> String {
    format!("proxy:{}:usersOnline", node_id)
}

/// Node id embedded in an online set key.
pub fn online_set_node(key: &str) -> Option<&str> {
    key.strip_prefix("proxy:")?
        .strip_suffix(":usersOnline")
        .filter(|node_id| !node_id.is_empty())
}

pub fn player_key(id: &Uuid) -> String {
    format!("player:{}", id)
}

pub fn kicked_marker_key(id: &Uuid) -> String {
    format!("player:{}:kicked-elsewhere", id)
}

/// Bus channel names for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channels {
    pub broadcast: String,
    pub node: String,
    pub data: String,
}

impl Channels {
    pub fn new(prefix: &str, node_id: &str) -> Self {
        Self {
            broadcast: format!("{}-allservers", prefix),
            node: format!("{}-{}", prefix, node_id),
            data: format!("{}-data", prefix),
        }
    }

    pub fn command_channels(&self) -> Vec<String> {
        vec![self.broadcast.clone(), self.node.clone()]
    }
}
