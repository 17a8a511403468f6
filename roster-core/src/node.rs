use crate::error::Result;
use crate::keys::HEARTBEATS_KEY;
use crate::store::SharedStore;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Heartbeats older than this mark a node as gone.
pub const HEARTBEAT_TIMEOUT_SECS: i64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub last_heartbeat: i64,
}

/// Cluster membership derived from heartbeats in the shared store.
#[derive(Clone)]
pub struct NodeRegistry {
    node_id: String,
    store: Arc<dyn SharedStore>,
}

impl NodeRegistry {
    pub fn new(node_id: impl Into<String>, store: Arc<dyn SharedStore>) -> Self {
        Self {
            node_id: node_id.into(),
            store,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub async fn heartbeat(&self) -> Result<()> {
        let now = Utc::now().timestamp();
        self.store
            .hash_set(HEARTBEATS_KEY, &self.node_id, &now.to_string())
            .await
    }

    /// Whether another live process already heartbeats under this node id.
    pub async fn is_id_in_use(&self) -> Result<bool> {
        let Some(raw) = self.store.hash_get(HEARTBEATS_KEY, &self.node_id).await? else {
            return Ok(false);
        };

        Ok(raw
            .parse::<i64>()
            .map(|last| is_fresh(last, Utc::now().timestamp()))
            .unwrap_or(false))
    }

    pub async fn deregister(&self) -> Result<()> {
        self.store
            .hash_delete(HEARTBEATS_KEY, &[self.node_id.as_str()])
            .await
    }

    /// Nodes with a fresh heartbeat, always including this one, sorted by id.
    pub async fn live_nodes(&self) -> Result<Vec<NodeInfo>> {
        let now = Utc::now().timestamp();
        let heartbeats = self.store.hash_get_all(HEARTBEATS_KEY).await?;

        let mut nodes: Vec<NodeInfo> = heartbeats
            .into_iter()
            .filter_map(|(node_id, raw)| {
                let last_heartbeat = raw.parse::<i64>().ok()?;
                is_fresh(last_heartbeat, now).then_some(NodeInfo {
                    node_id,
                    last_heartbeat,
                })
            })
            .collect();

        if !nodes.iter().any(|node| node.node_id == self.node_id) {
            nodes.push(NodeInfo {
                node_id: self.node_id.clone(),
                last_heartbeat: now,
            });
        }

        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(nodes)
    }

    pub async fn live_node_ids(&self) -> Result<Vec<String>> {
        Ok(self
            .live_nodes()
            .await?
            .into_iter()
            .map(|node| node.node_id)
            .collect())
    }
}

fn is_fresh(last_heartbeat: i64, now: i64) -> bool {
    now - last_heartbeat <= HEARTBEAT_TIMEOUT_SECS
}
