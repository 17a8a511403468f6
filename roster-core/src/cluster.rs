//! Read-side view of cluster presence assembled from the shared store.

use crate::error::Result;
use crate::keys::{
    FIELD_ONLINE, FIELD_PROXY, FIELD_SERVER, ONLINE_SET_PATTERN, online_set_key, online_set_node,
    player_key,
};
use crate::node::NodeRegistry;
use crate::store::SharedStore;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use uuid::Uuid;

/// Last-seen value reported for identities with no record at all.
pub const NEVER_SEEN: i64 = -1;

#[derive(Clone)]
pub struct ClusterView {
    store: Arc<dyn SharedStore>,
    nodes: NodeRegistry,
    cached_count: Arc<AtomicUsize>,
}

impl ClusterView {
    pub fn new(store: Arc<dyn SharedStore>, nodes: NodeRegistry) -> Self {
        Self {
            store,
            nodes,
            cached_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn nodes(&self) -> &NodeRegistry {
        &self.nodes
    }

    /// First live node whose online set lists `id`.
    pub async fn online_set_owner(&self, id: &Uuid) -> Result<Option<String>> {
        let member = id.to_string();
        for node_id in self.nodes.live_node_ids().await? {
            if self
                .store
                .set_contains(&online_set_key(&node_id), &member)
                .await?
            {
                return Ok(Some(node_id));
            }
        }
        Ok(None)
    }

    pub async fn players_on_node(&self, node_id: &str) -> Result<BTreeSet<Uuid>> {
        let members = self.store.set_members(&online_set_key(node_id)).await?;
        Ok(members
            .into_iter()
            .filter_map(|member| match Uuid::parse_str(&member) {
                Ok(id) => Some(id),
                Err(_) => {
                    tracing::debug!("Ignoring malformed member '{}' on {}", member, node_id);
                    None
                }
            })
            .collect())
    }

    /// Union of every live node's online set.
    pub async fn online_players(&self) -> Result<BTreeSet<Uuid>> {
        let mut players = BTreeSet::new();
        for node_id in self.nodes.live_node_ids().await? {
            players.extend(self.players_on_node(&node_id).await?);
        }
        Ok(players)
    }

    /// Sum of every live node's online set size.
    pub async fn player_count(&self) -> Result<usize> {
        let mut count = 0;
        for node_id in self.nodes.live_node_ids().await? {
            count += self.store.set_len(&online_set_key(&node_id)).await?;
        }
        Ok(count)
    }

    pub async fn refresh_cached_count(&self) -> Result<usize> {
        let count = self.player_count().await?;
        self.cached_count.store(count, Ordering::Relaxed);
        Ok(count)
    }

    /// Count as of the last refresh; never touches the store.
    pub fn cached_count(&self) -> usize {
        self.cached_count.load(Ordering::Relaxed)
    }

    /// Node currently owning `id` according to its presence record.
    pub async fn node_of(&self, id: &Uuid) -> Result<Option<String>> {
        self.store.hash_get(&player_key(id), FIELD_PROXY).await
    }

    pub async fn server_of(&self, id: &Uuid) -> Result<Option<String>> {
        self.store.hash_get(&player_key(id), FIELD_SERVER).await
    }

    /// `0` while online, the departure time in millis when offline, or
    /// [`NEVER_SEEN`].
    pub async fn last_online(&self, id: &Uuid) -> Result<i64> {
        let record = self.store.hash_get_all(&player_key(id)).await?;
        if record.contains_key(FIELD_PROXY) {
            return Ok(0);
        }

        Ok(record
            .get(FIELD_ONLINE)
            .and_then(|raw| raw.parse::<i64>().ok())
            .unwrap_or(NEVER_SEEN))
    }

    /// Online identities grouped by the server they are currently on.
    pub async fn server_to_players(&self) -> Result<BTreeMap<String, Vec<Uuid>>> {
        let mut grouped: BTreeMap<String, Vec<Uuid>> = BTreeMap::new();
        for id in self.online_players().await? {
            if let Some(server) = self.server_of(&id).await? {
                grouped.entry(server).or_default().push(id);
            }
        }
        Ok(grouped)
    }

    /// Non-empty online sets of nodes that stopped heartbeating, with sizes.
    ///
    /// Those players stay listed until their node comes back and resets.
    pub async fn orphaned_online_sets(&self) -> Result<Vec<(String, usize)>> {
        let live: BTreeSet<String> = self.nodes.live_node_ids().await?.into_iter().collect();

        let mut orphaned = Vec::new();
        for key in self.store.scan_keys(ONLINE_SET_PATTERN).await? {
            let Some(node_id) = online_set_node(&key) else {
                continue;
            };
            if live.contains(node_id) {
                continue;
            }

            let size = self.store.set_len(&key).await?;
            if size > 0 {
                orphaned.push((node_id.to_string(), size));
            }
        }
        Ok(orphaned)
    }

    pub async fn players_on_server(&self, server: &str) -> Result<Vec<Uuid>> {
        Ok(self
            .server_to_players()
            .await?
            .remove(server)
            .unwrap_or_default())
    }
}
