//! Query bridge: answers presence questions sent by backend servers.
//!
//! Unknown subchannels and unknown `ServerPlayers` modes get no reply at all,
//! so peers can probe for extensions without tripping errors.

use crate::cluster::ClusterView;
use crate::codec::{
    DataInput, DataOutput, read_count_map, read_list_map, write_count_map, write_list_map,
};
use crate::error::{Result, RosterError};
use crate::host::ProxyHost;
use crate::identity::IdentityDirectory;
use crate::presence::PresenceSync;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub const SCOPE_ALL: &str = "ALL";
pub const MODE_COUNT: &str = "COUNT";
pub const MODE_PLAYERS: &str = "PLAYERS";

const TAG_PLAYER_LIST: &str = "PlayerList";
const TAG_PLAYER_COUNT: &str = "PlayerCount";
const TAG_LAST_ONLINE: &str = "LastOnline";
const TAG_SERVER_PLAYERS: &str = "ServerPlayers";
const TAG_PROXY: &str = "Proxy";
const TAG_PLAYER_PROXY: &str = "PlayerProxy";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryRequest {
    PlayerList { scope: String },
    PlayerCount { scope: String },
    LastOnline { name: String },
    ServerPlayers { mode: String },
    Proxy,
    PlayerProxy { name: String },
    Unknown { tag: String },
}

impl QueryRequest {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut input = DataInput::new(data);
        let tag = input.read_utf()?;

        Ok(match tag.as_str() {
            TAG_PLAYER_LIST => QueryRequest::PlayerList {
                scope: input.read_utf()?,
            },
            TAG_PLAYER_COUNT => QueryRequest::PlayerCount {
                scope: input.read_utf()?,
            },
            TAG_LAST_ONLINE => QueryRequest::LastOnline {
                name: input.read_utf()?,
            },
            TAG_SERVER_PLAYERS => QueryRequest::ServerPlayers {
                mode: input.read_utf()?,
            },
            TAG_PROXY => QueryRequest::Proxy,
            TAG_PLAYER_PROXY => QueryRequest::PlayerProxy {
                name: input.read_utf()?,
            },
            _ => QueryRequest::Unknown { tag },
        })
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut out = DataOutput::new();
        match self {
            QueryRequest::PlayerList { scope } => {
                out.write_utf(TAG_PLAYER_LIST)?;
                out.write_utf(scope)?;
            }
            QueryRequest::PlayerCount { scope } => {
                out.write_utf(TAG_PLAYER_COUNT)?;
                out.write_utf(scope)?;
            }
            QueryRequest::LastOnline { name } => {
                out.write_utf(TAG_LAST_ONLINE)?;
                out.write_utf(name)?;
            }
            QueryRequest::ServerPlayers { mode } => {
                out.write_utf(TAG_SERVER_PLAYERS)?;
                out.write_utf(mode)?;
            }
            QueryRequest::Proxy => out.write_utf(TAG_PROXY)?,
            QueryRequest::PlayerProxy { name } => {
                out.write_utf(TAG_PLAYER_PROXY)?;
                out.write_utf(name)?;
            }
            QueryRequest::Unknown { tag } => out.write_utf(tag)?,
        }
        Ok(out.into_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryResponse {
    PlayerList { scope: String, names: Vec<String> },
    PlayerCount { scope: String, count: i32 },
    LastOnline { name: String, timestamp: i64 },
    ServerCounts(BTreeMap<String, i32>),
    ServerPlayers(BTreeMap<String, Vec<String>>),
    Proxy { node_id: String },
    PlayerProxy { name: String, node_id: String },
}

impl QueryResponse {
    pub fn encode(&self) -> Result<Bytes> {
        let mut out = DataOutput::new();
        match self {
            QueryResponse::PlayerList { scope, names } => {
                out.write_utf(TAG_PLAYER_LIST)?;
                out.write_utf(scope)?;
                out.write_utf(&names.join(","))?;
            }
            QueryResponse::PlayerCount { scope, count } => {
                out.write_utf(TAG_PLAYER_COUNT)?;
                out.write_utf(scope)?;
                out.write_i32(*count);
            }
            QueryResponse::LastOnline { name, timestamp } => {
                out.write_utf(TAG_LAST_ONLINE)?;
                out.write_utf(name)?;
                out.write_i64(*timestamp);
            }
            QueryResponse::ServerCounts(counts) => {
                out.write_utf(TAG_SERVER_PLAYERS)?;
                out.write_utf(MODE_COUNT)?;
                write_count_map(&mut out, counts)?;
            }
            QueryResponse::ServerPlayers(players) => {
                out.write_utf(TAG_SERVER_PLAYERS)?;
                out.write_utf(MODE_PLAYERS)?;
                write_list_map(&mut out, players)?;
            }
            QueryResponse::Proxy { node_id } => {
                out.write_utf(TAG_PROXY)?;
                out.write_utf(node_id)?;
            }
            QueryResponse::PlayerProxy { name, node_id } => {
                out.write_utf(TAG_PLAYER_PROXY)?;
                out.write_utf(name)?;
                out.write_utf(node_id)?;
            }
        }
        Ok(out.into_bytes())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut input = DataInput::new(data);
        let tag = input.read_utf()?;

        match tag.as_str() {
            TAG_PLAYER_LIST => {
                let scope = input.read_utf()?;
                let names = input
                    .read_utf()?
                    .split(',')
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect();
                Ok(QueryResponse::PlayerList { scope, names })
            }
            TAG_PLAYER_COUNT => Ok(QueryResponse::PlayerCount {
                scope: input.read_utf()?,
                count: input.read_i32()?,
            }),
            TAG_LAST_ONLINE => Ok(QueryResponse::LastOnline {
                name: input.read_utf()?,
                timestamp: input.read_i64()?,
            }),
            TAG_SERVER_PLAYERS => match input.read_utf()?.as_str() {
                MODE_COUNT => Ok(QueryResponse::ServerCounts(read_count_map(&mut input)?)),
                MODE_PLAYERS => Ok(QueryResponse::ServerPlayers(read_list_map(&mut input)?)),
                other => Err(RosterError::Codec(format!(
                    "unknown ServerPlayers mode: {}",
                    other
                ))),
            },
            TAG_PROXY => Ok(QueryResponse::Proxy {
                node_id: input.read_utf()?,
            }),
            TAG_PLAYER_PROXY => Ok(QueryResponse::PlayerProxy {
                name: input.read_utf()?,
                node_id: input.read_utf()?,
            }),
            other => Err(RosterError::Codec(format!("unknown subchannel: {}", other))),
        }
    }
}

/// A bridge message as delivered by the host.
#[derive(Debug, Clone)]
pub struct QueryMessage {
    pub channel: String,
    /// Sent by a backend server rather than a client.
    pub from_backend: bool,
    pub data: Bytes,
}

/// Writes a reply back over the connection the request came from.
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn send(&self, channel: &str, data: Bytes) -> Result<()>;
}

#[derive(Clone)]
pub struct QueryBridge {
    node_id: String,
    channels: Arc<Vec<String>>,
    cluster: ClusterView,
    directory: Arc<dyn IdentityDirectory>,
    host: Arc<dyn ProxyHost>,
    runtime: Handle,
}

impl QueryBridge {
    pub fn new(presence: &PresenceSync, host: Arc<dyn ProxyHost>, channels: Vec<String>) -> Self {
        Self {
            node_id: presence.node_id().to_string(),
            channels: Arc::new(channels),
            cluster: presence.cluster().clone(),
            directory: presence.directory().clone(),
            host,
            runtime: presence.runtime().clone(),
        }
    }

    pub fn accepts(&self, message: &QueryMessage) -> bool {
        message.from_backend && self.channels.contains(&message.channel)
    }

    /// Answer `message` off the caller's task; `None` if it is not ours.
    pub fn dispatch(
        &self,
        message: QueryMessage,
        reply: Arc<dyn ReplySink>,
    ) -> Option<JoinHandle<()>> {
        if !self.accepts(&message) {
            return None;
        }

        let this = self.clone();
        Some(self.runtime.spawn(async move {
            match this.handle(&message.data).await {
                Ok(Some(response)) => {
                    if let Err(error) = reply.send(&message.channel, response).await {
                        tracing::warn!("Failed to reply on {}: {}", message.channel, error);
                    }
                }
                Ok(None) => {}
                Err(RosterError::Codec(error)) => {
                    tracing::debug!("Dropping malformed bridge message: {}", error);
                }
                Err(error) => {
                    tracing::warn!("Bridge request on {} failed: {}", message.channel, error);
                }
            }
        }))
    }

    /// Encoded reply for `data`, or `None` when nothing should be sent.
    pub async fn handle(&self, data: &[u8]) -> Result<Option<Bytes>> {
        let request = QueryRequest::decode(data)?;
        match self.answer(request).await? {
            Some(response) => Ok(Some(response.encode()?)),
            None => Ok(None),
        }
    }

    pub async fn answer(&self, request: QueryRequest) -> Result<Option<QueryResponse>> {
        let response = match request {
            QueryRequest::PlayerList { scope } => {
                let ids = self.players_in_scope(&scope).await?;
                let names = self.names_of(&ids).await?.into_iter().collect::<BTreeSet<_>>();
                QueryResponse::PlayerList {
                    scope,
                    names: names.into_iter().collect(),
                }
            }
            QueryRequest::PlayerCount { scope } => {
                let count = if scope == SCOPE_ALL {
                    self.cluster.player_count().await?
                } else {
                    self.players_in_scope(&scope).await?.len()
                };
                QueryResponse::PlayerCount {
                    scope,
                    count: saturating_i32(count),
                }
            }
            QueryRequest::LastOnline { name } => {
                let id = self.resolve_name(&name).await?;
                let timestamp = self.cluster.last_online(&id).await?;
                QueryResponse::LastOnline { name, timestamp }
            }
            QueryRequest::ServerPlayers { mode } => {
                let grouped = self.cluster.server_to_players().await?;
                match mode.as_str() {
                    MODE_COUNT => QueryResponse::ServerCounts(
                        grouped
                            .into_iter()
                            .map(|(server, ids)| (server, saturating_i32(ids.len())))
                            .collect(),
                    ),
                    MODE_PLAYERS => {
                        let mut players = BTreeMap::new();
                        for (server, ids) in grouped {
                            players.insert(server, self.names_of(&ids).await?);
                        }
                        QueryResponse::ServerPlayers(players)
                    }
                    _ => return Ok(None),
                }
            }
            QueryRequest::Proxy => QueryResponse::Proxy {
                node_id: self.node_id.clone(),
            },
            QueryRequest::PlayerProxy { name } => {
                let id = self.resolve_name(&name).await?;
                let node_id = self.cluster.node_of(&id).await?.ok_or_else(|| {
                    RosterError::UnresolvedIdentity(format!("{} is not owned by any node", name))
                })?;
                QueryResponse::PlayerProxy { name, node_id }
            }
            QueryRequest::Unknown { tag } => {
                tracing::debug!("Ignoring unknown bridge subchannel '{}'", tag);
                return Ok(None);
            }
        };

        Ok(Some(response))
    }

    /// Identities in `scope`; unknown servers count as empty.
    async fn players_in_scope(&self, scope: &str) -> Result<Vec<Uuid>> {
        if scope == SCOPE_ALL {
            return Ok(self.cluster.online_players().await?.into_iter().collect());
        }
        if !self.host.has_server(scope) {
            tracing::debug!("Bridge query for unknown server '{}'", scope);
            return Ok(Vec::new());
        }
        self.cluster.players_on_server(scope).await
    }

    async fn resolve_name(&self, name: &str) -> Result<Uuid> {
        self.directory
            .name_to_id(name, true)
            .await?
            .ok_or_else(|| RosterError::UnresolvedIdentity(name.to_string()))
    }

    /// Display names, falling back to the id for identities with no name.
    async fn names_of(&self, ids: &[Uuid]) -> Result<Vec<String>> {
        let mut names = Vec::with_capacity(ids.len());
        for id in ids {
            let name = self.directory.id_to_name(id, false).await?;
            names.push(name.unwrap_or_else(|| id.to_string()));
        }
        Ok(names)
    }
}

fn saturating_i32(value: usize) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::config::PresenceConfig;
    use crate::events::{DisconnectEvent, PostLoginEvent, ServerSwitchEvent};
    use crate::identity::StoreIdentityDirectory;
    use crate::store::{MemoryStore, SharedStore};
    use chrono::Utc;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::sync::Mutex;

    struct StaticHost;

    #[async_trait]
    impl ProxyHost for StaticHost {
        fn has_server(&self, server: &str) -> bool {
            matches!(server, "lobby" | "survival" | "empty")
        }

        async fn kick_player(&self, _id: &Uuid, _reason: &str) -> Result<bool> {
            Ok(false)
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        replies: Mutex<Vec<(String, Bytes)>>,
    }

    #[async_trait]
    impl ReplySink for RecordingSink {
        async fn send(&self, channel: &str, data: Bytes) -> Result<()> {
            self.replies.lock().await.push((channel.to_string(), data));
            Ok(())
        }
    }

    struct Cluster {
        store: MemoryStore,
        p1: PresenceSync,
        p2: PresenceSync,
        bridge: QueryBridge,
    }

    impl Cluster {
        async fn new() -> Self {
            let store = MemoryStore::new();
            let bus = MemoryBus::new();
            let node = |id: &str| {
                let shared: Arc<dyn SharedStore> = Arc::new(store.clone());
                PresenceSync::new(
                    PresenceConfig::new(id),
                    shared.clone(),
                    Arc::new(bus.clone()),
                    Arc::new(StoreIdentityDirectory::new(shared)),
                    Handle::current(),
                )
            };
            let p1 = node("p1");
            let p2 = node("p2");
            p2.tick().await.expect("heartbeat");

            let bridge = QueryBridge::new(&p1, Arc::new(StaticHost), vec!["Roster".to_string()]);
            Self {
                store,
                p1,
                p2,
                bridge,
            }
        }

        async fn join(&self, node: &PresenceSync, name: &str, server: &str) -> Uuid {
            let id = Uuid::new_v4();
            node.on_post_login(PostLoginEvent {
                id,
                name: name.to_string(),
                address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            })
            .await
            .expect("join")
            .expect("post-login");
            node.on_server_change(ServerSwitchEvent {
                id,
                previous: None,
                server: server.to_string(),
            })
            .await
            .expect("join")
            .expect("server change");
            id
        }

        async fn ask(&self, request: QueryRequest) -> Option<QueryResponse> {
            let payload = request.encode().expect("encode");
            self.bridge
                .handle(&payload)
                .await
                .expect("handled")
                .map(|bytes| QueryResponse::decode(&bytes).expect("decode"))
        }
    }

    #[tokio::test]
    async fn player_list_all_round_trips_names() {
        let cluster = Cluster::new().await;
        cluster.join(&cluster.p1, "Alice", "lobby").await;
        cluster.join(&cluster.p2, "Bob", "survival").await;
        cluster.join(&cluster.p2, "Carol", "lobby").await;

        let response = cluster
            .ask(QueryRequest::PlayerList {
                scope: SCOPE_ALL.to_string(),
            })
            .await;
        let Some(QueryResponse::PlayerList { scope, names }) = response else {
            panic!("unexpected response {:?}", response);
        };
        assert_eq!(scope, "ALL");
        let unique: BTreeSet<_> = names.iter().cloned().collect();
        assert_eq!(unique.len(), names.len());
        assert_eq!(
            unique,
            ["Alice", "Bob", "Carol"]
                .into_iter()
                .map(str::to_string)
                .collect()
        );
    }

    #[tokio::test]
    async fn scoped_queries_and_unknown_scope() {
        let cluster = Cluster::new().await;
        cluster.join(&cluster.p1, "Alice", "lobby").await;
        cluster.join(&cluster.p2, "Bob", "lobby").await;
        cluster.join(&cluster.p2, "Carol", "survival").await;

        assert_eq!(
            cluster
                .ask(QueryRequest::PlayerList {
                    scope: "lobby".to_string()
                })
                .await,
            Some(QueryResponse::PlayerList {
                scope: "lobby".to_string(),
                names: vec!["Alice".to_string(), "Bob".to_string()],
            })
        );
        assert_eq!(
            cluster
                .ask(QueryRequest::PlayerList {
                    scope: "atlantis".to_string()
                })
                .await,
            Some(QueryResponse::PlayerList {
                scope: "atlantis".to_string(),
                names: Vec::new(),
            })
        );
        assert_eq!(
            cluster
                .ask(QueryRequest::PlayerCount {
                    scope: "survival".to_string()
                })
                .await,
            Some(QueryResponse::PlayerCount {
                scope: "survival".to_string(),
                count: 1,
            })
        );
        assert_eq!(
            cluster
                .ask(QueryRequest::PlayerCount {
                    scope: "atlantis".to_string()
                })
                .await,
            Some(QueryResponse::PlayerCount {
                scope: "atlantis".to_string(),
                count: 0,
            })
        );
    }

    #[tokio::test]
    async fn player_count_all_sums_online_sets() {
        let cluster = Cluster::new().await;
        cluster.join(&cluster.p1, "Alice", "lobby").await;
        cluster.join(&cluster.p2, "Bob", "lobby").await;
        // Online but not yet routed to a server.
        cluster
            .p2
            .on_post_login(PostLoginEvent {
                id: Uuid::new_v4(),
                name: "Dave".to_string(),
                address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            })
            .await
            .expect("join")
            .expect("post-login");

        let expected = cluster.store.set_len("proxy:p1:usersOnline").await.expect("scard")
            + cluster.store.set_len("proxy:p2:usersOnline").await.expect("scard");
        assert_eq!(expected, 3);
        assert_eq!(
            cluster
                .ask(QueryRequest::PlayerCount {
                    scope: SCOPE_ALL.to_string()
                })
                .await,
            Some(QueryResponse::PlayerCount {
                scope: SCOPE_ALL.to_string(),
                count: 3,
            })
        );
    }

    #[tokio::test]
    async fn server_players_count_matches_players() {
        let cluster = Cluster::new().await;
        cluster.join(&cluster.p1, "Alice", "lobby").await;
        cluster.join(&cluster.p2, "Bob", "lobby").await;
        cluster.join(&cluster.p2, "Carol", "survival").await;

        let Some(QueryResponse::ServerCounts(counts)) = cluster
            .ask(QueryRequest::ServerPlayers {
                mode: MODE_COUNT.to_string(),
            })
            .await
        else {
            panic!("expected counts");
        };
        let Some(QueryResponse::ServerPlayers(players)) = cluster
            .ask(QueryRequest::ServerPlayers {
                mode: MODE_PLAYERS.to_string(),
            })
            .await
        else {
            panic!("expected players");
        };

        assert_eq!(counts.len(), players.len());
        for (server, count) in &counts {
            assert_eq!(players[server].len() as i32, *count);
        }
        assert_eq!(counts["lobby"], 2);

        assert_eq!(
            cluster
                .ask(QueryRequest::ServerPlayers {
                    mode: "SOMETHING".to_string()
                })
                .await,
            None
        );
    }

    #[tokio::test]
    async fn last_online_requires_resolvable_name() {
        let cluster = Cluster::new().await;
        let id = cluster.join(&cluster.p1, "Alice", "lobby").await;

        assert_eq!(
            cluster
                .ask(QueryRequest::LastOnline {
                    name: "alice".to_string()
                })
                .await,
            Some(QueryResponse::LastOnline {
                name: "alice".to_string(),
                timestamp: 0,
            })
        );

        let before = Utc::now().timestamp_millis();
        cluster
            .p1
            .on_disconnect(DisconnectEvent { id })
            .await
            .expect("join")
            .expect("disconnect");
        let Some(QueryResponse::LastOnline { timestamp, .. }) = cluster
            .ask(QueryRequest::LastOnline {
                name: "Alice".to_string(),
            })
            .await
        else {
            panic!("expected last online");
        };
        assert!(timestamp >= before);

        let payload = QueryRequest::LastOnline {
            name: "Nobody".to_string(),
        }
        .encode()
        .expect("encode");
        assert!(matches!(
            cluster.bridge.handle(&payload).await,
            Err(RosterError::UnresolvedIdentity(_))
        ));
    }

    #[tokio::test]
    async fn proxy_and_player_proxy() {
        let cluster = Cluster::new().await;
        cluster.join(&cluster.p2, "Bob", "lobby").await;

        assert_eq!(
            cluster.ask(QueryRequest::Proxy).await,
            Some(QueryResponse::Proxy {
                node_id: "p1".to_string()
            })
        );
        assert_eq!(
            cluster
                .ask(QueryRequest::PlayerProxy {
                    name: "Bob".to_string()
                })
                .await,
            Some(QueryResponse::PlayerProxy {
                name: "Bob".to_string(),
                node_id: "p2".to_string(),
            })
        );

        let payload = QueryRequest::PlayerProxy {
            name: "Nobody".to_string(),
        }
        .encode()
        .expect("encode");
        assert!(cluster.bridge.handle(&payload).await.is_err());
    }

    #[tokio::test]
    async fn unknown_subchannel_yields_no_bytes() {
        let cluster = Cluster::new().await;
        let payload = QueryRequest::Unknown {
            tag: "GetServers".to_string(),
        }
        .encode()
        .expect("encode");
        assert_eq!(cluster.bridge.handle(&payload).await.expect("handled"), None);

        assert!(matches!(
            cluster.bridge.handle(&[0x00]).await,
            Err(RosterError::Codec(_))
        ));
    }

    #[tokio::test]
    async fn dispatch_replies_on_request_channel() {
        let cluster = Cluster::new().await;
        let sink = Arc::new(RecordingSink::default());

        let message = |channel: &str, from_backend: bool, request: QueryRequest| QueryMessage {
            channel: channel.to_string(),
            from_backend,
            data: request.encode().expect("encode"),
        };

        assert!(
            cluster
                .bridge
                .dispatch(message("Roster", false, QueryRequest::Proxy), sink.clone())
                .is_none()
        );
        assert!(
            cluster
                .bridge
                .dispatch(message("Other", true, QueryRequest::Proxy), sink.clone())
                .is_none()
        );

        cluster
            .bridge
            .dispatch(
                message(
                    "Roster",
                    true,
                    QueryRequest::Unknown {
                        tag: "Nope".to_string(),
                    },
                ),
                sink.clone(),
            )
            .expect("accepted")
            .await
            .expect("task");
        assert!(sink.replies.lock().await.is_empty());

        cluster
            .bridge
            .dispatch(message("Roster", true, QueryRequest::Proxy), sink.clone())
            .expect("accepted")
            .await
            .expect("task");

        let replies = sink.replies.lock().await;
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].0, "Roster");
        assert_eq!(
            QueryResponse::decode(&replies[0].1).expect("decode"),
            QueryResponse::Proxy {
                node_id: "p1".to_string()
            }
        );
    }
}
