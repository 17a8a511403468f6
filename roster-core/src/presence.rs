//! Presence synchronizer: login conflict resolution and the online, relocate
//! and offline transitions written to the shared store.

use crate::bus::Bus;
use crate::cluster::ClusterView;
use crate::config::{KickPolicy, PresenceConfig};
use crate::error::Result;
use crate::events::{DataPayload, DisconnectEvent, PingEvent, PostLoginEvent, ServerSwitchEvent};
use crate::identity::IdentityDirectory;
use crate::intent::LoginEvent;
use crate::keys::{
    Channels, FIELD_IP, FIELD_ONLINE, FIELD_PROXY, FIELD_SERVER, kicked_marker_key,
    online_set_key, player_key,
};
use crate::node::NodeRegistry;
use crate::store::SharedStore;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Lifetime of the marker left on an identity taken over by another login.
pub const KICK_MARKER_TTL_SECS: u64 = 10;

#[derive(Clone)]
pub struct PresenceSync {
    config: Arc<PresenceConfig>,
    channels: Arc<Channels>,
    store: Arc<dyn SharedStore>,
    bus: Arc<dyn Bus>,
    directory: Arc<dyn IdentityDirectory>,
    cluster: ClusterView,
    runtime: Handle,
}

impl PresenceSync {
    /// All store and bus work is spawned on `runtime`.
    pub fn new(
        config: PresenceConfig,
        store: Arc<dyn SharedStore>,
        bus: Arc<dyn Bus>,
        directory: Arc<dyn IdentityDirectory>,
        runtime: Handle,
    ) -> Self {
        let nodes = NodeRegistry::new(config.node_id.clone(), store.clone());
        let cluster = ClusterView::new(store.clone(), nodes);
        let channels = Channels::new(&config.channel_prefix, &config.node_id);

        Self {
            config: Arc::new(config),
            channels: Arc::new(channels),
            store,
            bus,
            directory,
            cluster,
            runtime,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    pub fn channels(&self) -> &Channels {
        &self.channels
    }

    pub fn cluster(&self) -> &ClusterView {
        &self.cluster
    }

    pub fn directory(&self) -> &Arc<dyn IdentityDirectory> {
        &self.directory
    }

    pub fn bus(&self) -> &Arc<dyn Bus> {
        &self.bus
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    /// Check the attempt against the cluster before the host lets it through.
    ///
    /// Registers an intent on `event`; the host must await
    /// [`LoginEvent::completed`] before acting on the verdict.
    pub fn on_login(&self, event: &LoginEvent) -> JoinHandle<Result<()>> {
        let token = event.register_intent();
        let event = event.clone();
        let this = self.clone();

        self.spawn_logged("login check", event.id(), async move {
            let _token = token;
            if event.is_cancelled() {
                tracing::debug!("Login for {} already cancelled, skipping check", event.id());
                return Ok(());
            }
            this.resolve_login(&event).await
        })
    }

    async fn resolve_login(&self, event: &LoginEvent) -> Result<()> {
        let id = event.id();

        match self.config.kick_policy {
            KickPolicy::RejectDuplicate => {
                let Some(node) = self.cluster.online_set_owner(&id).await? else {
                    return Ok(());
                };
                if event.is_cancelled() {
                    return Ok(());
                }

                tracing::info!("Rejecting login for {} ({}): online on {}", event.name(), id, node);
                event.cancel(self.config.messages.already_logged_in.clone());
            }
            KickPolicy::Takeover => {
                let Some(node) = self.cluster.node_of(&id).await? else {
                    return Ok(());
                };
                if event.is_cancelled() {
                    return Ok(());
                }

                tracing::info!("Login for {} ({}) takes over session on {}", event.name(), id, node);
                self.store
                    .set_with_expiry(&kicked_marker_key(&id), "true", KICK_MARKER_TTL_SECS)
                    .await?;
                self.publish(&DataPayload::Kick {
                    id,
                    node,
                    reason: self.config.messages.logged_in_other_location.clone(),
                })
                .await?;
            }
        }

        Ok(())
    }

    /// Record a fully established connection on this node.
    pub fn on_post_login(&self, event: PostLoginEvent) -> JoinHandle<Result<()>> {
        let this = self.clone();
        self.spawn_logged("post-login", event.id, async move {
            this.record_login(&event).await
        })
    }

    async fn record_login(&self, event: &PostLoginEvent) -> Result<()> {
        self.directory.persist(&event.name, &event.id).await?;

        self.store
            .set_add(&online_set_key(self.node_id()), &event.id.to_string())
            .await?;
        self.store
            .hash_set_all(
                &player_key(&event.id),
                &[
                    (FIELD_PROXY, self.node_id().to_string()),
                    (FIELD_IP, event.address.to_string()),
                    (FIELD_ONLINE, "0".to_string()),
                ],
            )
            .await?;

        self.publish(&DataPayload::Join {
            id: event.id,
            node: self.node_id().to_string(),
        })
        .await
    }

    pub fn on_disconnect(&self, event: DisconnectEvent) -> JoinHandle<Result<()>> {
        let this = self.clone();
        self.spawn_logged("disconnect", event.id, async move {
            this.record_logout(&event.id).await
        })
    }

    async fn record_logout(&self, id: &Uuid) -> Result<()> {
        let timestamp = Utc::now().timestamp_millis();
        let key = player_key(id);

        self.store
            .set_remove(&online_set_key(self.node_id()), &id.to_string())
            .await?;

        // Only the node named in the record may clear it.
        if let Some(owner) = self.store.hash_get(&key, FIELD_PROXY).await?
            && owner != self.node_id()
        {
            tracing::debug!("{} is owned by {} now, keeping its record", id, owner);
            return Ok(());
        }

        self.store
            .hash_delete(&key, &[FIELD_SERVER, FIELD_IP, FIELD_PROXY])
            .await?;
        self.store
            .hash_set(&key, FIELD_ONLINE, &timestamp.to_string())
            .await?;
        self.store.delete(&kicked_marker_key(id)).await?;

        self.publish(&DataPayload::Leave {
            id: *id,
            node: self.node_id().to_string(),
            timestamp,
        })
        .await
    }

    pub fn on_server_change(&self, event: ServerSwitchEvent) -> JoinHandle<Result<()>> {
        let this = self.clone();
        self.spawn_logged("server change", event.id, async move {
            this.store
                .hash_set(&player_key(&event.id), FIELD_SERVER, &event.server)
                .await?;
            this.publish(&DataPayload::ServerChange {
                id: event.id,
                previous: event.previous,
                server: event.server,
            })
            .await
        })
    }

    /// Report the cluster-wide count on a liveness probe.
    pub fn on_ping(&self, ping: &mut PingEvent) {
        if self.config.exempt_addresses.contains(&ping.address) {
            return;
        }
        if ping.forced_host && ping.ping_passthrough {
            return;
        }
        ping.online = self.cluster.cached_count();
    }

    /// Whether `id`'s session was closed because it logged in on another node.
    ///
    /// Only meaningful for a few seconds after the takeover.
    pub async fn was_kicked_elsewhere(&self, id: &Uuid) -> Result<bool> {
        Ok(self.store.get(&kicked_marker_key(id)).await?.is_some())
    }

    /// Heartbeat and refresh the cached count used by probes.
    pub async fn tick(&self) -> Result<usize> {
        self.cluster.nodes().heartbeat().await?;
        self.cluster.refresh_cached_count().await
    }

    /// Log out every identity this node still lists as online.
    pub async fn reset_node(&self) -> Result<usize> {
        let stale = self.cluster.players_on_node(self.node_id()).await?;
        for id in &stale {
            self.record_logout(id).await?;
        }

        if !stale.is_empty() {
            tracing::info!("Cleaned up {} stale sessions on {}", stale.len(), self.node_id());
        }
        Ok(stale.len())
    }

    async fn publish(&self, payload: &DataPayload) -> Result<()> {
        self.bus
            .publish(&self.channels.data, &payload.to_json()?)
            .await
    }

    fn spawn_logged<F>(&self, what: &'static str, id: Uuid, task: F) -> JoinHandle<Result<()>>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.runtime.spawn(async move {
            let result = task.await;
            if let Err(error) = &result {
                tracing::warn!("{} for {} failed: {}", what, id, error);
            }
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusSubscription, MemoryBus};
    use crate::identity::StoreIdentityDirectory;
    use crate::intent::LoginOutcome;
    use crate::keys::HEARTBEATS_KEY;
    use crate::store::MemoryStore;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::time::{Duration, timeout};

    struct Harness {
        store: MemoryStore,
        bus: MemoryBus,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                store: MemoryStore::new(),
                bus: MemoryBus::new(),
            }
        }

        fn node(&self, config: PresenceConfig) -> PresenceSync {
            let store: Arc<dyn SharedStore> = Arc::new(self.store.clone());
            PresenceSync::new(
                config,
                store.clone(),
                Arc::new(self.bus.clone()),
                Arc::new(StoreIdentityDirectory::new(store)),
                Handle::current(),
            )
        }

        async fn heartbeat(&self, node: &str) {
            self.store
                .hash_set(HEARTBEATS_KEY, node, &Utc::now().timestamp().to_string())
                .await
                .expect("heartbeat");
        }

        async fn data_subscription(&self) -> BusSubscription {
            self.bus
                .subscribe(&["roster-data".to_string()])
                .await
                .expect("subscribe")
        }
    }

    fn localhost() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    fn post_login(id: Uuid, name: &str) -> PostLoginEvent {
        PostLoginEvent {
            id,
            name: name.to_string(),
            address: localhost(),
        }
    }

    async fn next_payload(subscription: &mut BusSubscription) -> DataPayload {
        let message = timeout(Duration::from_secs(1), subscription.recv())
            .await
            .expect("payload in time")
            .expect("open subscription");
        DataPayload::from_json(&message.payload).expect("payload json")
    }

    #[tokio::test]
    async fn post_login_claims_identity_for_node() {
        let harness = Harness::new();
        let node = harness.node(PresenceConfig::new("p1"));
        let mut data = harness.data_subscription().await;
        let id = Uuid::new_v4();

        node.on_post_login(post_login(id, "Alice"))
            .await
            .expect("join")
            .expect("post-login");

        assert!(
            harness
                .store
                .set_contains(&online_set_key("p1"), &id.to_string())
                .await
                .expect("sismember")
        );
        assert_eq!(
            node.cluster().node_of(&id).await.expect("owner").as_deref(),
            Some("p1")
        );
        assert_eq!(node.cluster().last_online(&id).await.expect("last"), 0);
        assert_eq!(
            next_payload(&mut data).await,
            DataPayload::Join {
                id,
                node: "p1".to_string()
            }
        );
    }

    #[tokio::test]
    async fn disconnect_clears_record_and_stamps_last_seen() {
        let harness = Harness::new();
        let node = harness.node(PresenceConfig::new("p1"));
        let id = Uuid::new_v4();

        node.on_post_login(post_login(id, "Alice"))
            .await
            .expect("join")
            .expect("post-login");
        node.on_server_change(ServerSwitchEvent {
            id,
            previous: None,
            server: "lobby".to_string(),
        })
        .await
        .expect("join")
        .expect("server change");

        let started = Utc::now().timestamp_millis();
        node.on_disconnect(DisconnectEvent { id })
            .await
            .expect("join")
            .expect("disconnect");

        assert!(
            !harness
                .store
                .set_contains(&online_set_key("p1"), &id.to_string())
                .await
                .expect("sismember")
        );
        assert_eq!(node.cluster().node_of(&id).await.expect("owner"), None);
        assert_eq!(node.cluster().server_of(&id).await.expect("server"), None);
        assert!(node.cluster().last_online(&id).await.expect("last") >= started);
    }

    #[tokio::test]
    async fn server_change_updates_only_sub_location() {
        let harness = Harness::new();
        let node = harness.node(PresenceConfig::new("p1"));
        let id = Uuid::new_v4();
        node.on_post_login(post_login(id, "Alice"))
            .await
            .expect("join")
            .expect("post-login");

        let mut data = harness.data_subscription().await;
        node.on_server_change(ServerSwitchEvent {
            id,
            previous: Some("lobby".to_string()),
            server: "survival".to_string(),
        })
        .await
        .expect("join")
        .expect("server change");

        assert_eq!(
            node.cluster().server_of(&id).await.expect("server").as_deref(),
            Some("survival")
        );
        assert_eq!(
            node.cluster().node_of(&id).await.expect("owner").as_deref(),
            Some("p1")
        );
        assert_eq!(
            next_payload(&mut data).await,
            DataPayload::ServerChange {
                id,
                previous: Some("lobby".to_string()),
                server: "survival".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn reject_duplicate_policy_denies_without_mutation() {
        let harness = Harness::new();
        harness.heartbeat("p2").await;
        let other = harness.node(PresenceConfig::new("p2"));
        let node = harness.node(
            PresenceConfig::new("p1").with_kick_policy(KickPolicy::RejectDuplicate),
        );
        let id = Uuid::new_v4();

        other
            .on_post_login(post_login(id, "Alice"))
            .await
            .expect("join")
            .expect("post-login");
        let before = harness.store.scan_keys("*").await.expect("keys");

        let event = LoginEvent::new(id, "Alice", localhost());
        node.on_login(&event).await.expect("join").expect("check");

        assert_eq!(
            event.completed().await,
            LoginOutcome::Denied {
                reason: Some(node.config().messages.already_logged_in.clone())
            }
        );
        assert_eq!(harness.store.scan_keys("*").await.expect("keys"), before);
        assert!(
            !harness
                .store
                .set_contains(&online_set_key("p1"), &id.to_string())
                .await
                .expect("sismember")
        );
    }

    #[tokio::test]
    async fn reject_duplicate_policy_sees_stale_local_entry() {
        let harness = Harness::new();
        let node = harness.node(
            PresenceConfig::new("p1").with_kick_policy(KickPolicy::RejectDuplicate),
        );
        let id = Uuid::new_v4();
        harness
            .store
            .set_add(&online_set_key("p1"), &id.to_string())
            .await
            .expect("sadd");

        let event = LoginEvent::new(id, "Alice", localhost());
        node.on_login(&event);
        assert!(matches!(event.completed().await, LoginOutcome::Denied { .. }));
    }

    #[tokio::test]
    async fn takeover_policy_kicks_owner_once_and_allows_login() {
        let harness = Harness::new();
        let old = harness.node(PresenceConfig::new("p2"));
        let node = harness.node(PresenceConfig::new("p1"));
        let id = Uuid::new_v4();

        old.on_post_login(post_login(id, "Alice"))
            .await
            .expect("join")
            .expect("post-login");

        let mut data = harness.data_subscription().await;
        let event = LoginEvent::new(id, "Alice", localhost());
        node.on_login(&event);

        assert_eq!(event.completed().await, LoginOutcome::Allowed);
        assert_eq!(
            next_payload(&mut data).await,
            DataPayload::Kick {
                id,
                node: "p2".to_string(),
                reason: node.config().messages.logged_in_other_location.clone(),
            }
        );
        assert!(
            timeout(Duration::from_millis(50), data.recv())
                .await
                .is_err()
        );
        assert!(node.was_kicked_elsewhere(&id).await.expect("marker"));
    }

    #[tokio::test]
    async fn takeover_disconnect_keeps_new_owner_record() {
        let harness = Harness::new();
        let old = harness.node(PresenceConfig::new("p2"));
        let node = harness.node(PresenceConfig::new("p1"));
        let id = Uuid::new_v4();

        old.on_post_login(post_login(id, "Alice"))
            .await
            .expect("join")
            .expect("post-login");

        let event = LoginEvent::new(id, "Alice", localhost());
        node.on_login(&event);
        assert_eq!(event.completed().await, LoginOutcome::Allowed);
        node.on_post_login(post_login(id, "Alice"))
            .await
            .expect("join")
            .expect("post-login");

        old.on_disconnect(DisconnectEvent { id })
            .await
            .expect("join")
            .expect("disconnect");

        assert_eq!(
            node.cluster().node_of(&id).await.expect("owner").as_deref(),
            Some("p1")
        );
        assert!(
            old.cluster()
                .players_on_node("p2")
                .await
                .expect("members")
                .is_empty()
        );
    }

    async fn take_over(node: &PresenceSync, id: Uuid, name: &str) {
        let event = LoginEvent::new(id, name, localhost());
        node.on_login(&event);
        assert_eq!(event.completed().await, LoginOutcome::Allowed);
        node.on_post_login(post_login(id, name))
            .await
            .expect("join")
            .expect("post-login");
    }

    #[tokio::test]
    async fn new_owner_disconnect_right_after_takeover_clears_record() {
        let harness = Harness::new();
        let old = harness.node(PresenceConfig::new("p2"));
        let node = harness.node(PresenceConfig::new("p1"));
        let id = Uuid::new_v4();

        old.on_post_login(post_login(id, "Alice"))
            .await
            .expect("join")
            .expect("post-login");
        take_over(&node, id, "Alice").await;
        old.on_disconnect(DisconnectEvent { id })
            .await
            .expect("join")
            .expect("disconnect");

        let started = Utc::now().timestamp_millis();
        node.on_disconnect(DisconnectEvent { id })
            .await
            .expect("join")
            .expect("disconnect");

        assert_eq!(node.cluster().node_of(&id).await.expect("owner"), None);
        assert!(node.cluster().last_online(&id).await.expect("last") >= started);
        assert!(
            node.cluster()
                .players_on_node("p1")
                .await
                .expect("members")
                .is_empty()
        );
        assert!(!node.was_kicked_elsewhere(&id).await.expect("marker"));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_after_marker_expiry_keeps_new_owner_record() {
        let harness = Harness::new();
        let crashed = harness.node(PresenceConfig::new("p2"));
        let node = harness.node(PresenceConfig::new("p1"));
        let id = Uuid::new_v4();

        crashed
            .on_post_login(post_login(id, "Alice"))
            .await
            .expect("join")
            .expect("post-login");
        take_over(&node, id, "Alice").await;

        tokio::time::advance(Duration::from_secs(KICK_MARKER_TTL_SECS + 1)).await;
        assert!(!crashed.was_kicked_elsewhere(&id).await.expect("marker"));

        assert_eq!(crashed.reset_node().await.expect("reset"), 1);

        assert_eq!(
            node.cluster().node_of(&id).await.expect("owner").as_deref(),
            Some("p1")
        );
        assert_eq!(node.cluster().last_online(&id).await.expect("last"), 0);
        assert!(
            harness
                .store
                .set_contains(&online_set_key("p1"), &id.to_string())
                .await
                .expect("sismember")
        );
        assert!(
            crashed
                .cluster()
                .players_on_node("p2")
                .await
                .expect("members")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn cancelled_login_is_left_alone() {
        let harness = Harness::new();
        let old = harness.node(PresenceConfig::new("p2"));
        let node = harness.node(PresenceConfig::new("p1"));
        let id = Uuid::new_v4();
        old.on_post_login(post_login(id, "Alice"))
            .await
            .expect("join")
            .expect("post-login");

        let mut data = harness.data_subscription().await;
        let event = LoginEvent::new(id, "Alice", localhost());
        event.cancel("banned");
        node.on_login(&event).await.expect("join").expect("check");

        assert_eq!(
            event.completed().await,
            LoginOutcome::Denied {
                reason: Some("banned".to_string())
            }
        );
        assert!(
            timeout(Duration::from_millis(50), data.recv())
                .await
                .is_err()
        );
        assert!(!node.was_kicked_elsewhere(&id).await.expect("marker"));
    }

    #[tokio::test]
    async fn ping_reports_cached_cluster_count() {
        let harness = Harness::new();
        let exempt = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9));
        let node = harness.node(PresenceConfig::new("p1").with_exempt_addresses(vec![exempt]));

        for name in ["a", "b"] {
            node.on_post_login(post_login(Uuid::new_v4(), name))
                .await
                .expect("join")
                .expect("post-login");
        }
        assert_eq!(node.tick().await.expect("tick"), 2);

        let mut ping = PingEvent {
            address: localhost(),
            forced_host: false,
            ping_passthrough: false,
            online: 7,
        };
        node.on_ping(&mut ping);
        assert_eq!(ping.online, 2);

        let mut exempt_ping = PingEvent {
            address: exempt,
            ..ping.clone()
        };
        exempt_ping.online = 7;
        node.on_ping(&mut exempt_ping);
        assert_eq!(exempt_ping.online, 7);

        let mut passthrough = PingEvent {
            forced_host: true,
            ping_passthrough: true,
            online: 7,
            ..ping
        };
        node.on_ping(&mut passthrough);
        assert_eq!(passthrough.online, 7);
    }

    #[tokio::test]
    async fn reset_node_logs_out_leftovers() {
        let harness = Harness::new();
        let node = harness.node(PresenceConfig::new("p1"));
        let ids = [Uuid::new_v4(), Uuid::new_v4()];
        for id in ids {
            node.on_post_login(post_login(id, "x"))
                .await
                .expect("join")
                .expect("post-login");
        }

        assert_eq!(node.reset_node().await.expect("reset"), 2);
        assert_eq!(node.cluster().player_count().await.expect("count"), 0);
        for id in ids {
            assert!(node.cluster().last_online(&id).await.expect("last") > 0);
        }
    }
}
