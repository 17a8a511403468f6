//! Roster Core - cluster-wide presence synchronization for stateless proxy nodes

pub mod bridge;
pub mod bus;
pub mod cluster;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod host;
pub mod identity;
pub mod intent;
pub mod keys;
pub mod node;
pub mod presence;
pub mod relay;
pub mod store;

pub use bridge::{
    MODE_COUNT, MODE_PLAYERS, QueryBridge, QueryMessage, QueryRequest, QueryResponse, ReplySink,
    SCOPE_ALL,
};
pub use bus::{Bus, BusMessage, BusSubscription, MemoryBus, RedisBus};
pub use cluster::{ClusterView, NEVER_SEEN};
pub use codec::{DataInput, DataOutput};
pub use config::{KickPolicy, Messages, PresenceConfig};
pub use error::{Result, RosterError};
pub use events::{DataPayload, DisconnectEvent, PingEvent, PostLoginEvent, ServerSwitchEvent};
pub use host::{CommandDispatcher, ProxyHost};
pub use identity::{IdentityDirectory, RemoteIdentityResolver, StoreIdentityDirectory};
pub use intent::{IntentToken, LoginEvent, LoginOutcome};
pub use keys::{
    Channels, ONLINE_SET_PATTERN, kicked_marker_key, online_set_key, online_set_node, player_key,
};
pub use node::{HEARTBEAT_TIMEOUT_SECS, NodeInfo, NodeRegistry};
pub use presence::{KICK_MARKER_TTL_SECS, PresenceSync};
pub use relay::{CommandPolicy, CommandRelay, DataRelay, supervise};
pub use store::{Backend, BackendBuilder, MemoryStore, RedisStore, SharedStore};
