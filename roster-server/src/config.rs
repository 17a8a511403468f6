use roster_core::{BackendBuilder, CommandPolicy, KickPolicy, Messages, PresenceConfig, Result, RosterError};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node_id: String,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    pub backend: BackendConfig,
    #[serde(default)]
    pub presence: PresenceSettings,
    /// Servers the fronted proxy can route to.
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(rename = "type")]
    pub kind: BackendKind,
    pub redis: Option<RedisConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Redis,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceSettings {
    #[serde(default)]
    pub kick_policy: KickPolicy,
    #[serde(default)]
    pub messages: Messages,
    #[serde(default)]
    pub exempt_addresses: Vec<IpAddr>,
    #[serde(default = "default_channel_prefix")]
    pub channel_prefix: String,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            kick_policy: KickPolicy::default(),
            messages: Messages::default(),
            exempt_addresses: Vec::new(),
            channel_prefix: default_channel_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_bridge_channels")]
    pub channels: Vec<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            channels: default_bridge_channels(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Command roots the relay may run; unset relays everything.
    #[serde(default)]
    pub allowed_commands: Option<Vec<String>>,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8420".to_string()
}

fn default_channel_prefix() -> String {
    "roster".to_string()
}

fn default_bridge_channels() -> Vec<String> {
    vec!["Roster".to_string(), "roster:main".to_string()]
}

fn default_heartbeat_interval_secs() -> u64 {
    5
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        Self::load(
            ::config::Config::builder()
                .add_source(::config::File::with_name(path))
                .add_source(::config::Environment::with_prefix("ROSTER").separator("__")),
        )
    }

    fn load(
        builder: ::config::ConfigBuilder<::config::builder::DefaultState>,
    ) -> Result<Self> {
        let settings = builder
            .build()
            .map_err(|e| RosterError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| RosterError::Config(e.to_string()))?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(RosterError::Config("node_id cannot be empty".to_string()));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(RosterError::Config(
                "heartbeat_interval_secs must be positive".to_string(),
            ));
        }
        if self.backend.kind == BackendKind::Redis
            && self
                .backend
                .redis
                .as_ref()
                .map(|redis| redis.url.trim().is_empty())
                .unwrap_or(true)
        {
            return Err(RosterError::Config(
                "backend.redis.url is required when backend.type=redis".to_string(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn presence_config(&self) -> PresenceConfig {
        PresenceConfig::new(self.node_id.clone())
            .with_kick_policy(self.presence.kick_policy)
            .with_messages(self.presence.messages.clone())
            .with_exempt_addresses(self.presence.exempt_addresses.clone())
            .with_channel_prefix(self.presence.channel_prefix.clone())
    }

    pub fn command_policy(&self) -> CommandPolicy {
        match &self.relay.allowed_commands {
            Some(roots) => CommandPolicy::allow_only(roots),
            None => CommandPolicy::allow_all(),
        }
    }

    pub fn backend_builder(&self) -> BackendBuilder {
        match self.backend.kind {
            BackendKind::Redis => {
                let url = self
                    .backend
                    .redis
                    .as_ref()
                    .map(|cfg| cfg.url.clone())
                    .unwrap_or_default();

                BackendBuilder::new().backend("redis").redis_url(url)
            }
            BackendKind::Memory => BackendBuilder::new().backend("memory"),
        }
    }
}
