use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// How a login is handled when the identity already looks online.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KickPolicy {
    /// Kick the existing session wherever it lives and let the new one in.
    #[default]
    Takeover,
    /// Refuse the new login while any node lists the identity as online.
    RejectDuplicate,
}

/// Operator-facing messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Messages {
    #[serde(default = "default_already_logged_in")]
    pub already_logged_in: String,
    #[serde(default = "default_logged_in_other_location")]
    pub logged_in_other_location: String,
}

fn default_already_logged_in() -> String {
    "You are already logged on to this network.".to_string()
}

fn default_logged_in_other_location() -> String {
    "You logged in from another location!".to_string()
}

impl Default for Messages {
    fn default() -> Self {
        Self {
            already_logged_in: default_already_logged_in(),
            logged_in_other_location: default_logged_in_other_location(),
        }
    }
}

/// Per-node settings for the presence synchronizer.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    pub node_id: String,
    pub kick_policy: KickPolicy,
    pub messages: Messages,
    /// Probe sources that never get the cluster count.
    pub exempt_addresses: Vec<IpAddr>,
    pub channel_prefix: String,
}

impl PresenceConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            kick_policy: KickPolicy::default(),
            messages: Messages::default(),
            exempt_addresses: Vec::new(),
            channel_prefix: "roster".to_string(),
        }
    }

    pub fn with_kick_policy(mut self, policy: KickPolicy) -> Self {
        self.kick_policy = policy;
        self
    }

    pub fn with_messages(mut self, messages: Messages) -> Self {
        self.messages = messages;
        self
    }

    pub fn with_exempt_addresses(mut self, addresses: Vec<IpAddr>) -> Self {
        self.exempt_addresses = addresses;
        self
    }

    pub fn with_channel_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.channel_prefix = prefix.into();
        self
    }
}
