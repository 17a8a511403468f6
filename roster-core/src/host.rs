//! What the core needs from the proxy process it runs in.

use crate::error::Result;
use crate::events::DataPayload;
use async_trait::async_trait;
use uuid::Uuid;

#[async_trait]
pub trait ProxyHost: Send + Sync {
    /// Whether `server` is a server this proxy can route to.
    fn has_server(&self, server: &str) -> bool;

    /// Terminate the local session for `id`. Returns `false` when there is none.
    async fn kick_player(&self, id: &Uuid, reason: &str) -> Result<bool>;

    /// Presence change published by some node, this one included.
    async fn network_event(&self, _payload: &DataPayload) {}
}

/// Runs administrative commands with operator privileges.
#[async_trait]
pub trait CommandDispatcher: Send + Sync {
    async fn dispatch(&self, command: &str) -> Result<()>;
}
