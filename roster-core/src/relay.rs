//! Bus listeners: administrative commands and presence payloads.

use crate::bus::{Bus, BusMessage};
use crate::error::{Result, RosterError};
use crate::events::DataPayload;
use crate::host::{CommandDispatcher, ProxyHost};
use crate::presence::PresenceSync;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tokio::time::{Duration, Instant, sleep};

const RESUBSCRIBE_MIN_DELAY: Duration = Duration::from_millis(500);
const RESUBSCRIBE_MAX_DELAY: Duration = Duration::from_secs(30);

/// Which relayed commands may run. Unrestricted unless roots are listed.
#[derive(Debug, Clone, Default)]
pub struct CommandPolicy {
    allowed_roots: Option<BTreeSet<String>>,
}

impl CommandPolicy {
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Only commands whose first word is one of `roots` (case-insensitive).
    pub fn allow_only<I, S>(roots: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed_roots: Some(
                roots
                    .into_iter()
                    .map(|root| root.as_ref().trim().to_lowercase())
                    .filter(|root| !root.is_empty())
                    .collect(),
            ),
        }
    }

    pub fn is_restricted(&self) -> bool {
        self.allowed_roots.is_some()
    }

    pub fn permits(&self, command: &str) -> bool {
        let Some(roots) = &self.allowed_roots else {
            return true;
        };
        command
            .split_whitespace()
            .next()
            .map(|root| roots.contains(&root.to_lowercase()))
            .unwrap_or(false)
    }
}

/// Runs text published on the command channels as an operator command.
///
/// Senders are not authenticated: anyone who can publish to the bus can run
/// commands on every node unless a [`CommandPolicy`] narrows it down.
#[derive(Clone)]
pub struct CommandRelay {
    channels: Vec<String>,
    bus: Arc<dyn Bus>,
    dispatcher: Arc<dyn CommandDispatcher>,
    policy: CommandPolicy,
}

impl CommandRelay {
    pub fn new(
        presence: &PresenceSync,
        dispatcher: Arc<dyn CommandDispatcher>,
        policy: CommandPolicy,
    ) -> Self {
        Self {
            channels: presence.channels().command_channels(),
            bus: presence.bus().clone(),
            dispatcher,
            policy,
        }
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    /// Returns whether the message was handed to the dispatcher.
    pub async fn handle_message(&self, message: &BusMessage) -> Result<bool> {
        if !self.channels.contains(&message.channel) {
            return Ok(false);
        }

        let command = message
            .payload
            .strip_prefix('/')
            .unwrap_or(&message.payload);
        if command.trim().is_empty() {
            tracing::debug!("Ignoring empty command on {}", message.channel);
            return Ok(false);
        }

        if !self.policy.permits(command) {
            tracing::warn!(
                "Refusing command from {} outside the allow-list: {}",
                message.channel,
                command
            );
            return Ok(false);
        }

        tracing::info!("Invoking command via bus: {}", command);
        self.dispatcher.dispatch(command).await?;
        Ok(true)
    }

    /// Relay until the subscription ends.
    pub async fn run(self) -> Result<()> {
        let mut subscription = self.bus.subscribe(&self.channels).await?;
        tracing::info!("Command relay listening on {}", self.channels.join(", "));

        while let Some(message) = subscription.recv().await {
            if let Err(error) = self.handle_message(&message).await {
                tracing::warn!("Relayed command on {} failed: {}", message.channel, error);
            }
        }

        Err(RosterError::Bus("command subscription closed".to_string()))
    }
}

/// Applies presence payloads from the data channel to the local proxy.
#[derive(Clone)]
pub struct DataRelay {
    node_id: String,
    channel: String,
    bus: Arc<dyn Bus>,
    host: Arc<dyn ProxyHost>,
}

impl DataRelay {
    pub fn new(presence: &PresenceSync, host: Arc<dyn ProxyHost>) -> Self {
        Self {
            node_id: presence.node_id().to_string(),
            channel: presence.channels().data.clone(),
            bus: presence.bus().clone(),
            host,
        }
    }

    pub async fn handle_message(&self, message: &BusMessage) -> Result<()> {
        if message.channel != self.channel {
            return Ok(());
        }

        let payload = match DataPayload::from_json(&message.payload) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::debug!("Dropping malformed data payload: {}", error);
                return Ok(());
            }
        };

        if let DataPayload::Kick { id, node, reason } = &payload
            && *node == self.node_id
        {
            let kicked = self.host.kick_player(id, reason).await?;
            if kicked {
                tracing::info!("Kicked {} after it logged in on another node", id);
            } else {
                tracing::debug!("Takeover for {} found no local session", id);
            }
        }

        self.host.network_event(&payload).await;
        Ok(())
    }

    pub async fn run(self) -> Result<()> {
        let mut subscription = self
            .bus
            .subscribe(std::slice::from_ref(&self.channel))
            .await?;

        while let Some(message) = subscription.recv().await {
            if let Err(error) = self.handle_message(&message).await {
                tracing::warn!("Data payload on {} failed: {}", message.channel, error);
            }
        }

        Err(RosterError::Bus("data subscription closed".to_string()))
    }
}

/// Keep a relay running, resubscribing with backoff whenever it stops.
///
/// `relay` is called again for every attempt. The delay resets once an
/// attempt has stayed up longer than the maximum delay.
pub async fn supervise<F, Fut>(name: &str, mut relay: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut delay = RESUBSCRIBE_MIN_DELAY;
    loop {
        let started = Instant::now();
        match relay().await {
            Ok(()) => tracing::warn!("{} stopped", name),
            Err(error) => tracing::warn!("{} stopped: {}", name, error),
        }

        if started.elapsed() > RESUBSCRIBE_MAX_DELAY {
            delay = RESUBSCRIBE_MIN_DELAY;
        }
        tracing::info!("Resubscribing {} in {:?}", name, delay);
        sleep(delay).await;
        delay = (delay * 2).min(RESUBSCRIBE_MAX_DELAY);
    }
}
