//! Proxy-side state kept by the sidecar on behalf of the proxy it fronts.

use async_trait::async_trait;
use roster_core::{CommandDispatcher, DataPayload, ProxyHost, Result};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::net::IpAddr;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

const MAX_QUEUED_COMMANDS: usize = 1024;

#[derive(Debug, Clone)]
pub(crate) struct LocalSession {
    pub(crate) name: String,
    pub(crate) address: IpAddr,
    pub(crate) server: Option<String>,
    pub(crate) kick_reason: Option<String>,
}

pub(crate) struct SidecarHost {
    servers: BTreeSet<String>,
    sessions: RwLock<HashMap<Uuid, LocalSession>>,
    commands: Mutex<VecDeque<String>>,
}

impl SidecarHost {
    pub(crate) fn new(servers: impl IntoIterator<Item = String>) -> Self {
        Self {
            servers: servers.into_iter().collect(),
            sessions: RwLock::new(HashMap::new()),
            commands: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) async fn open_session(&self, id: Uuid, name: String, address: IpAddr) {
        self.sessions.write().await.insert(
            id,
            LocalSession {
                name,
                address,
                server: None,
                kick_reason: None,
            },
        );
    }

    pub(crate) async fn move_session(&self, id: &Uuid, server: &str) {
        if let Some(session) = self.sessions.write().await.get_mut(id) {
            session.server = Some(server.to_string());
        }
    }

    pub(crate) async fn close_session(&self, id: &Uuid) -> Option<LocalSession> {
        self.sessions.write().await.remove(id)
    }

    pub(crate) async fn session(&self, id: &Uuid) -> Option<LocalSession> {
        self.sessions.read().await.get(id).cloned()
    }

    pub(crate) async fn drain_commands(&self) -> Vec<String> {
        self.commands.lock().await.drain(..).collect()
    }
}

#[async_trait]
impl ProxyHost for SidecarHost {
    fn has_server(&self, server: &str) -> bool {
        self.servers.contains(server)
    }

    async fn kick_player(&self, id: &Uuid, reason: &str) -> Result<bool> {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(id) else {
            return Ok(false);
        };
        session.kick_reason = Some(reason.to_string());
        Ok(true)
    }

    async fn network_event(&self, payload: &DataPayload) {
        tracing::debug!("Network event: {:?}", payload);
    }
}

#[async_trait]
impl CommandDispatcher for SidecarHost {
    async fn dispatch(&self, command: &str) -> Result<()> {
        let mut commands = self.commands.lock().await;
        if commands.len() >= MAX_QUEUED_COMMANDS {
            if let Some(dropped) = commands.pop_front() {
                tracing::warn!("Command queue full, dropping oldest: {}", dropped);
            }
        }
        commands.push_back(command.to_string());
        Ok(())
    }
}
