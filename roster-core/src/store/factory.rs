use super::{MemoryStore, RedisStore, SharedStore};
use crate::bus::{Bus, MemoryBus};
use crate::{Result, RosterError};
use std::sync::Arc;

/// Store and bus a node talks to.
#[derive(Clone)]
pub struct Backend {
    pub store: Arc<dyn SharedStore>,
    pub bus: Arc<dyn Bus>,
}

#[derive(Debug, Clone, Default)]
pub struct BackendBuilder {
    backend: Option<String>,
    redis_url: Option<String>,
}

impl BackendBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    fn resolve_backend(&self) -> Result<String> {
        let backend = self
            .backend
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        if backend.is_empty() {
            return Err(RosterError::Config("backend cannot be empty".to_string()));
        }

        Ok(backend)
    }

    pub async fn build(&self) -> Result<Backend> {
        let backend = self.resolve_backend()?;

        match backend.as_str() {
            "redis" => {
                let url = self.redis_url.as_deref().unwrap_or_default().trim();
                if url.is_empty() {
                    return Err(RosterError::Config(
                        "redis url is required for redis backend".to_string(),
                    ));
                }

                let store = RedisStore::new(url).await?;
                let bus = store.bus();
                Ok(Backend {
                    store: Arc::new(store),
                    bus: Arc::new(bus),
                })
            }
            "memory" => {
                tracing::warn!("Using in-memory backend; presence is not shared with other nodes");
                Ok(Backend {
                    store: Arc::new(MemoryStore::new()),
                    bus: Arc::new(MemoryBus::new()),
                })
            }
            other => Err(RosterError::Config(format!(
                "unsupported backend: {}",
                other
            ))),
        }
    }
}
