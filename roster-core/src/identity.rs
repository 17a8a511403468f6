//! Identity ⇄ display name directory.

use crate::error::{Result, RosterError};
use crate::keys::{IDENTITY_IDS_KEY, IDENTITY_NAMES_KEY};
use crate::store::SharedStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Name/identity lookups.
///
/// `Ok(None)` means the name or id is unknown; `Err` means the lookup itself
/// failed. `allow_remote` permits going beyond the cluster's own records.
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    async fn name_to_id(&self, name: &str, allow_remote: bool) -> Result<Option<Uuid>>;

    async fn id_to_name(&self, id: &Uuid, allow_remote: bool) -> Result<Option<String>>;

    async fn persist(&self, name: &str, id: &Uuid) -> Result<()>;
}

/// Authority consulted for identities the cluster has never seen.
#[async_trait]
pub trait RemoteIdentityResolver: Send + Sync {
    async fn lookup_name(&self, name: &str) -> Result<Option<Uuid>>;

    async fn lookup_id(&self, id: &Uuid) -> Result<Option<String>>;
}

#[derive(Default)]
struct DirectoryCache {
    ids_by_name: HashMap<String, Uuid>,
    names_by_id: HashMap<Uuid, String>,
}

impl DirectoryCache {
    fn insert(&mut self, name: &str, id: Uuid) {
        self.ids_by_name.insert(name.to_lowercase(), id);
        self.names_by_id.insert(id, name.to_string());
    }
}

/// Directory backed by the shared store with an in-process cache.
pub struct StoreIdentityDirectory {
    store: Arc<dyn SharedStore>,
    remote: Option<Arc<dyn RemoteIdentityResolver>>,
    cache: RwLock<DirectoryCache>,
}

impl StoreIdentityDirectory {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self {
            store,
            remote: None,
            cache: RwLock::new(DirectoryCache::default()),
        }
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteIdentityResolver>) -> Self {
        self.remote = Some(remote);
        self
    }
}

#[async_trait]
impl IdentityDirectory for StoreIdentityDirectory {
    async fn name_to_id(&self, name: &str, allow_remote: bool) -> Result<Option<Uuid>> {
        let lowered = name.to_lowercase();
        if let Some(id) = self.cache.read().await.ids_by_name.get(&lowered) {
            return Ok(Some(*id));
        }

        if let Some(raw) = self.store.hash_get(IDENTITY_NAMES_KEY, &lowered).await? {
            let id = Uuid::parse_str(&raw).map_err(|error| {
                RosterError::Store(format!("corrupt identity for '{}': {}", name, error))
            })?;
            self.cache.write().await.insert(name, id);
            return Ok(Some(id));
        }

        match (&self.remote, allow_remote) {
            (Some(remote), true) => {
                let found = remote.lookup_name(name).await?;
                if let Some(id) = found {
                    self.persist(name, &id).await?;
                }
                Ok(found)
            }
            _ => Ok(None),
        }
    }

    async fn id_to_name(&self, id: &Uuid, allow_remote: bool) -> Result<Option<String>> {
        if let Some(name) = self.cache.read().await.names_by_id.get(id) {
            return Ok(Some(name.clone()));
        }

        if let Some(name) = self
            .store
            .hash_get(IDENTITY_IDS_KEY, &id.to_string())
            .await?
        {
            self.cache.write().await.insert(&name, *id);
            return Ok(Some(name));
        }

        match (&self.remote, allow_remote) {
            (Some(remote), true) => {
                let found = remote.lookup_id(id).await?;
                if let Some(name) = &found {
                    self.persist(name, id).await?;
                }
                Ok(found)
            }
            _ => Ok(None),
        }
    }

    async fn persist(&self, name: &str, id: &Uuid) -> Result<()> {
        self.store
            .hash_set(IDENTITY_NAMES_KEY, &name.to_lowercase(), &id.to_string())
            .await?;
        self.store
            .hash_set(IDENTITY_IDS_KEY, &id.to_string(), name)
            .await?;
        self.cache.write().await.insert(name, *id);
        Ok(())
    }
}
