use crate::error::{Result, RosterError};
use crate::store::SharedStore;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone)]
enum Entry {
    Scalar {
        value: String,
        expires_at: Option<Instant>,
    },
    Set(BTreeSet<String>),
    Hash(HashMap<String, String>),
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self, Entry::Scalar { expires_at: Some(at), .. } if *at <= now)
    }
}

/// In-process store for single-node deployments and tests.
///
/// Clones share the same data, so several `PresenceSync` instances built on
/// clones of one `MemoryStore` behave like nodes of one cluster.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn wrong_type(key: &str) -> RosterError {
    RosterError::Store(format!(
        "WRONGTYPE operation against key '{}' holding the wrong kind of value",
        key
    ))
}

/// Glob match supporting `*` only.
fn glob_match(pattern: &str, value: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == value;
    }

    let mut rest = value;
    for (index, part) in parts.iter().enumerate() {
        if index == 0 {
            match rest.strip_prefix(part) {
                Some(stripped) => rest = stripped,
                None => return false,
            }
        } else if index == parts.len() - 1 {
            return rest.ends_with(part);
        } else if let Some(position) = rest.find(part) {
            rest = &rest[position + part.len()..];
        } else {
            return false;
        }
    }

    true
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        match entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Set(BTreeSet::new()))
        {
            Entry::Set(members) => {
                members.insert(member.to_string());
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        let now_empty = match entries.get_mut(key) {
            Some(Entry::Set(members)) => {
                members.remove(member);
                members.is_empty()
            }
            Some(_) => return Err(wrong_type(key)),
            None => false,
        };

        if now_empty {
            entries.remove(key);
        }
        Ok(())
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool> {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(Entry::Set(members)) => Ok(members.contains(member)),
            Some(_) => Err(wrong_type(key)),
            None => Ok(false),
        }
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(Entry::Set(members)) => Ok(members.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(Vec::new()),
        }
    }

    async fn set_len(&self, key: &str) -> Result<usize> {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(Entry::Set(members)) => Ok(members.len()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(0),
        }
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(Entry::Hash(fields)) => Ok(fields.get(field).cloned()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.hash_set_all(key, &[(field, value.to_string())]).await
    }

    async fn hash_set_all(&self, key: &str, fields: &[(&str, String)]) -> Result<()> {
        let mut entries = self.entries.write().await;
        match entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Hash(HashMap::new()))
        {
            Entry::Hash(existing) => {
                for (field, value) in fields {
                    existing.insert(field.to_string(), value.clone());
                }
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn hash_delete(&self, key: &str, fields: &[&str]) -> Result<()> {
        let mut entries = self.entries.write().await;
        let now_empty = match entries.get_mut(key) {
            Some(Entry::Hash(existing)) => {
                for field in fields {
                    existing.remove(*field);
                }
                existing.is_empty()
            }
            Some(_) => return Err(wrong_type(key)),
            None => false,
        };

        if now_empty {
            entries.remove(key);
        }
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(Entry::Hash(fields)) => Ok(fields.clone()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(HashMap::new()),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if entry.is_expired(now) => {}
                Some(Entry::Scalar { value, .. }) => return Ok(Some(value.clone())),
                Some(_) => return Err(wrong_type(key)),
                None => return Ok(None),
            }
        }

        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let now = Instant::now();
        let expires_at = now + Duration::from_secs(ttl_secs);
        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| !entry.is_expired(now));
        entries.insert(
            key.to_string(),
            Entry::Scalar {
                value: value.to_string(),
                expires_at: Some(expires_at),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(key, entry)| !entry.is_expired(now) && glob_match(pattern, key))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
