//! Shared store abstraction used as the cluster's source of truth.
//!
//! Every node reads and writes presence through this trait; nothing here keeps
//! authoritative state in process memory.

pub mod factory;
pub mod memory;
pub mod redis;

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;

pub use factory::{Backend, BackendBuilder};
pub use memory::MemoryStore;
pub use redis::RedisStore;

/// Key/value store with set, hash and scalar primitives.
///
/// Each call is atomic for the key it touches; no call spans keys.
#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn set_add(&self, key: &str, member: &str) -> Result<()>;

    async fn set_remove(&self, key: &str, member: &str) -> Result<()>;

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    async fn set_len(&self, key: &str) -> Result<usize>;

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>>;

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()>;

    async fn hash_set_all(&self, key: &str, fields: &[(&str, String)]) -> Result<()>;

    async fn hash_delete(&self, key: &str, fields: &[&str]) -> Result<()>;

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set a scalar that expires after `ttl_secs`.
    async fn set_with_expiry(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Enumerate keys matching a glob pattern (`*` wildcards only).
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>>;
}
