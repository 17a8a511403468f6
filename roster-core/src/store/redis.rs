use crate::bus::RedisBus;
use crate::error::{Result, RosterError};
use crate::store::SharedStore;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use std::collections::HashMap;

const SCAN_BATCH: usize = 500;

/// Redis-backed shared store.
pub struct RedisStore {
    client: Client,
    conn: MultiplexedConnection,
}

impl RedisStore {
    pub async fn new(url: &str) -> Result<Self> {
        let client = Client::open(url)
            .map_err(|e| RosterError::Config(format!("Failed to connect to Redis: {}", e)))?;

        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| RosterError::Config(format!("Failed to connect to Redis: {}", e)))?;

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| RosterError::Config(format!("Redis ping failed: {}", e)))?;

        Ok(Self { client, conn })
    }

    /// A bus sharing this store's client.
    pub fn bus(&self) -> RedisBus {
        RedisBus::new(self.client.clone(), self.conn.clone())
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }
}

fn store_error(op: &str, key: &str, error: redis::RedisError) -> RosterError {
    RosterError::Store(format!("{} {} failed: {}", op, key, error))
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        let _: () = self
            .conn()
            .sadd(key, member)
            .await
            .map_err(|e| store_error("SADD", key, e))?;
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        let _: () = self
            .conn()
            .srem(key, member)
            .await
            .map_err(|e| store_error("SREM", key, e))?;
        Ok(())
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool> {
        self.conn()
            .sismember(key, member)
            .await
            .map_err(|e| store_error("SISMEMBER", key, e))
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        self.conn()
            .smembers(key)
            .await
            .map_err(|e| store_error("SMEMBERS", key, e))
    }

    async fn set_len(&self, key: &str) -> Result<usize> {
        self.conn()
            .scard(key)
            .await
            .map_err(|e| store_error("SCARD", key, e))
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.conn()
            .hget(key, field)
            .await
            .map_err(|e| store_error("HGET", key, e))
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let _: () = self
            .conn()
            .hset(key, field, value)
            .await
            .map_err(|e| store_error("HSET", key, e))?;
        Ok(())
    }

    async fn hash_set_all(&self, key: &str, fields: &[(&str, String)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }

        let _: () = self
            .conn()
            .hset_multiple(key, fields)
            .await
            .map_err(|e| store_error("HSET", key, e))?;
        Ok(())
    }

    async fn hash_delete(&self, key: &str, fields: &[&str]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }

        let _: () = self
            .conn()
            .hdel(key, fields)
            .await
            .map_err(|e| store_error("HDEL", key, e))?;
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        self.conn()
            .hgetall(key)
            .await
            .map_err(|e| store_error("HGETALL", key, e))
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.conn()
            .get(key)
            .await
            .map_err(|e| store_error("GET", key, e))
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let _: () = self
            .conn()
            .set_ex(key, value, ttl_secs)
            .await
            .map_err(|e| store_error("SETEX", key, e))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let _: () = self
            .conn()
            .del(key)
            .await
            .map_err(|e| store_error("DEL", key, e))?;
        Ok(())
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(|e| store_error("SCAN", pattern, e))?;

            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}
