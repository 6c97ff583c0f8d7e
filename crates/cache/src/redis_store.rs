// SPDX-License-Identifier: PolyForm-Shield-1.0

//! Redis-backed [`HashStore`]; each key is a native Redis hash.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::hash::{Fields, HashStore};
use crate::CacheError;

#[derive(Clone)]
pub struct RedisHashStore {
    conn: ConnectionManager,
}

impl RedisHashStore {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url).map_err(backend)?;
        let conn = client.get_connection_manager().await.map_err(backend)?;
        Ok(Self { conn })
    }
}

fn backend(e: redis::RedisError) -> CacheError {
    CacheError::Backend(e.to_string())
}

#[async_trait]
impl HashStore for RedisHashStore {
    async fn get(&self, key: &str) -> Result<Option<Fields>, CacheError> {
        let mut conn = self.conn.clone();
        let hash: HashMap<String, String> = conn.hgetall(key).await.map_err(backend)?;
        if hash.is_empty() {
            Ok(None)
        } else {
            Ok(Some(hash.into_iter().collect()))
        }
    }

    async fn set(&self, key: &str, fields: &Fields) -> Result<(), CacheError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let pairs: Vec<(&str, &str)> = fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        conn.hset_multiple::<_, _, _, ()>(key, &pairs)
            .await
            .map_err(backend)
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await.map_err(backend)?;
        Ok(removed > 0)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn.clone();
        let mut keys: Vec<String> = conn.keys(format!("{prefix}*")).await.map_err(backend)?;
        keys.sort();
        Ok(keys)
    }
}
