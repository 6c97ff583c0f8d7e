// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::CacheError;

/// String fields of one hash entry.
pub type Fields = BTreeMap<String, String>;

/// Durable keyed-hash mapping.
///
/// Semantics mirror a Redis hash:
///
/// - `set` merges the given fields into the entry, creating it if needed;
///   fields not named are left untouched.
/// - `keys` enumerates entries whose key starts with `prefix`.
///
/// Each call touches exactly one key. There is no multi-key transaction, so
/// callers that read several keys and then write must tolerate interleaving.
#[async_trait]
pub trait HashStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Fields>, CacheError>;

    async fn set(&self, key: &str, fields: &Fields) -> Result<(), CacheError>;

    /// Returns whether an entry was removed.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Keys starting with `prefix`, sorted.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, CacheError>;
}

/// Non-durable [`HashStore`] for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryHashStore {
    entries: RwLock<HashMap<String, Fields>>,
}

impl MemoryHashStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HashStore for MemoryHashStore {
    async fn get(&self, key: &str) -> Result<Option<Fields>, CacheError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, fields: &Fields) -> Result<(), CacheError> {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(key.to_string()).or_default();
        entry.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        let entries = self.entries.read().await;
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}
