// SPDX-License-Identifier: PolyForm-Shield-1.0

//! Model lifecycle records on top of a [`HashStore`].
//!
//! Every record lives under its own key (`model:<abbr>`); there are no
//! cross-key transactions, so each method touches a single key at most once
//! for writing. Partial updates go through [`RecordUpdate`], which writes only
//! the fields it names.

use std::sync::Arc;

use cache::{Fields, HashStore};
use protocol::{fields, model_key, ModelRecord, ModelStatus, MODEL_KEY_PREFIX};
use tracing::warn;

use crate::error::RegistryError;

/// Partial update of a record; unset members leave the stored field as is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordUpdate {
    fields: Fields,
}

impl RecordUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(self, status: ModelStatus) -> Self {
        self.with(fields::STATUS, status.as_str())
    }

    pub fn progress(self, progress: u8) -> Self {
        self.with(fields::PROGRESS, progress.to_string())
    }

    pub fn message(self, message: impl Into<String>) -> Self {
        self.with(fields::PROGRESS_MESSAGE, message)
    }

    /// Blank both progress fields.
    pub fn clear_progress(self) -> Self {
        self.with(fields::PROGRESS, "").with(fields::PROGRESS_MESSAGE, "")
    }

    pub fn container_id(self, id: impl Into<String>) -> Self {
        self.with(fields::CONTAINER_ID, id)
    }

    pub fn port(self, port: u16) -> Self {
        self.with(fields::PORT, port.to_string())
    }

    pub fn gpu(self, gpu: u32) -> Self {
        self.with(fields::GPU_DEVICE, gpu.to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    fn into_fields(self) -> Fields {
        self.fields
    }
}

/// Tracks deployed models and their lifecycle state.
#[derive(Clone)]
pub struct ModelRegistry {
    store: Arc<dyn HashStore>,
}

impl ModelRegistry {
    pub fn new(store: Arc<dyn HashStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, abbr: &str) -> Result<Option<ModelRecord>, RegistryError> {
        let Some(raw) = self.store.get(&model_key(abbr)).await? else {
            return Ok(None);
        };
        ModelRecord::from_fields(&raw)
            .map(Some)
            .map_err(|source| RegistryError::Decode {
                abbr: abbr.to_string(),
                source,
            })
    }

    pub async fn require(&self, abbr: &str) -> Result<ModelRecord, RegistryError> {
        self.get(abbr)
            .await?
            .ok_or_else(|| RegistryError::Missing(abbr.to_string()))
    }

    /// Write every field of `record`, replacing leftovers of earlier attempts.
    pub async fn put(&self, record: &ModelRecord) -> Result<(), RegistryError> {
        self.store
            .set(&model_key(&record.abbr), &record.to_fields())
            .await?;
        Ok(())
    }

    /// Apply a partial update to an existing record.
    ///
    /// Returns `false` (and writes nothing) when the record is gone, so a
    /// detached task can never resurrect a deleted model.
    pub async fn update(&self, abbr: &str, update: RecordUpdate) -> Result<bool, RegistryError> {
        let key = model_key(abbr);
        if self.store.get(&key).await?.is_none() {
            return Ok(false);
        }
        if !update.is_empty() {
            self.store.set(&key, &update.into_fields()).await?;
        }
        Ok(true)
    }

    /// Move a record to `next`, refusing moves outside the lifecycle table.
    ///
    /// `extra` is written together with the new status.
    pub async fn transition(
        &self,
        abbr: &str,
        next: ModelStatus,
        extra: RecordUpdate,
    ) -> Result<ModelRecord, RegistryError> {
        let current = self.require(abbr).await?;
        if !current.status.can_transition_to(next) {
            return Err(RegistryError::Transition {
                abbr: abbr.to_string(),
                from: current.status,
                to: next,
            });
        }
        self.store
            .set(&model_key(abbr), &extra.status(next).into_fields())
            .await?;
        self.require(abbr).await
    }

    pub async fn delete(&self, abbr: &str) -> Result<bool, RegistryError> {
        Ok(self.store.delete(&model_key(abbr)).await?)
    }

    /// All readable records, ordered by abbr.
    ///
    /// Undecodable entries are skipped with a warning rather than failing the
    /// whole listing.
    pub async fn list(&self) -> Result<Vec<ModelRecord>, RegistryError> {
        let keys = self.store.keys(MODEL_KEY_PREFIX).await?;
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            match ModelRecord::from_fields(&raw) {
                Ok(record) => records.push(record),
                Err(e) => warn!("neuron::registry: skipping unreadable record {key}: {e}"),
            }
        }
        records.sort_by(|a, b| a.abbr.cmp(&b.abbr));
        Ok(records)
    }

    /// Records in `deploying` or `running`.
    pub async fn list_active(&self) -> Result<Vec<ModelRecord>, RegistryError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|r| r.status.is_active())
            .collect())
    }

    pub async fn list_with_status(
        &self,
        status: ModelStatus,
    ) -> Result<Vec<ModelRecord>, RegistryError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|r| r.status == status)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::record;
    use cache::MemoryHashStore;

    fn registry() -> ModelRegistry {
        ModelRegistry::new(Arc::new(MemoryHashStore::new()))
    }

    #[tokio::test]
    async fn put_get_and_list_round_trip() {
        let registry = registry();
        registry.put(&record("phi", 8100, ModelStatus::Running)).await.unwrap();
        registry.put(&record("big", 8101, ModelStatus::Stopped)).await.unwrap();

        let phi = registry.get("phi").await.unwrap().unwrap();
        assert_eq!(phi.port, 8100);
        assert!(registry.get("nope").await.unwrap().is_none());

        let abbrs: Vec<_> = registry.list().await.unwrap().into_iter().map(|r| r.abbr).collect();
        assert_eq!(abbrs, vec!["big", "phi"]);
        let active: Vec<_> = registry
            .list_active()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.abbr)
            .collect();
        assert_eq!(active, vec!["phi"]);
    }

    #[tokio::test]
    async fn updates_touch_only_named_fields() {
        let registry = registry();
        registry.put(&record("phi", 8100, ModelStatus::Deploying)).await.unwrap();

        let applied = registry
            .update("phi", RecordUpdate::new().progress(42).message("Loading model weights"))
            .await
            .unwrap();
        assert!(applied);

        let phi = registry.require("phi").await.unwrap();
        assert_eq!(phi.progress, Some(42));
        assert_eq!(phi.progress_message.as_deref(), Some("Loading model weights"));
        assert_eq!(phi.port, 8100);
        assert_eq!(phi.status, ModelStatus::Deploying);

        registry
            .update("phi", RecordUpdate::new().clear_progress())
            .await
            .unwrap();
        let phi = registry.require("phi").await.unwrap();
        assert_eq!(phi.progress, None);
        assert_eq!(phi.progress_message, None);
    }

    #[tokio::test]
    async fn updates_never_recreate_deleted_records() {
        let registry = registry();
        registry.put(&record("phi", 8100, ModelStatus::Deploying)).await.unwrap();
        assert!(registry.delete("phi").await.unwrap());

        let applied = registry
            .update("phi", RecordUpdate::new().progress(50))
            .await
            .unwrap();
        assert!(!applied);
        assert!(registry.get("phi").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transitions_follow_the_lifecycle_table() {
        let registry = registry();
        registry.put(&record("phi", 8100, ModelStatus::Deploying)).await.unwrap();

        let err = registry
            .transition("phi", ModelStatus::Stopped, RecordUpdate::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Transition { .. }));

        let phi = registry
            .transition("phi", ModelStatus::Running, RecordUpdate::new().progress(100))
            .await
            .unwrap();
        assert_eq!(phi.status, ModelStatus::Running);
        assert_eq!(phi.progress, Some(100));

        assert!(matches!(
            registry
                .transition("gone", ModelStatus::Running, RecordUpdate::new())
                .await,
            Err(RegistryError::Missing(_))
        ));
    }
}
