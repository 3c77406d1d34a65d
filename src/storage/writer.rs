//! Single-writer guard over a [`RecordStore`].
//!
//! The store only offers whole-record upserts, so two tasks doing
//! read-modify-write on the same artifact would lose each other's updates.
//! [`ArtifactWriter`] holds a per-artifact async lock across the read and
//! the write.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;

use super::RecordStore;
use crate::artifact::Artifact;
use crate::error::StoreError;

/// Serializes mutations per artifact id.
#[derive(Clone)]
pub struct ArtifactWriter {
    store: Arc<dyn RecordStore>,
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl ArtifactWriter {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    fn lock_for(&self, id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Reads the current record. Reads do not take the lock.
    pub async fn get(&self, id: &str) -> Result<Option<Artifact>, StoreError> {
        self.store.get(id).await
    }

    pub async fn list(&self) -> Result<Vec<Artifact>, StoreError> {
        self.store.list().await
    }

    /// Stores a new record.
    pub async fn insert(&self, artifact: &Artifact) -> Result<(), StoreError> {
        let lock = self.lock_for(&artifact.id);
        let _guard = lock.lock().await;
        self.store.upsert(artifact).await
    }

    /// Applies `mutate` to the freshest copy of the record and writes it back.
    ///
    /// `mutate` returns whether it changed anything; when it returns `false`
    /// nothing is written. Returns the record as it stands afterwards, or
    /// `None` if the artifact does not exist.
    pub async fn update<F>(&self, id: &str, mutate: F) -> Result<Option<Artifact>, StoreError>
    where
        F: FnOnce(&mut Artifact) -> bool + Send,
    {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let Some(mut artifact) = self.store.get(id).await? else {
            return Ok(None);
        };
        if mutate(&mut artifact) {
            artifact.touch();
            self.store.upsert(&artifact).await?;
        }
        Ok(Some(artifact))
    }

    /// Removes the record and forgets its lock.
    pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let lock = self.lock_for(id);
        {
            let _guard = lock.lock().await;
            self.store.delete(id).await?;
        }
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(id);
        Ok(())
    }
}
