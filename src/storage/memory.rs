//! In-process record store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::RecordStore;
use crate::artifact::Artifact;
use crate::error::StoreError;

/// Record store backed by a `HashMap`.
///
/// Counts writes and can be told to fail them, which lets tests observe the
/// exact number of store mutations and exercise store-failure paths.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: RwLock<HashMap<String, Artifact>>,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with `artifacts`. Seeding is not counted
    /// as a write.
    pub fn with_artifacts(artifacts: impl IntoIterator<Item = Artifact>) -> Self {
        let records = artifacts
            .into_iter()
            .map(|a| (a.id.clone(), a))
            .collect::<HashMap<_, _>>();
        Self {
            records: RwLock::new(records),
            ..Default::default()
        }
    }

    /// Number of `upsert` and `delete` calls that succeeded.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make subsequent writes fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Corrupt {
                id: String::new(),
                message: "writes disabled".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(&self, id: &str) -> Result<Option<Artifact>, StoreError> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<Artifact>, StoreError> {
        let mut artifacts: Vec<Artifact> = self.records.read().await.values().cloned().collect();
        artifacts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(artifacts)
    }

    async fn upsert(&self, artifact: &Artifact) -> Result<(), StoreError> {
        self.check_writable()?;
        self.records
            .write()
            .await
            .insert(artifact.id.clone(), artifact.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.check_writable()?;
        self.records.write().await.remove(id);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
