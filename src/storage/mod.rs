//! Durable artifact record storage.
//!
//! This module provides the [`RecordStore`] interface the pipeline consumes,
//! two implementations of it, and the single-writer guard through which all
//! pipeline mutations go.
//!
//! # Overview
//!
//! - **RecordStore**: whole-record `get` / `list` / `upsert` / `delete`
//! - **MemoryRecordStore**: in-process store for tests and embedding
//! - **SqliteRecordStore**: SQLite-backed store (sqlx)
//! - **ArtifactWriter**: serializes read-modify-write per artifact id
//!
//! # Usage
//!
//! ```rust,ignore
//! use scribe_forge::storage::{connect, ArtifactWriter, SqliteRecordStore};
//! use std::sync::Arc;
//!
//! let pool = connect("./scribe-forge.db").await?;
//! let store = Arc::new(SqliteRecordStore::new(pool).await?);
//! let writer = ArtifactWriter::new(store);
//!
//! writer
//!     .update("a1", |artifact| {
//!         artifact.title = "Scales in G".to_string();
//!         true
//!     })
//!     .await?;
//! ```

pub mod database;
pub mod memory;
pub mod schema;
pub mod writer;

use async_trait::async_trait;

use crate::artifact::Artifact;
use crate::error::StoreError;

// Re-export main types for convenience
pub use database::{connect, SqliteRecordStore};
pub use memory::MemoryRecordStore;
pub use writer::ArtifactWriter;

/// Durable keyed storage for artifact records.
///
/// Writes are whole-record upserts; there are no field-level updates and no
/// concurrency token. Callers that read-modify-write must go through
/// [`ArtifactWriter`].
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fetch one artifact, `None` if it does not exist.
    async fn get(&self, id: &str) -> Result<Option<Artifact>, StoreError>;

    /// All artifacts, oldest first.
    async fn list(&self) -> Result<Vec<Artifact>, StoreError>;

    /// Insert or replace the whole record.
    async fn upsert(&self, artifact: &Artifact) -> Result<(), StoreError>;

    /// Remove the record. Deleting a missing id is not an error.
    async fn delete(&self, id: &str) -> Result<(), StoreError>;
}
