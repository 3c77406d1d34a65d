//! SQLite-backed record store.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};

use super::schema::CREATE_ARTIFACTS_TABLE;
use super::RecordStore;
use crate::artifact::{Artifact, PipelineStatus};
use crate::error::StoreError;

/// Opens (creating if needed) the SQLite database at `path`.
///
/// The artifact store and the local task registry share one pool.
pub async fn connect(path: &str) -> Result<SqlitePool, sqlx::Error> {
    let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal);

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(opts)
        .await?;

    tracing::info!(path = path, "Database opened");
    Ok(pool)
}

/// Record store persisting artifacts in the `artifacts` table.
#[derive(Clone)]
pub struct SqliteRecordStore {
    pool: SqlitePool,
}

impl SqliteRecordStore {
    /// Wraps `pool`, creating the artifacts table if it is missing.
    pub async fn new(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::query(CREATE_ARTIFACTS_TABLE).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Shorthand for [`connect`] followed by [`SqliteRecordStore::new`].
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let pool = connect(path).await?;
        Self::new(pool).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn row_to_artifact(row: &SqliteRow) -> Result<Artifact, StoreError> {
        let id: String = row.get("id");
        let corrupt = |message: String| StoreError::Corrupt {
            id: id.clone(),
            message,
        };

        let status: String = row.get("pipeline_status");
        let pipeline_status = PipelineStatus::from_str(&status).map_err(corrupt)?;
        let created_at = parse_timestamp(row.get("created_at")).map_err(corrupt)?;
        let updated_at = parse_timestamp(row.get("updated_at")).map_err(corrupt)?;
        let source: String = row.get("source_file_path");

        Ok(Artifact {
            id: id.clone(),
            title: row.get("title"),
            source_file_path: source.into(),
            transcript: row.get("transcript"),
            summary: row.get("summary"),
            pipeline_status,
            title_user_locked: row.get::<i32, _>("title_user_locked") != 0,
            created_at,
            updated_at,
        })
    }
}

fn parse_timestamp(value: String) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("invalid timestamp '{}': {}", value, e))
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn get(&self, id: &str) -> Result<Option<Artifact>, StoreError> {
        let row = sqlx::query("SELECT * FROM artifacts WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_artifact).transpose()
    }

    async fn list(&self) -> Result<Vec<Artifact>, StoreError> {
        let rows = sqlx::query("SELECT * FROM artifacts ORDER BY created_at ASC, id ASC")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_artifact).collect()
    }

    async fn upsert(&self, artifact: &Artifact) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO artifacts (
                id, title, source_file_path, transcript, summary,
                pipeline_status, title_user_locked, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                source_file_path = excluded.source_file_path,
                transcript = excluded.transcript,
                summary = excluded.summary,
                pipeline_status = excluded.pipeline_status,
                title_user_locked = excluded.title_user_locked,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at"#,
        )
        .bind(&artifact.id)
        .bind(&artifact.title)
        .bind(artifact.source_file_path.to_string_lossy().into_owned())
        .bind(&artifact.transcript)
        .bind(&artifact.summary)
        .bind(artifact.pipeline_status.as_str())
        .bind(artifact.title_user_locked as i32)
        .bind(artifact.created_at.to_rfc3339())
        .bind(artifact.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM artifacts WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
