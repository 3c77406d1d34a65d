//! Database schema constants.
//!
//! This module contains the SQLite schema for artifact records and for the
//! local task registry. Both live in the same database file.

/// SQL schema for the artifacts table.
pub const CREATE_ARTIFACTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS artifacts (
    id                TEXT PRIMARY KEY,
    title             TEXT NOT NULL,
    source_file_path  TEXT NOT NULL,
    transcript        TEXT,
    summary           TEXT,
    pipeline_status   TEXT NOT NULL DEFAULT 'pending',
    title_user_locked INTEGER NOT NULL DEFAULT 0,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_artifacts_status ON artifacts(pipeline_status);
"#;

/// SQL schema for the transfer_tasks table used by the local registry.
///
/// `state` is one of `queued`, `running`, `succeeded`, `failed`. Rows are
/// deleted when the task is cleared or cancelled.
pub const CREATE_TRANSFER_TASKS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS transfer_tasks (
    task_id      TEXT PRIMARY KEY,
    stage        TEXT NOT NULL,
    artifact_id  TEXT,
    spec         TEXT NOT NULL,
    state        TEXT NOT NULL DEFAULT 'queued',
    response     TEXT,
    error        TEXT,
    created_at   TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at   TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_transfer_tasks_state ON transfer_tasks(state);
CREATE INDEX IF NOT EXISTS idx_transfer_tasks_artifact ON transfer_tasks(artifact_id);
"#;
