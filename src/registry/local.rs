//! SQLite-backed task registry that executes tasks in-process.
//!
//! Tasks are rows in the `transfer_tasks` table. A dispatcher claims queued
//! rows, performs each HTTP request on its own tokio task, stores the
//! outcome on the row and only then emits the terminal event. Because the
//! outcome is durable until the task is cleared, a restart between
//! execution and handling re-delivers the event instead of losing it.
//!
//! # Restart semantics
//!
//! - Rows left `running` by a dead process are re-queued by
//!   [`LocalTaskRegistry::recover_interrupted`], which only the process
//!   owning the dispatcher calls
//! - Rows already `succeeded`/`failed` but never cleared are re-emitted when
//!   the dispatcher starts

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{ActiveTask, TaskEvent, TaskId, TaskMetadata, TaskRegistry, TaskSpec, TaskState};
use crate::artifact::StageKind;
use crate::error::RegistryError;
use crate::storage::schema::CREATE_TRANSFER_TASKS_TABLE;

/// Request timeout for a single task. Audio uploads can be large.
const REQUEST_TIMEOUT_SECS: u64 = 600;

/// Default interval between queue scans when nothing wakes the dispatcher.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

struct Inner {
    pool: SqlitePool,
    client: Client,
    events_tx: mpsc::UnboundedSender<TaskEvent>,
    wake: Notify,
    running: Mutex<HashMap<TaskId, AbortHandle>>,
}

impl Inner {
    fn running(&self) -> MutexGuard<'_, HashMap<TaskId, AbortHandle>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Durable task registry executing stage requests with `reqwest`.
pub struct LocalTaskRegistry {
    inner: Arc<Inner>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TaskEvent>>>,
    poll_interval: Duration,
}

impl LocalTaskRegistry {
    /// Opens the registry on `pool`, creating its table if needed.
    ///
    /// Opening never touches existing rows, so any number of short-lived
    /// processes may open the database while a dispatcher is running.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError` if the schema cannot be created or the HTTP
    /// client cannot be built.
    pub async fn open(pool: SqlitePool) -> Result<Self, RegistryError> {
        sqlx::query(CREATE_TRANSFER_TASKS_TABLE)
            .execute(&pool)
            .await?;

        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| RegistryError::Unavailable(format!("HTTP client: {}", e)))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            inner: Arc::new(Inner {
                pool,
                client,
                events_tx,
                wake: Notify::new(),
                running: Mutex::new(HashMap::new()),
            }),
            events_rx: Mutex::new(Some(events_rx)),
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Re-queues tasks a dead dispatcher left `running`.
    ///
    /// Only the process that is about to own the dispatcher may call this,
    /// before [`LocalTaskRegistry::spawn_dispatcher`]. A row is `running` only
    /// while some dispatcher executes it, so calling this next to a live
    /// dispatcher would execute its in-flight tasks twice.
    pub async fn recover_interrupted(&self) -> Result<u64, RegistryError> {
        let requeued = sqlx::query(
            "UPDATE transfer_tasks SET state = 'queued', updated_at = datetime('now') WHERE state = 'running'",
        )
        .execute(&self.inner.pool)
        .await?
        .rows_affected();
        if requeued > 0 {
            info!(requeued = requeued, "Re-queued interrupted transfer tasks");
        }
        Ok(requeued)
    }

    /// Sets how often the dispatcher rescans the queue without a wake-up.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Spawns the dispatcher. It runs until `shutdown` fires, then aborts
    /// in-flight requests; those rows stay `running` and are re-queued by
    /// the next [`LocalTaskRegistry::recover_interrupted`].
    pub fn spawn_dispatcher(&self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let poll_interval = self.poll_interval;
        tokio::spawn(dispatch_loop(inner, shutdown, poll_interval))
    }
}

async fn dispatch_loop(
    inner: Arc<Inner>,
    mut shutdown: broadcast::Receiver<()>,
    poll_interval: Duration,
) {
    info!("Transfer dispatcher started");

    match redeliver_finished(&inner).await {
        Ok(0) => {}
        Ok(count) => info!(count = count, "Re-delivered finished transfer tasks"),
        Err(e) => warn!(error = %e, "Failed to re-deliver finished transfer tasks"),
    }

    loop {
        loop {
            match claim_next(&inner.pool).await {
                Ok(Some((task_id, spec))) => launch(&inner, task_id, spec),
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "Failed to claim transfer task");
                    break;
                }
            }
        }

        tokio::select! {
            _ = shutdown.recv() => break,
            _ = inner.wake.notified() => {}
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }

    for (_, handle) in inner.running().drain() {
        handle.abort();
    }
    info!("Transfer dispatcher stopped");
}

/// Emits events for tasks that finished but were never cleared.
async fn redeliver_finished(inner: &Inner) -> Result<usize, RegistryError> {
    let rows = sqlx::query(
        "SELECT task_id, stage, artifact_id, state, response, error FROM transfer_tasks \
         WHERE state IN ('succeeded', 'failed') ORDER BY updated_at ASC",
    )
    .fetch_all(&inner.pool)
    .await?;

    let mut delivered = 0;
    for row in rows {
        let task_id: String = row.get("task_id");
        let Ok(stage) = StageKind::from_str(row.get::<String, _>("stage").as_str()) else {
            warn!(task_id = %task_id, "Skipping finished task with unknown stage");
            continue;
        };
        let artifact_id: Option<String> = row.get("artifact_id");
        let state: String = row.get("state");

        let event = if state == TaskState::Succeeded.as_str() {
            TaskEvent::Completed {
                task_id,
                stage,
                artifact_id,
                raw_response: row.get::<Option<String>, _>("response").unwrap_or_default(),
            }
        } else {
            TaskEvent::Failed {
                task_id,
                stage,
                artifact_id,
                error_message: row.get::<Option<String>, _>("error").unwrap_or_default(),
            }
        };
        if inner.events_tx.send(event).is_ok() {
            delivered += 1;
        }
    }
    Ok(delivered)
}

/// Atomically moves the oldest queued row to `running`.
async fn claim_next(pool: &SqlitePool) -> Result<Option<(TaskId, TaskSpec)>, RegistryError> {
    let row = sqlx::query(
        r#"UPDATE transfer_tasks
           SET state = 'running', updated_at = datetime('now')
           WHERE task_id = (
               SELECT task_id FROM transfer_tasks
               WHERE state = 'queued'
               ORDER BY created_at ASC, task_id ASC
               LIMIT 1
           )
           RETURNING task_id, spec"#,
    )
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let task_id: String = row.get("task_id");
    let spec: TaskSpec = serde_json::from_str(row.get::<String, _>("spec").as_str())?;
    Ok(Some((task_id, spec)))
}

fn launch(inner: &Arc<Inner>, task_id: TaskId, spec: TaskSpec) {
    debug!(task_id = %task_id, stage = %spec.stage, "Launching transfer task");

    // Hold the map while spawning so the task cannot remove its handle
    // before it has been inserted.
    let mut running = inner.running();
    let task_inner = Arc::clone(inner);
    let id = task_id.clone();
    let handle = tokio::spawn(async move {
        let outcome = perform(&task_inner.client, &spec).await;
        if let Err(e) = finish(&task_inner, &id, &spec, outcome).await {
            error!(task_id = %id, error = %e, "Failed to record transfer outcome");
        }
        task_inner.running().remove(&id);
    });
    running.insert(task_id, handle.abort_handle());
}

/// Stores the outcome and emits the event, unless the task was cleared
/// while it ran.
async fn finish(
    inner: &Inner,
    task_id: &str,
    spec: &TaskSpec,
    outcome: Result<String, String>,
) -> Result<(), RegistryError> {
    let (state, response, error) = match &outcome {
        Ok(body) => (TaskState::Succeeded, Some(body.as_str()), None),
        Err(message) => (TaskState::Failed, None, Some(message.as_str())),
    };

    let updated = sqlx::query(
        "UPDATE transfer_tasks SET state = ?1, response = ?2, error = ?3, updated_at = datetime('now') \
         WHERE task_id = ?4",
    )
    .bind(state.as_str())
    .bind(response)
    .bind(error)
    .bind(task_id)
    .execute(&inner.pool)
    .await?
    .rows_affected();

    if updated == 0 {
        debug!(task_id = %task_id, "Transfer task cleared while running; dropping outcome");
        return Ok(());
    }

    let artifact_id = spec.metadata.artifact_id.clone();
    let event = match outcome {
        Ok(raw_response) => TaskEvent::Completed {
            task_id: task_id.to_string(),
            stage: spec.stage,
            artifact_id,
            raw_response,
        },
        Err(error_message) => {
            warn!(task_id = %task_id, stage = %spec.stage, error = %error_message, "Transfer task failed");
            TaskEvent::Failed {
                task_id: task_id.to_string(),
                stage: spec.stage,
                artifact_id,
                error_message,
            }
        }
    };
    // The row keeps the outcome, so a closed receiver only delays delivery
    // until the next dispatcher start.
    let _ = inner.events_tx.send(event);
    Ok(())
}

/// Performs the HTTP request described by `spec`, returning the body of a
/// successful response or an error message.
async fn perform(client: &Client, spec: &TaskSpec) -> Result<String, String> {
    let mut request = client.post(&spec.endpoint_url);

    request = match &spec.file_path {
        Some(path) => {
            for (name, value) in &spec.headers {
                // multipart sets its own boundary content type
                if !name.eq_ignore_ascii_case("content-type") {
                    request = request.header(name.as_str(), value.as_str());
                }
            }
            request.multipart(build_form(path, &spec.body).await?)
        }
        None => {
            for (name, value) in &spec.headers {
                request = request.header(name.as_str(), value.as_str());
            }
            request.body(spec.body.clone())
        }
    };

    let response = request
        .send()
        .await
        .map_err(|e| format!("Request failed: {}", e))?;
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| format!("Failed to read response: {}", e))?;

    if !status.is_success() {
        return Err(format!("{}: {}", status, body));
    }
    Ok(body)
}

/// Builds a multipart form: the file as `file`, plus every field of the
/// JSON object in `fields`.
async fn build_form(path: &Path, fields: &str) -> Result<Form, String> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());

    let mut form = Form::new().part("file", Part::bytes(bytes).file_name(file_name));

    if !fields.trim().is_empty() {
        let fields: serde_json::Map<String, serde_json::Value> = serde_json::from_str(fields)
            .map_err(|e| format!("Invalid form fields: {}", e))?;
        for (name, value) in fields {
            let value = match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            form = form.text(name, value);
        }
    }
    Ok(form)
}

fn row_to_active(row: &SqliteRow) -> Option<ActiveTask> {
    let task_id: String = row.get("task_id");
    let stage = StageKind::from_str(row.get::<String, _>("stage").as_str()).ok();
    let status = TaskState::from_str(row.get::<String, _>("state").as_str()).ok();
    let (Some(stage), Some(status)) = (stage, status) else {
        warn!(task_id = %task_id, "Skipping unreadable transfer task row");
        return None;
    };
    Some(ActiveTask {
        task_id,
        stage,
        metadata: TaskMetadata {
            artifact_id: row.get("artifact_id"),
        },
        status,
    })
}

#[async_trait]
impl TaskRegistry for LocalTaskRegistry {
    async fn start(&self, spec: TaskSpec) -> Result<TaskId, RegistryError> {
        let task_id = Uuid::new_v4().to_string();
        let encoded = serde_json::to_string(&spec)?;

        sqlx::query(
            "INSERT INTO transfer_tasks (task_id, stage, artifact_id, spec, state) \
             VALUES (?1, ?2, ?3, ?4, 'queued')",
        )
        .bind(&task_id)
        .bind(spec.stage.as_str())
        .bind(&spec.metadata.artifact_id)
        .bind(&encoded)
        .execute(&self.inner.pool)
        .await?;

        self.inner.wake.notify_one();
        debug!(task_id = %task_id, stage = %spec.stage, "Transfer task queued");
        Ok(task_id)
    }

    async fn list_active(&self) -> Result<BTreeMap<TaskId, ActiveTask>, RegistryError> {
        let rows = sqlx::query("SELECT task_id, stage, artifact_id, state FROM transfer_tasks")
            .fetch_all(&self.inner.pool)
            .await?;

        Ok(rows
            .iter()
            .filter_map(row_to_active)
            .map(|task| (task.task_id.clone(), task))
            .collect())
    }

    async fn clear(&self, task_id: &str) -> Result<(), RegistryError> {
        sqlx::query("DELETE FROM transfer_tasks WHERE task_id = ?1")
            .bind(task_id)
            .execute(&self.inner.pool)
            .await?;
        Ok(())
    }

    async fn cancel(&self, task_id: &str) -> Result<(), RegistryError> {
        if let Some(handle) = self.inner.running().remove(task_id) {
            handle.abort();
        }
        self.clear(task_id).await
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TaskEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::connect;
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn open_registry(dir: &TempDir) -> LocalTaskRegistry {
        let db = dir.path().join("tasks.db");
        let pool = connect(db.to_str().unwrap()).await.unwrap();
        LocalTaskRegistry::open(pool)
            .await
            .unwrap()
            .with_poll_interval(Duration::from_millis(50))
    }

    fn json_spec(url: String, artifact_id: &str) -> TaskSpec {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        TaskSpec {
            file_path: None,
            endpoint_url: url,
            headers,
            body: r#"{"messages":[]}"#.to_string(),
            stage: StageKind::Summarize,
            metadata: TaskMetadata::for_artifact(artifact_id),
        }
    }

    #[tokio::test]
    async fn test_start_lists_queued_task() {
        let dir = TempDir::new().unwrap();
        let registry = open_registry(&dir).await;

        let task_id = registry
            .start(json_spec("http://127.0.0.1:9/none".to_string(), "a1"))
            .await
            .unwrap();

        let active = registry.list_active().await.unwrap();
        let task = &active[&task_id];
        assert_eq!(task.stage, StageKind::Summarize);
        assert_eq!(task.status, TaskState::Queued);
        assert_eq!(task.metadata.resolvable_artifact_id(), Some("a1"));

        registry.clear(&task_id).await.unwrap();
        assert!(registry.list_active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recover_interrupted_requeues_running_tasks() {
        let dir = TempDir::new().unwrap();
        let registry = open_registry(&dir).await;
        let task_id = registry
            .start(json_spec("http://127.0.0.1:9/none".to_string(), "a1"))
            .await
            .unwrap();
        sqlx::query("UPDATE transfer_tasks SET state = 'running'")
            .execute(&registry.inner.pool)
            .await
            .unwrap();
        let pool = registry.inner.pool.clone();
        drop(registry);

        let reopened = LocalTaskRegistry::open(pool).await.unwrap();
        let active = reopened.list_active().await.unwrap();
        assert_eq!(active[&task_id].status, TaskState::Running);

        assert_eq!(reopened.recover_interrupted().await.unwrap(), 1);
        let active = reopened.list_active().await.unwrap();
        assert_eq!(active[&task_id].status, TaskState::Queued);
    }

    #[tokio::test]
    async fn test_second_open_does_not_rerun_in_flight_task() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"ok":true}"#)
                    .set_delay(Duration::from_millis(800)),
            )
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let registry = open_registry(&dir).await;
        let mut events = registry.take_events().unwrap();
        let (shutdown_tx, _) = broadcast::channel(1);
        let dispatcher = registry.spawn_dispatcher(shutdown_tx.subscribe());

        let task_id = registry
            .start(json_spec(server.uri(), "a1"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // A short-lived command opening the same database mid-request.
        let other = open_registry(&dir).await;
        let active = other.list_active().await.unwrap();
        assert_eq!(active[&task_id].status, TaskState::Running);

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.task_id(), task_id);

        // Give the dispatcher a few poll cycles to pick up a re-queued row.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(server.received_requests().await.unwrap().len(), 1);

        let _ = shutdown_tx.send(());
        dispatcher.await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatcher_executes_and_emits_completion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/converse"))
            .and(header("content-type", "application/json"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"ok":true}"#))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let registry = open_registry(&dir).await;
        let mut events = registry.take_events().unwrap();
        let (shutdown_tx, _) = broadcast::channel(1);
        let dispatcher = registry.spawn_dispatcher(shutdown_tx.subscribe());

        let task_id = registry
            .start(json_spec(format!("{}/converse", server.uri()), "a1"))
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            TaskEvent::Completed {
                task_id: id,
                raw_response,
                artifact_id,
                ..
            } => {
                assert_eq!(id, task_id);
                assert_eq!(raw_response, r#"{"ok":true}"#);
                assert_eq!(artifact_id.as_deref(), Some("a1"));
            }
            other => panic!("Expected Completed, got {:?}", other),
        }

        let active = registry.list_active().await.unwrap();
        assert_eq!(active[&task_id].status, TaskState::Succeeded);

        let _ = shutdown_tx.send(());
        dispatcher.await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatcher_reports_http_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let registry = open_registry(&dir).await;
        let mut events = registry.take_events().unwrap();
        let (shutdown_tx, _) = broadcast::channel(1);
        let dispatcher = registry.spawn_dispatcher(shutdown_tx.subscribe());

        registry
            .start(json_spec(server.uri(), "a1"))
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            TaskEvent::Failed { error_message, .. } => {
                assert!(error_message.contains("503"));
                assert!(error_message.contains("overloaded"));
            }
            other => panic!("Expected Failed, got {:?}", other),
        }

        let _ = shutdown_tx.send(());
        dispatcher.await.unwrap();
    }

    #[tokio::test]
    async fn test_multipart_upload_sends_file() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/audio/transcriptions"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"text":"hello"}"#))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let audio = dir.path().join("lesson.m4a");
        std::fs::write(&audio, b"fake audio").unwrap();

        let registry = open_registry(&dir).await;
        let mut events = registry.take_events().unwrap();
        let (shutdown_tx, _) = broadcast::channel(1);
        let dispatcher = registry.spawn_dispatcher(shutdown_tx.subscribe());

        let spec = TaskSpec {
            file_path: Some(audio),
            endpoint_url: format!("{}/audio/transcriptions", server.uri()),
            headers: BTreeMap::new(),
            body: r#"{"model":"whisper-1"}"#.to_string(),
            stage: StageKind::Transcribe,
            metadata: TaskMetadata::for_artifact("a1"),
        };
        registry.start(spec).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, TaskEvent::Completed { .. }));

        let requests = server.received_requests().await.unwrap();
        let body = String::from_utf8_lossy(&requests[0].body);
        assert!(body.contains("fake audio"));
        assert!(body.contains("whisper-1"));

        let _ = shutdown_tx.send(());
        dispatcher.await.unwrap();
    }

    #[tokio::test]
    async fn test_uncleared_outcomes_are_redelivered() {
        let dir = TempDir::new().unwrap();
        let registry = open_registry(&dir).await;
        let task_id = registry
            .start(json_spec("http://127.0.0.1:9/none".to_string(), "a1"))
            .await
            .unwrap();
        sqlx::query("UPDATE transfer_tasks SET state = 'failed', error = 'gone' WHERE task_id = ?1")
            .bind(&task_id)
            .execute(&registry.inner.pool)
            .await
            .unwrap();

        let mut events = registry.take_events().unwrap();
        let (shutdown_tx, _) = broadcast::channel(1);
        let dispatcher = registry.spawn_dispatcher(shutdown_tx.subscribe());

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.task_id(), task_id);
        assert!(matches!(event, TaskEvent::Failed { ref error_message, .. } if error_message == "gone"));

        let _ = shutdown_tx.send(());
        dispatcher.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_removes_task() {
        let dir = TempDir::new().unwrap();
        let registry = open_registry(&dir).await;
        let task_id = registry
            .start(json_spec("http://127.0.0.1:9/none".to_string(), "a1"))
            .await
            .unwrap();

        registry.cancel(&task_id).await.unwrap();
        assert!(registry.list_active().await.unwrap().is_empty());
    }
}
