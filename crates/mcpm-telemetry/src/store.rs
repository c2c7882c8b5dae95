use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use mcpm_core::Event;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::TelemetryError;
use crate::queue::EventQueue;
use crate::schema;

const DEFAULT_QUEUE_CAPACITY: usize = 4096;
const SHUTDOWN_DRAIN_DEADLINE: Duration = Duration::from_secs(2);

/// The telemetry store. A single writer task owns the SQLite
/// connection; every other caller only ever touches the in-memory
/// [`EventQueue`], so `record` is synchronous and never blocks on I/O.
pub struct TelemetryStore {
    pool: SqlitePool,
    queue: Arc<EventQueue>,
    writer: Option<JoinHandle<()>>,
}

impl TelemetryStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, TelemetryError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| TelemetryError::Open {
                path: path.display().to_string(),
                source: sqlx::Error::Io(e),
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(30))
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|source| TelemetryError::Open {
                path: path.display().to_string(),
                source,
            })?;

        schema::migrate(&pool).await?;

        let queue = Arc::new(EventQueue::new(DEFAULT_QUEUE_CAPACITY));
        let writer = spawn_writer(pool.clone(), queue.clone());

        Ok(Self {
            pool,
            queue,
            writer: Some(writer),
        })
    }

    /// Enqueue an event. Never blocks — request handling must not stall
    /// on telemetry.
    pub fn record(&self, event: Event) {
        self.queue.push(event);
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Flushes whatever is queued, with a 2-second deadline, then stops the
    /// writer task. Called during graceful shutdown.
    pub async fn shutdown(mut self) {
        let remaining = self.queue.drain_now();
        if !remaining.is_empty() {
            let _ = tokio::time::timeout(SHUTDOWN_DRAIN_DEADLINE, write_batch(&self.pool, remaining))
                .await;
        }
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }

    #[cfg(test)]
    pub(crate) fn queue_len(&self) -> usize {
        self.queue.len()
    }
}

fn spawn_writer(pool: SqlitePool, queue: Arc<EventQueue>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let batch = queue.drain_wait().await;
            if let Err(err) = write_batch(&pool, batch).await {
                error!(error = %err, "telemetry writer failed to persist batch");
            }
        }
    })
}

async fn write_batch(pool: &SqlitePool, batch: Vec<Event>) -> Result<(), TelemetryError> {
    if batch.is_empty() {
        return Ok(());
    }
    let mut tx = pool.begin().await.map_err(TelemetryError::Query)?;
    for event in &batch {
        sqlx::query(
            r#"
            INSERT INTO events (
                session_id, event_type, server_name, resource_id, timestamp_ms,
                duration_ms, success, error_message, metadata
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.session_id)
        .bind(event.event_type.as_str())
        .bind(&event.server_name)
        .bind(&event.resource_id)
        .bind(event.timestamp.timestamp_millis())
        .bind(event.duration_ms)
        .bind(event.success)
        .bind(&event.error_message)
        .bind(event.metadata.to_string())
        .execute(&mut *tx)
        .await
        .map_err(TelemetryError::Query)?;
    }
    tx.commit().await.map_err(TelemetryError::Query)?;
    debug!(count = batch.len(), "telemetry writer flushed batch");
    Ok(())
}
