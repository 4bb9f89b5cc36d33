//! Postgres implementation of [`TaskStore`].
//!
//! The claim relies on two Postgres capabilities: `FOR UPDATE SKIP LOCKED`
//! (non-blocking, collision-free row handout under concurrent workers) and
//! `LISTEN`/`NOTIFY` on the `tasks_updated` channel (low-latency wake-ups
//! that collapse the fallback polling interval).
//!
//! Queries use the runtime-verified `sqlx::query` form so no `DATABASE_URL`
//! is needed at compile time. The schema itself is owned by the service that
//! seeds the table; this adapter only assumes the documented column contract.

use std::time::Duration;

use chrono::Utc;
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{PriorityBand, TaskStore};
use crate::task::{Task, TaskStatus};

/// Notification channel fired on every task insert or update.
pub const TASKS_CHANNEL: &str = "tasks_updated";

/// A `running` row locked longer than this is presumed orphaned.
const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(3600);

const CLAIM_SQL: &str = "\
    SELECT id, name, description, started, finished, locked_at, last_error, \
           priority, status, payload, code, worker_id, output \
    FROM tasks \
    WHERE status = 'pending' \
      AND locked_at IS NULL \
      AND ($1 = 0 OR priority >= $1) \
      AND ($2 = 0 OR priority <= $2) \
    ORDER BY priority ASC, id ASC \
    LIMIT 1 \
    FOR UPDATE SKIP LOCKED";

/// Postgres-backed task store.
#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
    stale_after: Duration,
}

impl PgStore {
    /// Connect to the task store at `url`.
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new().max_connections(8).connect(url).await?;
        Ok(Self {
            pool,
            stale_after: DEFAULT_STALE_AFTER,
        })
    }

    /// Override the stale-task threshold (default one hour).
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// The underlying connection pool, for read-only collaborators such as
    /// the aggregate status endpoint.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Subscribe to the task change channel.
    ///
    /// Every notification forwards one wake-up token into the returned
    /// channel. Tokens carry no data: duplicates and missed messages are
    /// expected, and consumers use them only to collapse their polling
    /// interval. The forwarding task ends on cancellation.
    pub async fn subscribe_changes(
        &self,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<()>, sqlx::Error> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(TASKS_CHANNEL).await?;
        info!(channel = TASKS_CHANNEL, "subscribed to task notifications");

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    received = listener.recv() => match received {
                        Ok(_) => {
                            // A full buffer already holds a pending wake-up;
                            // dropping extra tokens loses nothing.
                            if tx.try_send(()).is_err() && tx.is_closed() {
                                return;
                            }
                        }
                        Err(e) => {
                            // The listener reconnects on the next recv call.
                            warn!(error = %e, "task notification stream error");
                        }
                    },
                }
            }
        });
        Ok(rx)
    }
}

impl TaskStore for PgStore {
    async fn claim_one(
        &self,
        worker_id: &str,
        band: PriorityBand,
    ) -> Result<Option<Task>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let task: Option<Task> = sqlx::query_as(CLAIM_SQL)
            .bind(band.min)
            .bind(band.max)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(mut task) = task else {
            // Nothing eligible; dropping the transaction rolls it back.
            return Ok(None);
        };

        let now = Utc::now();
        sqlx::query(
            "UPDATE tasks SET locked_at = $1, worker_id = $2, started = $1, status = $3 \
             WHERE id = $4",
        )
        .bind(now)
        .bind(worker_id)
        .bind(TaskStatus::Running.as_str())
        .bind(task.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        task.locked_at = Some(now);
        task.started = Some(now);
        task.worker_id = Some(worker_id.to_owned());
        task.status = TaskStatus::Running;
        debug!(task_id = task.id, priority = task.priority, "claimed pending task");
        Ok(Some(task))
    }

    async fn resolve_code(&self, code_ref: Uuid) -> Result<String, sqlx::Error> {
        sqlx::query_scalar("SELECT code FROM codes WHERE id = $1")
            .bind(code_ref)
            .fetch_one(&self.pool)
            .await
    }

    async fn mark_malicious(&self, task_id: i32) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE tasks SET status = $1 WHERE id = $2")
            .bind(TaskStatus::Malicious.as_str())
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_completed(&self, task_id: i32, output: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE tasks SET status = $1, finished = NOW(), output = $2 WHERE id = $3",
        )
        .bind(TaskStatus::Completed.as_str())
        .bind(output)
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        task_id: i32,
        error: &str,
        output: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE tasks SET status = $1, finished = NOW(), last_error = $2, \
             output = COALESCE($3, output) WHERE id = $4",
        )
        .bind(TaskStatus::Failed.as_str())
        .bind(error)
        .bind(output)
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recover_stale(&self) -> Result<u64, sqlx::Error> {
        let secs = self.stale_after.as_secs() as f64;
        let result = sqlx::query(
            "UPDATE tasks \
             SET status = $1, finished = NOW(), last_error = $2 \
             WHERE status = $3 AND locked_at < NOW() - make_interval(secs => $4)",
        )
        .bind(TaskStatus::Failed.as_str())
        .bind(format!(
            "Timeout/Worker Crash ({}s lock limit exceeded)",
            self.stale_after.as_secs()
        ))
        .bind(TaskStatus::Running.as_str())
        .bind(secs)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
