//! Process-local worker statistics.
//!
//! One [`WorkerStats`] exists per worker process. The worker loop applies
//! O(1) additive updates under the write half of a reader-writer lock; the
//! status endpoint takes cheap structural snapshots under the read half.

use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::task::Task;

#[derive(Debug)]
struct Inner {
    tasks_processed: u64,
    tasks_successful: u64,
    tasks_failed: u64,
    database_failures: u64,
    current_task: Option<Task>,
}

/// Shared-read, exclusive-write counters for a single worker process.
#[derive(Debug)]
pub struct WorkerStats {
    id: Uuid,
    start_time: DateTime<Utc>,
    inner: RwLock<Inner>,
}

/// Serialisable copy of the worker state at one instant.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub id: Uuid,
    pub start_time: DateTime<Utc>,
    /// Elapsed time since startup, truncated to whole seconds.
    pub uptime: String,
    pub tasks_processed: u64,
    pub tasks_successful: u64,
    pub tasks_failed: u64,
    pub database_failures: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task: Option<Task>,
}

impl WorkerStats {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            start_time: Utc::now(),
            inner: RwLock::new(Inner {
                tasks_processed: 0,
                tasks_successful: 0,
                tasks_failed: 0,
                database_failures: 0,
                current_task: None,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Record a claimed task as in-flight and count it as processed.
    pub fn task_started(&self, task: &Task) {
        let mut inner = self.write();
        inner.tasks_processed += 1;
        inner.current_task = Some(task.clone());
    }

    pub fn task_succeeded(&self) {
        self.write().tasks_successful += 1;
    }

    pub fn task_failed(&self) {
        self.write().tasks_failed += 1;
    }

    pub fn database_failure(&self) {
        self.write().database_failures += 1;
    }

    pub fn clear_current(&self) {
        self.write().current_task = None;
    }

    /// Structural copy of the current state, safe to serialise.
    pub fn snapshot(&self) -> StatusSnapshot {
        let inner = self.read();
        let uptime_secs = (Utc::now() - self.start_time).num_seconds().max(0) as u64;
        StatusSnapshot {
            id: self.id,
            start_time: self.start_time,
            uptime: humantime::format_duration(Duration::from_secs(uptime_secs)).to_string(),
            tasks_processed: inner.tasks_processed,
            tasks_successful: inner.tasks_successful,
            tasks_failed: inner.tasks_failed,
            database_failures: inner.database_failures,
            current_task: inner.current_task.clone(),
        }
    }

    // A poisoned lock only means another thread panicked mid-update; the
    // counters themselves are always valid, so recover the guard.
    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskStatus;

    fn sample_task() -> Task {
        Task {
            id: 7,
            name: "sample".to_owned(),
            description: None,
            started: Some(Utc::now()),
            finished: None,
            locked_at: Some(Utc::now()),
            last_error: None,
            priority: 0,
            status: TaskStatus::Running,
            payload: serde_json::json!({}),
            code: Uuid::new_v4(),
            worker_id: Some("w".to_owned()),
            output: None,
        }
    }

    #[test]
    fn counters_accumulate() {
        let stats = WorkerStats::new(Uuid::new_v4());
        stats.task_started(&sample_task());
        stats.task_succeeded();
        stats.task_started(&sample_task());
        stats.task_failed();
        stats.database_failure();

        let snap = stats.snapshot();
        assert_eq!(snap.tasks_processed, 2);
        assert_eq!(snap.tasks_successful, 1);
        assert_eq!(snap.tasks_failed, 1);
        assert_eq!(snap.database_failures, 1);
    }

    #[test]
    fn current_task_set_and_cleared() {
        let stats = WorkerStats::new(Uuid::new_v4());
        stats.task_started(&sample_task());
        assert_eq!(stats.snapshot().current_task.map(|t| t.id), Some(7));

        stats.clear_current();
        assert!(stats.snapshot().current_task.is_none());
    }

    #[test]
    fn snapshot_reports_whole_second_uptime() {
        let stats = WorkerStats::new(Uuid::new_v4());
        let snap = stats.snapshot();
        // Fresh stats: sub-second elapsed truncates to zero.
        assert_eq!(snap.uptime, "0s");
    }
}
