//! Task-table row model.
//!
//! A [`Task`] mirrors one row of the `tasks` relation. The worker never
//! inserts tasks; it claims `pending` rows, drives them to a terminal
//! status, and records output / errors along the way.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle states of a task row.
///
/// Stored as a lowercase string in the `status` column. Only the first five
/// variants are ever produced by the worker; the remaining three are legacy
/// values that may still appear in old rows and are parsed but never written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Malicious,
    // Reserved legacy values.
    NotStarted,
    Done,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Malicious => "malicious",
            TaskStatus::NotStarted => "not_started",
            TaskStatus::Done => "done",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// A terminal status is never left again; `finished` is only ever set
    /// alongside one of these.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Malicious
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `status` column held a value outside the known set.
#[derive(Debug, Error)]
#[error("unknown task status: {0}")]
pub struct UnknownStatus(String);

impl std::str::FromStr for TaskStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "malicious" => Ok(TaskStatus::Malicious),
            "not_started" => Ok(TaskStatus::NotStarted),
            "done" => Ok(TaskStatus::Done),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(UnknownStatus(other.to_owned())),
        }
    }
}

impl TryFrom<String> for TaskStatus {
    type Error = UnknownStatus;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// One row of the `tasks` relation.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Task {
    pub id: i32,
    pub name: String,
    pub description: Option<String>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub locked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub priority: i32,
    #[sqlx(try_from = "String")]
    pub status: TaskStatus,
    /// Opaque run instructions, handed to the script verbatim.
    pub payload: serde_json::Value,
    /// Reference into the `codes` relation; the script text itself is
    /// resolved separately and never stored on the task.
    pub code: Uuid,
    pub worker_id: Option<String>,
    pub output: Option<String>,
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Malicious,
            TaskStatus::NotStarted,
            TaskStatus::Done,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().ok(), Some(status));
        }
    }

    #[test]
    fn unknown_status_is_rejected() {
        assert!("exploded".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Malicious.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }
}
