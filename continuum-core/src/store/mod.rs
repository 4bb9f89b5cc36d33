//! Task store abstraction.
//!
//! [`TaskStore`] is the worker-facing interface over the task table. The
//! production implementation is [`postgres::PgStore`]; tests substitute
//! in-memory fakes at this seam.
//!
//! All trait methods use `impl Future` in their signatures (stable since Rust
//! 1.75) so no extra `async-trait` crate is required. Store failures surface
//! as [`sqlx::Error`]; callers log them, count them, and move on, since a
//! lost in-flight task is reclaimed later by the stale-recovery pass.

pub mod postgres;

pub use postgres::PgStore;

use std::future::Future;

use uuid::Uuid;

use crate::task::Task;

/// Inclusive priority range a worker claims tasks from.
///
/// A zero bound is a sentinel meaning "unbounded on that side", not a filter
/// for priority zero: the default band `(0, 0)` admits every priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PriorityBand {
    pub min: i32,
    pub max: i32,
}

impl PriorityBand {
    pub fn new(min: i32, max: i32) -> Self {
        Self { min, max }
    }

    /// Whether a task of the given priority falls inside this band.
    ///
    /// Mirrors the SQL predicate used by the claim query; the two must agree.
    pub fn admits(&self, priority: i32) -> bool {
        (self.min == 0 || priority >= self.min) && (self.max == 0 || priority <= self.max)
    }
}

/// Worker-facing operations on the task table.
pub trait TaskStore: Send + Sync + 'static {
    /// Atomically claim at most one pending task within the priority band.
    ///
    /// The claim must be collision-free across workers: a row observed here is
    /// owned by this worker until a terminal transition or stale recovery.
    /// Returns the claimed row with the `running` transition already applied.
    fn claim_one(
        &self,
        worker_id: &str,
        band: PriorityBand,
    ) -> impl Future<Output = Result<Option<Task>, sqlx::Error>> + Send;

    /// Fetch the script text behind a code reference.
    fn resolve_code(
        &self,
        code_ref: Uuid,
    ) -> impl Future<Output = Result<String, sqlx::Error>> + Send;

    /// Terminal transition for a script refused by the screener.
    fn mark_malicious(&self, task_id: i32)
        -> impl Future<Output = Result<(), sqlx::Error>> + Send;

    /// Terminal success: records captured stdout and the finish time.
    fn mark_completed(
        &self,
        task_id: i32,
        output: &str,
    ) -> impl Future<Output = Result<(), sqlx::Error>> + Send;

    /// Terminal failure: records the error, the finish time, and (when the
    /// failed run still produced stdout) that output as well.
    fn mark_failed(
        &self,
        task_id: i32,
        error: &str,
        output: Option<&str>,
    ) -> impl Future<Output = Result<(), sqlx::Error>> + Send;

    /// Fail every `running` row whose lock is older than the stale threshold.
    /// Returns the number of rows recovered.
    fn recover_stale(&self) -> impl Future<Output = Result<u64, sqlx::Error>> + Send;
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_band_admits_everything() {
        let band = PriorityBand::default();
        for priority in [-5, 0, 1, 5, 1000] {
            assert!(band.admits(priority), "priority {priority} should be admitted");
        }
    }

    #[test]
    fn degenerate_band_admits_exactly_one_priority() {
        let band = PriorityBand::new(5, 5);
        assert!(band.admits(5));
        assert!(!band.admits(4));
        assert!(!band.admits(6));
    }

    #[test]
    fn half_open_bands() {
        let min_only = PriorityBand::new(3, 0);
        assert!(!min_only.admits(2));
        assert!(min_only.admits(3));
        assert!(min_only.admits(1000));

        let max_only = PriorityBand::new(0, 3);
        assert!(max_only.admits(1));
        assert!(max_only.admits(3));
        assert!(!max_only.admits(4));
    }
}
