//! Core pipeline of the Continuum worker.
//!
//! The worker claims queued tasks from a relational task table and executes
//! each task's script inside an isolated, resource-limited container, then
//! durably records the result. This crate holds the moving parts:
//!
//! - [`store`]: typed facade over the task table; the atomic skip-locked
//!   claim, terminal transitions, stale-task recovery, change notifications.
//! - [`screener`]: static pre-execution screening of script text.
//! - [`sandbox`]: the per-worker persistent container; hardening, per-task
//!   sanitisation, execution, idle reaping.
//! - [`worker`]: the claim/screen/execute/finalise loop with
//!   cancellation-aware retries.
//! - [`stats`]: process-local counters surfaced by the status endpoint.
//!
//! The binary crate wires these together and adds configuration, signal
//! handling, and the HTTP status surface.

pub mod sandbox;
pub mod screener;
pub mod stats;
pub mod store;
pub mod task;
pub mod worker;

pub use sandbox::{
    ensure_sandbox_network, SandboxConfig, SandboxError, SandboxManager, ScriptSandbox,
};
pub use screener::{CodeScreener, PatternScreener};
pub use stats::{StatusSnapshot, WorkerStats};
pub use store::{PgStore, PriorityBand, TaskStore};
pub use task::{Task, TaskStatus};
pub use worker::Worker;
