//! Container sandbox management.
//!
//! Each worker process owns at most one persistent sandbox container. The
//! container is created lazily, hardened once (egress filtering, unprivileged
//! user), sanitised between tasks, and reaped after an idle period. The
//! cold-start cost of a container is thereby amortised across consecutive
//! tasks while each task still runs against a clean filesystem.

mod manager;
mod network;

pub use manager::SandboxManager;
pub use network::ensure_sandbox_network;

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Name of the dedicated bridge network sandbox containers attach to.
pub const SANDBOX_NETWORK: &str = "continuum_sandbox";

/// Tunables for the sandbox container.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Base image the container is created from.
    pub image: String,
    /// Memory cap in MiB.
    pub memory_mb: i64,
    /// CPU cap in fractional cores.
    pub cpu_limit: f64,
    /// How long an unused container may live before the reaper removes it.
    pub idle_timeout: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "python:3.9-slim".to_owned(),
            memory_mb: 512,
            cpu_limit: 0.5,
            idle_timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// Errors produced by the sandbox layer.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The container runtime rejected or failed an operation.
    #[error("container runtime error: {0}")]
    Runtime(#[from] bollard::errors::Error),

    /// Container bring-up (network, creation, or the hardening exec) failed.
    #[error("sandbox setup failed: {detail}")]
    Setup { detail: String },

    /// The script ran to completion but exited non-zero. Captured stdout is
    /// retained so callers can persist partial output alongside the failure.
    #[error("script exited with status {exit_code}: {stderr}")]
    ScriptFailed {
        exit_code: i64,
        stderr: String,
        stdout: String,
    },

    /// Building the in-memory archive streamed into the container failed.
    #[error("failed to build script archive: {0}")]
    Archive(#[from] std::io::Error),

    /// Cooperative shutdown observed mid-execution; no state was updated.
    #[error("execution cancelled")]
    Cancelled,
}

/// Executes a script with its payload inside an isolated environment.
///
/// The seam between the worker loop and the container runtime; tests
/// substitute fault-injecting fakes here.
pub trait ScriptSandbox: Send + Sync + 'static {
    /// Run `script` against `payload`, returning captured stdout on success.
    ///
    /// Must observe `cancel` at every suspension point and return
    /// [`SandboxError::Cancelled`] promptly once shutdown begins.
    fn execute(
        &self,
        script: &str,
        payload: &str,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<String, SandboxError>> + Send;
}
