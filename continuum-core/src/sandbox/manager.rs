//! Lifecycle of the per-worker sandbox container.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bollard::container::{Config, LogOutput, RemoveContainerOptions, UploadToContainerOptions};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::HostConfig;
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{SandboxConfig, SandboxError, ScriptSandbox, SANDBOX_NETWORK};

/// Cadence of the idle-reaper background task.
const REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Grace given to a container removal before giving up on it.
const REMOVAL_GRACE: Duration = Duration::from_secs(30);

/// Cap on the stderr excerpt carried in errors.
const STDERR_EXCERPT_LEN: usize = 2048;

/// One-time hardening, run as root right after the container starts.
/// Every iptables rule is applied individually so a single failure does not
/// abort the rest; the final user creation decides the exit status.
const SETUP_SCRIPT: &str = "\
apt-get update -qq && apt-get install -qq -y iptables >/dev/null 2>&1
iptables -A OUTPUT -d 10.0.0.0/8 -j DROP 2>/dev/null || true
iptables -A OUTPUT -d 172.16.0.0/12 -j DROP 2>/dev/null || true
iptables -A OUTPUT -d 192.168.0.0/16 -j DROP 2>/dev/null || true
iptables -A OUTPUT -d 169.254.0.0/16 -j DROP 2>/dev/null || true
useradd -m -s /bin/bash sandboxuser 2>/dev/null || true
";

/// Per-task filesystem reset: previous task files and every writable scratch
/// location a script could have touched.
const SANITIZE_SCRIPT: &str = "\
rm -f /script.py /payload.json
find /tmp -mindepth 1 -delete 2>/dev/null || true
find /var/tmp -mindepth 1 -delete 2>/dev/null || true
find /home/sandboxuser -mindepth 1 -delete 2>/dev/null || true
";

/// Hand the injected files to the sandbox user, then run the script as them.
const RUN_SCRIPT: &str = "\
chown sandboxuser:sandboxuser /script.py /payload.json
su sandboxuser -c \"python /script.py /payload.json\"
";

#[derive(Debug)]
struct ActiveContainer {
    id: String,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
    last_used_at: Instant,
}

struct ExecOutput {
    exit_code: i64,
    stdout: String,
    stderr: String,
}

/// Owns the single persistent sandbox container of one worker process.
///
/// All container-state mutation happens under one mutex, so at most one
/// `execute` is in flight per worker; the idle reaper and `dispose` contend
/// on the same lock. Horizontal scaling is achieved by running more worker
/// processes, never by pooling containers inside one.
#[derive(Debug)]
pub struct SandboxManager {
    docker: Docker,
    config: SandboxConfig,
    active: Mutex<Option<ActiveContainer>>,
}

impl SandboxManager {
    pub fn new(docker: Docker, config: SandboxConfig) -> Self {
        Self {
            docker,
            config,
            active: Mutex::new(None),
        }
    }

    /// Spawn the idle reaper owned by this manager.
    ///
    /// Runs once a minute; a container unused for longer than the configured
    /// idle timeout is force-removed so an idle worker holds no resources.
    /// The task ends when `cancel` fires.
    pub fn spawn_reaper(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REAP_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => self.reap_if_idle().await,
                }
            }
        })
    }

    async fn reap_if_idle(&self) {
        let mut guard = self.active.lock().await;
        let expired = guard
            .as_ref()
            .is_some_and(|active| active.last_used_at.elapsed() > self.config.idle_timeout);
        if !expired {
            return;
        }
        if let Some(active) = guard.take() {
            info!(container = %short_id(&active.id), "idle timeout reached; removing sandbox container");
            self.force_remove(&active.id).await;
        }
    }

    /// Remove any live container unconditionally. Called on worker shutdown.
    pub async fn dispose(&self) {
        let mut guard = self.active.lock().await;
        if let Some(active) = guard.take() {
            info!(container = %short_id(&active.id), "removing sandbox container");
            self.force_remove(&active.id).await;
        }
    }

    async fn force_remove(&self, container_id: &str) {
        let removal = self.docker.remove_container(
            container_id,
            Some(RemoveContainerOptions {
                force: true,
                ..Default::default()
            }),
        );
        match tokio::time::timeout(REMOVAL_GRACE, removal).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(container = %short_id(container_id), error = %e, "failed to remove sandbox container")
            }
            Err(_) => {
                warn!(container = %short_id(container_id), "timed out removing sandbox container")
            }
        }
    }

    /// Return the id of a running, sanitised container, creating one if the
    /// previous container is gone or was never brought up.
    async fn ensure_ready(
        &self,
        guard: &mut Option<ActiveContainer>,
        cancel: &CancellationToken,
    ) -> Result<String, SandboxError> {
        let existing = guard.as_ref().map(|active| active.id.clone());
        if let Some(id) = existing {
            if self.is_running(&id, cancel).await? {
                self.sanitize(&id, cancel).await?;
                return Ok(id);
            }
            warn!(container = %short_id(&id), "sandbox container no longer running; recreating");
            *guard = None;
        }

        let active = self.bring_up(cancel).await?;
        let id = active.id.clone();
        *guard = Some(active);
        Ok(id)
    }

    async fn is_running(
        &self,
        container_id: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, SandboxError> {
        match with_cancel(cancel, self.docker.inspect_container(container_id, None)).await {
            Ok(inspect) => Ok(inspect
                .state
                .and_then(|state| state.running)
                .unwrap_or(false)),
            Err(SandboxError::Cancelled) => Err(SandboxError::Cancelled),
            // A container that cannot be inspected is unusable either way.
            Err(_) => Ok(false),
        }
    }

    /// Create, start, and harden a fresh sandbox container.
    async fn bring_up(&self, cancel: &CancellationToken) -> Result<ActiveContainer, SandboxError> {
        let host_config = HostConfig {
            memory: Some(self.config.memory_mb * 1024 * 1024),
            nano_cpus: Some((self.config.cpu_limit * 1e9) as i64),
            cap_add: Some(vec!["NET_ADMIN".to_owned()]),
            // Well-known host gateway names resolve to loopback inside the
            // container, turning them into dead ends.
            extra_hosts: Some(vec![
                "host.docker.internal:127.0.0.1".to_owned(),
                "gateway.docker.internal:127.0.0.1".to_owned(),
            ]),
            network_mode: Some(SANDBOX_NETWORK.to_owned()),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(self.config.image.clone()),
            // Long-lived idle command; work arrives via exec.
            cmd: Some(vec!["sleep".to_owned(), "infinity".to_owned()]),
            tty: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = with_cancel(
            cancel,
            self.docker
                .create_container::<String, String>(None, container_config),
        )
        .await?;
        let id = created.id;

        if let Err(e) =
            with_cancel(cancel, self.docker.start_container::<String>(&id, None)).await
        {
            self.force_remove(&id).await;
            return Err(e);
        }

        let setup = match self.run_exec(&id, Some("root"), SETUP_SCRIPT, cancel).await {
            Ok(output) => output,
            Err(e) => {
                self.force_remove(&id).await;
                return Err(e);
            }
        };
        if setup.exit_code != 0 {
            self.force_remove(&id).await;
            return Err(SandboxError::Setup {
                detail: format!(
                    "hardening exec exited {}: {}",
                    setup.exit_code,
                    excerpt(&setup.stderr)
                ),
            });
        }

        info!(container = %short_id(&id), image = %self.config.image, "sandbox container ready");
        Ok(ActiveContainer {
            id,
            created_at: Utc::now(),
            last_used_at: Instant::now(),
        })
    }

    /// Reset the container filesystem between tasks. Individual deletion
    /// failures inside the script are tolerated; only a failure to run the
    /// exec at all is surfaced.
    async fn sanitize(&self, container_id: &str, cancel: &CancellationToken) -> Result<(), SandboxError> {
        debug!(container = %short_id(container_id), "sanitising sandbox container");
        self.run_exec(container_id, Some("root"), SANITIZE_SCRIPT, cancel)
            .await?;
        Ok(())
    }

    /// Run a shell script inside the container, draining demuxed stdout and
    /// stderr, and report its exit code.
    async fn run_exec(
        &self,
        container_id: &str,
        user: Option<&str>,
        script: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecOutput, SandboxError> {
        let exec = with_cancel(
            cancel,
            self.docker.create_exec(
                container_id,
                CreateExecOptions {
                    user: user.map(str::to_owned),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(vec!["sh".to_owned(), "-c".to_owned(), script.to_owned()]),
                    ..Default::default()
                },
            ),
        )
        .await?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        if let StartExecResults::Attached { mut output, .. } =
            with_cancel(cancel, self.docker.start_exec(&exec.id, None)).await?
        {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(SandboxError::Cancelled),
                    chunk = output.next() => match chunk {
                        Some(Ok(LogOutput::StdOut { message })) => {
                            stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        Some(Ok(LogOutput::StdErr { message })) => {
                            stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => break,
                    },
                }
            }
        }

        let inspect = with_cancel(cancel, self.docker.inspect_exec(&exec.id)).await?;
        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(0),
            stdout,
            stderr,
        })
    }
}

impl ScriptSandbox for SandboxManager {
    async fn execute(
        &self,
        script: &str,
        payload: &str,
        cancel: &CancellationToken,
    ) -> Result<String, SandboxError> {
        let mut guard = self.active.lock().await;
        if cancel.is_cancelled() {
            return Err(SandboxError::Cancelled);
        }

        let container_id = self.ensure_ready(&mut guard, cancel).await?;

        let archive = build_archive(script, payload)?;
        with_cancel(
            cancel,
            self.docker.upload_to_container(
                &container_id,
                Some(UploadToContainerOptions {
                    path: "/",
                    ..Default::default()
                }),
                archive.into(),
            ),
        )
        .await?;

        let run = self
            .run_exec(&container_id, Some("root"), RUN_SCRIPT, cancel)
            .await?;

        if let Some(active) = guard.as_mut() {
            active.last_used_at = Instant::now();
        }

        if run.exit_code != 0 {
            return Err(SandboxError::ScriptFailed {
                exit_code: run.exit_code,
                stderr: excerpt(&run.stderr),
                stdout: run.stdout,
            });
        }
        Ok(run.stdout)
    }
}

/// Race a runtime call against cancellation so shutdown is never held up by
/// a slow daemon response. Cleanup ([`SandboxManager::force_remove`]) is the
/// deliberate exception: it must run to completion even during shutdown and
/// is bounded by [`REMOVAL_GRACE`] instead.
async fn with_cancel<T>(
    cancel: &CancellationToken,
    call: impl std::future::Future<Output = Result<T, bollard::errors::Error>>,
) -> Result<T, SandboxError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(SandboxError::Cancelled),
        result = call => Ok(result?),
    }
}

/// In-memory tar holding the script (0755) and its payload (0644), streamed
/// into the container at `/`.
fn build_archive(script: &str, payload: &str) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());

    let mut header = tar::Header::new_gnu();
    header.set_size(script.len() as u64);
    header.set_mode(0o755);
    header.set_cksum();
    builder.append_data(&mut header, "script.py", script.as_bytes())?;

    let mut header = tar::Header::new_gnu();
    header.set_size(payload.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, "payload.json", payload.as_bytes())?;

    builder.into_inner()
}

fn excerpt(text: &str) -> String {
    let trimmed = text.trim_end();
    if trimmed.len() <= STDERR_EXCERPT_LEN {
        return trimmed.to_owned();
    }
    let mut cut = STDERR_EXCERPT_LEN;
    while !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &trimmed[..cut])
}

fn short_id(container_id: &str) -> &str {
    &container_id[..container_id.len().min(12)]
}

// ── Tests ──────────────────────────────────────────────────────────────────────
