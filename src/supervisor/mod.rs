//! Process supervision inside sandboxes.
//!
//! Each sandbox has at most one active process. Lifecycle operations on the
//! same sandbox (`start`, `restart`, `stop`) are serialised by a per-sandbox
//! async lock, and terminating a process waits until its pump task has
//! written the final log trailer.

mod monitor;
mod process;

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::process::Command;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use crate::broadcast::Broadcaster;
use crate::config::{RetentionConfig, SupervisorConfig};
use crate::engine::ContainerEngine;
use crate::error::{ManagerError, Result};
use crate::logstore::LogStore;
use crate::tenant::{validate_sandbox_id, SandboxStatus, TenantRegistry};

use monitor::{pid_file_for, Pump, PID_DIR, WRAPPER_SCRIPT};
use process::{ExitOutcome, ManagedProcess, ProcessHandle};

pub use monitor::spawn_retention_sweeper;
pub use process::{
    LaunchRequest, ProcessInfo, ProcessKind, ProcessLogs, ProcessStatus, SandboxPhase,
};

/// Everything `launch` needs to register and spawn one process.
struct Launch {
    process_id: String,
    kind: ProcessKind,
    label: String,
    command: Command,
    /// Written to the log before any output
    header: Option<String>,
    pid_file: Option<String>,
}

#[derive(Default)]
struct ProcessTable {
    processes: HashMap<String, ManagedProcess>,
    /// sandbox id -> id of its active process
    active: HashMap<String, String>,
    phases: HashMap<String, SandboxPhase>,
}

struct Inner {
    engine: Arc<dyn ContainerEngine>,
    registry: Arc<TenantRegistry>,
    logs: Arc<LogStore>,
    broadcaster: Arc<Broadcaster>,
    config: SupervisorConfig,
    table: Mutex<ProcessTable>,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl Inner {
    fn table(&self) -> MutexGuard<'_, ProcessTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn grace(&self) -> Duration {
        Duration::from_secs(self.config.grace_period_secs)
    }

    /// Record a process exit and release the sandbox's active slot.
    fn finish(&self, process_id: &str, sandbox_id: &str, outcome: ExitOutcome) {
        let mut table = self.table();
        if let Some(process) = table.processes.get_mut(process_id) {
            process.info.status = outcome.status();
            process.info.exit_code = outcome.exit_code();
            process.info.ended_at = Some(Utc::now());
            process.handle = None;
        }

        if table.active.get(sandbox_id).map(String::as_str) == Some(process_id) {
            table.active.remove(sandbox_id);
            // A replacement may already be on its way in.
            if table.phases.get(sandbox_id) != Some(&SandboxPhase::Starting) {
                let phase = match outcome.status() {
                    ProcessStatus::Completed => SandboxPhase::Completed,
                    _ => SandboxPhase::Errored,
                };
                table.phases.insert(sandbox_id.to_string(), phase);
            }
        }
    }
}

/// Supervises processes running inside sandbox containers.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl ProcessSupervisor {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        registry: Arc<TenantRegistry>,
        logs: Arc<LogStore>,
        broadcaster: Arc<Broadcaster>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                registry,
                logs,
                broadcaster,
                config,
                table: Mutex::new(ProcessTable::default()),
                locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    fn sandbox_lock(&self, sandbox_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.inner.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(sandbox_id.to_string()).or_default().clone()
    }

    /// Run the dependency install step followed by the application command.
    pub async fn install_and_start(
        &self,
        sandbox_id: &str,
        request: &LaunchRequest,
    ) -> Result<String> {
        let (script, cwd) = request.resolve(&self.inner.config);
        self.start(sandbox_id, &script, &cwd).await
    }

    /// Start `command` in the sandbox, replacing any active process.
    ///
    /// Returns as soon as the process is spawned. A spawn failure is recorded
    /// in the new process's log and status instead of failing the call.
    pub async fn start(&self, sandbox_id: &str, command: &str, workdir: &str) -> Result<String> {
        self.ensure_known(sandbox_id).await?;

        let lock = self.sandbox_lock(sandbox_id);
        let _guard = lock.lock().await;

        self.set_phase(sandbox_id, SandboxPhase::Starting);
        let result = self.start_locked(sandbox_id, command, workdir).await;
        if result.is_err() {
            self.settle_phase(sandbox_id);
        }
        result
    }

    async fn start_locked(&self, sandbox_id: &str, command: &str, workdir: &str) -> Result<String> {
        self.ensure_running(sandbox_id).await?;

        if let Some(previous) = self.terminate_active(sandbox_id).await {
            info!(sandbox_id = %sandbox_id, process_id = %previous, "Replaced active process");
        }

        let mkdir = self
            .inner
            .engine
            .exec(sandbox_id, &["mkdir", "-p", workdir, PID_DIR])
            .await?;
        if mkdir.exit_code != 0 {
            return Err(ManagerError::ExternalCommand {
                command: format!("mkdir -p {} {}", workdir, PID_DIR),
                stderr: mkdir.stderr,
            });
        }

        let process_id = self.allocate_id(&format!("{}-", sandbox_id));
        let pid_file = pid_file_for(&process_id);
        let argv = vec![
            "sh".to_string(),
            "-c".to_string(),
            WRAPPER_SCRIPT.to_string(),
            pid_file.clone(),
            command.to_string(),
        ];
        let cmd = self.inner.engine.exec_command(sandbox_id, workdir, &argv);
        self.launch(
            sandbox_id,
            Launch {
                process_id,
                kind: ProcessKind::Command,
                label: command.to_string(),
                command: cmd,
                header: None,
                pid_file: Some(pid_file),
            },
        )
        .await
    }

    /// Restart the container and attach a follower of its own log stream.
    pub async fn restart(&self, sandbox_id: &str) -> Result<String> {
        self.ensure_known(sandbox_id).await?;

        let lock = self.sandbox_lock(sandbox_id);
        let _guard = lock.lock().await;

        self.set_phase(sandbox_id, SandboxPhase::Starting);
        let result = self.restart_locked(sandbox_id).await;
        if result.is_err() {
            self.settle_phase(sandbox_id);
        }
        result
    }

    async fn restart_locked(&self, sandbox_id: &str) -> Result<String> {
        self.terminate_active(sandbox_id).await;

        self.inner.engine.restart_container(sandbox_id).await?;
        self.inner
            .registry
            .set_sandbox_status(sandbox_id, SandboxStatus::Running)
            .await;

        let header = format!(
            "[{}] Container {} restarted\n",
            Utc::now().to_rfc3339(),
            sandbox_id
        );
        self.inner
            .broadcaster
            .system(sandbox_id, &format!("Container {} restarted", sandbox_id));

        let cmd = self.inner.engine.follow_logs_command(sandbox_id);
        self.launch(
            sandbox_id,
            Launch {
                process_id: self.allocate_id(&format!("{}-restart-", sandbox_id)),
                kind: ProcessKind::Follow,
                label: "container logs".to_string(),
                command: cmd,
                header: Some(header),
                pid_file: None,
            },
        )
        .await
    }

    /// Terminate the sandbox's active process.
    pub async fn stop(&self, sandbox_id: &str) -> Result<String> {
        let lock = self.sandbox_lock(sandbox_id);
        let _guard = lock.lock().await;

        let process_id = self
            .terminate_active(sandbox_id)
            .await
            .ok_or_else(|| ManagerError::not_found("Running process for sandbox", sandbox_id))?;

        self.inner
            .broadcaster
            .system(sandbox_id, "Application stopped");
        info!(sandbox_id = %sandbox_id, process_id = %process_id, "Application stopped");
        Ok(process_id)
    }

    /// Terminate whatever runs in the given sandboxes, e.g. before their pod is removed.
    pub async fn terminate_sandboxes(&self, sandbox_ids: &[String]) -> usize {
        let mut terminated = 0;
        for sandbox_id in sandbox_ids {
            let lock = self.sandbox_lock(sandbox_id);
            let _guard = lock.lock().await;
            if self.terminate_active(sandbox_id).await.is_some() {
                terminated += 1;
            }
        }
        terminated
    }

    pub async fn read_logs(&self, process_id: &str, offset: u64) -> Result<ProcessLogs> {
        // Status first: once it reads finished, the log already holds every byte.
        let status = self
            .inner
            .table()
            .processes
            .get(process_id)
            .map(|p| p.info.status)
            .ok_or_else(|| ManagerError::not_found("Process", process_id))?;

        let chunk = self.inner.logs.read(process_id, offset).await?;
        Ok(ProcessLogs {
            logs: chunk.logs,
            next_offset: chunk.next_offset,
            status,
        })
    }

    pub fn list_processes(&self) -> Vec<ProcessInfo> {
        let mut processes: Vec<ProcessInfo> = self
            .inner
            .table()
            .processes
            .values()
            .map(|p| p.info.clone())
            .collect();
        processes.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.process_id.cmp(&b.process_id))
        });
        processes
    }

    pub fn get_process(&self, process_id: &str) -> Option<ProcessInfo> {
        self.inner
            .table()
            .processes
            .get(process_id)
            .map(|p| p.info.clone())
    }

    pub fn active_process(&self, sandbox_id: &str) -> Option<String> {
        self.inner.table().active.get(sandbox_id).cloned()
    }

    pub fn phase(&self, sandbox_id: &str) -> SandboxPhase {
        self.inner
            .table()
            .phases
            .get(sandbox_id)
            .copied()
            .unwrap_or_default()
    }

    /// Evict finished processes beyond `max_finished` or older than `max_age_secs`,
    /// deleting their log files. Running processes are never evicted.
    pub async fn prune(&self, retention: &RetentionConfig) -> usize {
        let max_age = i64::try_from(retention.max_age_secs).unwrap_or(i64::MAX);
        let now = Utc::now();

        let evicted: Vec<String> = {
            let mut table = self.inner.table();
            let mut finished: Vec<_> = table
                .processes
                .values()
                .filter(|p| p.info.status.is_finished() && p.handle.is_none())
                .filter_map(|p| p.info.ended_at.map(|t| (t, p.info.process_id.clone())))
                .collect();
            // Newest first
            finished.sort_by(|a, b| b.0.cmp(&a.0));

            let evicted: Vec<String> = finished
                .into_iter()
                .enumerate()
                .filter(|(rank, (ended_at, _))| {
                    *rank >= retention.max_finished || (now - *ended_at).num_seconds() > max_age
                })
                .map(|(_, (_, process_id))| process_id)
                .collect();
            for process_id in &evicted {
                table.processes.remove(process_id);
            }
            evicted
        };

        for process_id in &evicted {
            if let Err(e) = self.inner.logs.remove(process_id).await {
                warn!(process_id = %process_id, error = %e, "Failed to delete process log");
            }
        }
        if !evicted.is_empty() {
            info!(count = evicted.len(), "Evicted finished processes");
        }
        evicted.len()
    }

    async fn ensure_known(&self, sandbox_id: &str) -> Result<()> {
        validate_sandbox_id(sandbox_id)?;
        if self.inner.registry.find_sandbox(sandbox_id).await.is_some() {
            return Ok(());
        }
        if self.inner.engine.container_exists(sandbox_id).await? {
            return Ok(());
        }
        Err(ManagerError::not_found("Sandbox", sandbox_id))
    }

    async fn ensure_running(&self, sandbox_id: &str) -> Result<()> {
        let state = self.inner.engine.container_state(sandbox_id).await?;
        if !state.is_running() {
            info!(sandbox_id = %sandbox_id, state = ?state, "Container not running, starting it");
            self.inner.engine.start_container(sandbox_id).await?;
        }
        self.inner
            .registry
            .set_sandbox_status(sandbox_id, SandboxStatus::Running)
            .await;
        Ok(())
    }

    fn set_phase(&self, sandbox_id: &str, phase: SandboxPhase) {
        self.inner
            .table()
            .phases
            .insert(sandbox_id.to_string(), phase);
    }

    /// Phase after a failed lifecycle operation.
    fn settle_phase(&self, sandbox_id: &str) {
        let mut table = self.inner.table();
        let phase = if table.active.contains_key(sandbox_id) {
            SandboxPhase::Running
        } else {
            SandboxPhase::Errored
        };
        table.phases.insert(sandbox_id.to_string(), phase);
    }

    /// Stop the active process, if any, and wait for its pump to finish.
    async fn terminate_active(&self, sandbox_id: &str) -> Option<String> {
        let (process_id, handle) = {
            let mut table = self.inner.table();
            let process_id = table.active.get(sandbox_id)?.clone();
            let handle = table
                .processes
                .get_mut(&process_id)
                .and_then(|p| p.handle.take());
            (process_id, handle)
        };

        if let Some(handle) = handle {
            debug!(sandbox_id = %sandbox_id, process_id = %process_id, "Terminating process");
            let _ = handle.cancel.send(());
            if let Err(e) = handle.task.await {
                warn!(process_id = %process_id, error = %e, "Process monitor task failed");
            }
        }

        // Covers a monitor task that died without recording the exit.
        let mut table = self.inner.table();
        if table.active.get(sandbox_id) == Some(&process_id) {
            table.active.remove(sandbox_id);
        }
        if let Some(process) = table.processes.get_mut(&process_id) {
            if !process.info.status.is_finished() {
                process.info.status = ProcessStatus::Error;
                process.info.ended_at = Some(Utc::now());
            }
        }
        Some(process_id)
    }

    fn allocate_id(&self, prefix: &str) -> String {
        let table = self.inner.table();
        let mut stamp = Utc::now().timestamp_millis();
        loop {
            let candidate = format!("{}{}", prefix, stamp);
            if !table.processes.contains_key(&candidate) && !self.inner.logs.contains(&candidate) {
                return candidate;
            }
            stamp += 1;
        }
    }

    async fn launch(&self, sandbox_id: &str, launch: Launch) -> Result<String> {
        let Launch {
            process_id,
            kind,
            label,
            command: mut cmd,
            header,
            pid_file,
        } = launch;
        let mut writer = self.inner.logs.open_writer(&process_id).await?;
        if let Some(header) = header {
            writer.append(header.as_bytes()).await?;
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut info = ProcessInfo {
            process_id: process_id.clone(),
            sandbox_id: sandbox_id.to_string(),
            kind,
            command: label,
            status: ProcessStatus::Starting,
            pid: None,
            exit_code: None,
            started_at: Utc::now(),
            ended_at: None,
        };

        match cmd.spawn() {
            Ok(child) => {
                info.status = ProcessStatus::Running;
                info.pid = child.id();
                let (cancel, cancel_rx) = oneshot::channel();
                let pump = Pump::new(
                    self.inner.clone(),
                    process_id.clone(),
                    sandbox_id.to_string(),
                    writer,
                    pid_file,
                );

                let mut table = self.inner.table();
                let task = tokio::spawn(pump.run(child, cancel_rx));
                table.processes.insert(
                    process_id.clone(),
                    ManagedProcess {
                        info,
                        handle: Some(ProcessHandle { cancel, task }),
                    },
                );
                table
                    .active
                    .insert(sandbox_id.to_string(), process_id.clone());
                table
                    .phases
                    .insert(sandbox_id.to_string(), SandboxPhase::Running);
                info!(sandbox_id = %sandbox_id, process_id = %process_id, kind = ?kind, "Process started");
            }
            Err(e) => {
                warn!(sandbox_id = %sandbox_id, process_id = %process_id, error = %e, "Failed to spawn process");
                let message = format!("Failed to start process: {}\n", e);
                if let Err(log_err) = writer.append(message.as_bytes()).await {
                    warn!(process_id = %process_id, error = %log_err, "Failed to write process log");
                }

                info.status = ProcessStatus::Error;
                info.ended_at = Some(Utc::now());
                {
                    let mut table = self.inner.table();
                    table
                        .processes
                        .insert(process_id.clone(), ManagedProcess { info, handle: None });
                    table
                        .phases
                        .insert(sandbox_id.to_string(), SandboxPhase::Errored);
                }
                self.inner
                    .broadcaster
                    .system(sandbox_id, message.trim_end());
            }
        }

        Ok(process_id)
    }
}
