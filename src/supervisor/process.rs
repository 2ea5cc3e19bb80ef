use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::SupervisorConfig;

/// Lifecycle status of one supervised run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Starting,
    Running,
    Completed,
    Error,
}

impl ProcessStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// Per-sandbox state machine value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxPhase {
    #[default]
    Idle,
    Starting,
    Running,
    Completed,
    Errored,
}

/// What a managed process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessKind {
    /// An explicit command executed inside the sandbox
    Command,
    /// A follower of the container's own log stream after a restart
    Follow,
}

/// Public view of a managed process.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub process_id: String,
    pub sandbox_id: String,
    pub kind: ProcessKind,
    pub command: String,
    pub status: ProcessStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Response of an offset log poll.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessLogs {
    pub logs: String,
    pub next_offset: u64,
    pub status: ProcessStatus,
}

/// How a pump task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Exited(i32),
    /// Stopped on request, or killed by a signal
    Terminated,
    /// The exit status could not be collected
    Lost,
}

impl ExitOutcome {
    pub fn status(&self) -> ProcessStatus {
        match self {
            Self::Exited(0) => ProcessStatus::Completed,
            _ => ProcessStatus::Error,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(*code),
            _ => None,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Exited(code) => format!("Process exited with code {}", code),
            Self::Terminated => "Process terminated".to_string(),
            Self::Lost => "Process exit status unavailable".to_string(),
        }
    }

    /// Line appended to the process log after the last output byte.
    pub fn trailer(&self) -> String {
        format!("\n[{}]\n", self.message())
    }
}

/// Handle on a live pump task: a one-shot stop request and the task itself.
pub(crate) struct ProcessHandle {
    pub cancel: oneshot::Sender<()>,
    pub task: JoinHandle<()>,
}

pub(crate) struct ManagedProcess {
    pub info: ProcessInfo,
    pub handle: Option<ProcessHandle>,
}

/// Body of an install-and-start request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchRequest {
    pub command: Option<String>,
    pub cwd: Option<String>,
    pub install: Option<bool>,
}

impl LaunchRequest {
    /// Resolve the shell script and working directory, filling in configured defaults.
    pub fn resolve(&self, config: &SupervisorConfig) -> (String, String) {
        let command = self
            .command
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(config.default_command.as_str());
        let cwd = self
            .cwd
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(config.default_workdir.as_str());

        let script = if self.install.unwrap_or(true) && !config.install_command.is_empty() {
            format!("{} && {}", config.install_command, command)
        } else {
            command.to_string()
        };
        (script, cwd.to_string())
    }
}
