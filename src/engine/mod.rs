mod podman;
mod traits;

#[cfg(test)]
pub mod fake;

use serde::Serialize;

pub use podman::PodmanEngine;
pub use traits::ContainerEngine;

/// Result of running a command to completion.
#[derive(Debug)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Container state as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Running,
    Created,
    Paused,
    Exited,
    Stopped,
    Other(String),
}

impl ContainerState {
    pub fn from_engine(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "running" => Self::Running,
            "created" | "configured" | "initialized" => Self::Created,
            "paused" => Self::Paused,
            "exited" => Self::Exited,
            "stopped" => Self::Stopped,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

/// A pod as listed by the engine.
#[derive(Debug, Clone)]
pub struct PodSummary {
    pub id: String,
    pub name: String,
    pub status: String,
}

/// A container as listed by the engine.
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub state: ContainerState,
    pub pod_name: Option<String>,
    /// Pod infrastructure container (never a sandbox)
    pub is_infra: bool,
    /// Creation time, Unix epoch seconds
    pub created: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_state_from_engine() {
        assert_eq!(ContainerState::from_engine("Running\n"), ContainerState::Running);
        assert_eq!(ContainerState::from_engine("exited"), ContainerState::Exited);
        assert_eq!(
            ContainerState::from_engine("removing"),
            ContainerState::Other("removing".to_string())
        );
        assert!(!ContainerState::from_engine("created").is_running());
    }
}
