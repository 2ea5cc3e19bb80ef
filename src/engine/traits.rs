use async_trait::async_trait;
use tokio::process::Command;

use crate::config::PortMapping;
use crate::engine::{CommandResult, ContainerState, ContainerSummary, PodSummary};
use crate::error::Result;
use crate::tenant::ResourceLimits;

/// Trait for the external container engine.
///
/// Every method maps to one engine invocation. Failures surface as
/// `ManagerError::ExternalCommand` carrying the engine's stderr and are never
/// retried here; callers see exactly one attempt.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn pod_exists(&self, pod: &str) -> Result<bool>;

    /// Create a pod publishing the given ports
    async fn create_pod(&self, pod: &str, ports: &[PortMapping]) -> Result<()>;

    /// Create and start a sandbox container inside a pod, returning its container id
    async fn create_sandbox_container(
        &self,
        pod: &str,
        sandbox_id: &str,
        limits: &ResourceLimits,
        image: &str,
    ) -> Result<String>;

    async fn container_exists(&self, container: &str) -> Result<bool>;

    async fn container_state(&self, container: &str) -> Result<ContainerState>;

    async fn start_container(&self, container: &str) -> Result<()>;

    async fn restart_container(&self, container: &str) -> Result<()>;

    /// Remove a pod and, when forced, every container in it
    async fn remove_pod(&self, pod: &str, force: bool) -> Result<()>;

    async fn list_pods(&self) -> Result<Vec<PodSummary>>;

    /// List every container (running or not) that belongs to a pod
    async fn list_containers(&self, pod: &str) -> Result<Vec<ContainerSummary>>;

    /// Run a short command inside a container and wait for it.
    /// A nonzero exit is reported in the result, not as an error.
    async fn exec(&self, container: &str, argv: &[&str]) -> Result<CommandResult>;

    /// Build (but do not spawn) a long-running command attached to a container
    fn exec_command(&self, container: &str, workdir: &str, argv: &[String]) -> Command;

    /// Build (but do not spawn) a command following the container's own log stream
    fn follow_logs_command(&self, container: &str) -> Command;
}
