use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, PortMapping};
use crate::engine::traits::ContainerEngine;
use crate::engine::{CommandResult, ContainerState, ContainerSummary, PodSummary};
use crate::error::{ManagerError, Result};
use crate::tenant::ResourceLimits;

/// Podman engine backend.
///
/// Drives the engine through its CLI. Every user-supplied value is passed as a
/// discrete argument; nothing is ever assembled into a host-side shell string.
pub struct PodmanEngine {
    binary: String,
}

impl PodmanEngine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            binary: config.binary.clone(),
        }
    }

    /// Check if the engine CLI is installed and responsive.
    pub async fn is_available(&self) -> bool {
        match Command::new(&self.binary)
            .arg("version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            Ok(status) => status.success(),
            Err(_) => false,
        }
    }

    fn describe(&self, args: &[&str]) -> String {
        format!("{} {}", self.binary, args.join(" "))
    }

    /// Run the engine CLI to completion, capturing both streams.
    async fn output(&self, args: &[&str]) -> Result<CommandResult> {
        debug!(command = %self.describe(args), "Invoking container engine");

        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ManagerError::ExternalCommand {
                command: self.describe(args),
                stderr: e.to_string(),
            })?;

        Ok(CommandResult {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(1),
        })
    }

    /// Run the engine CLI and fail unless it exits successfully.
    async fn run(&self, args: &[&str]) -> Result<String> {
        let result = self.output(args).await?;
        if result.exit_code != 0 {
            warn!(
                command = %self.describe(args),
                exit_code = result.exit_code,
                stderr = %result.stderr.trim(),
                "Container engine command failed"
            );
            return Err(ManagerError::ExternalCommand {
                command: self.describe(args),
                stderr: result.stderr,
            });
        }
        Ok(result.stdout)
    }

    /// Run an `exists`-style check: exit 0 = yes, exit 1 = no, anything else fails.
    async fn exists_check(&self, args: &[&str]) -> Result<bool> {
        let result = self.output(args).await?;
        match result.exit_code {
            0 => Ok(true),
            1 => Ok(false),
            _ => Err(ManagerError::ExternalCommand {
                command: self.describe(args),
                stderr: result.stderr,
            }),
        }
    }
}

#[async_trait]
impl ContainerEngine for PodmanEngine {
    async fn pod_exists(&self, pod: &str) -> Result<bool> {
        self.exists_check(&["pod", "exists", pod]).await
    }

    async fn create_pod(&self, pod: &str, ports: &[PortMapping]) -> Result<()> {
        let publish: Vec<String> = ports
            .iter()
            .map(|p| format!("{}:{}", p.host, p.container))
            .collect();

        let mut args = vec!["pod", "create", "--name", pod];
        for mapping in &publish {
            args.push("-p");
            args.push(mapping.as_str());
        }

        self.run(&args).await?;
        info!(pod = %pod, "Pod created");
        Ok(())
    }

    async fn create_sandbox_container(
        &self,
        pod: &str,
        sandbox_id: &str,
        limits: &ResourceLimits,
        image: &str,
    ) -> Result<String> {
        let memory = format!("--memory={}", limits.memory_limit);
        let cpus = format!("--cpus={}", limits.cpu_limit);
        let stdout = self
            .run(&[
                "run",
                "-d",
                "--pod",
                pod,
                "--name",
                sandbox_id,
                memory.as_str(),
                cpus.as_str(),
                image,
                "tail",
                "-f",
                "/dev/null",
            ])
            .await?;

        let container_id = stdout.trim().to_string();
        info!(pod = %pod, sandbox_id = %sandbox_id, container_id = %container_id, "Sandbox container created");
        Ok(container_id)
    }

    async fn container_exists(&self, container: &str) -> Result<bool> {
        self.exists_check(&["container", "exists", container]).await
    }

    async fn container_state(&self, container: &str) -> Result<ContainerState> {
        let stdout = self
            .run(&["inspect", "--format", "{{.State.Status}}", container])
            .await?;
        Ok(ContainerState::from_engine(&stdout))
    }

    async fn start_container(&self, container: &str) -> Result<()> {
        self.run(&["start", container]).await?;
        info!(container = %container, "Container started");
        Ok(())
    }

    async fn restart_container(&self, container: &str) -> Result<()> {
        self.run(&["restart", container]).await?;
        info!(container = %container, "Container restarted");
        Ok(())
    }

    async fn remove_pod(&self, pod: &str, force: bool) -> Result<()> {
        let mut args = vec!["pod", "rm"];
        if force {
            args.push("-f");
        }
        args.push(pod);
        self.run(&args).await?;
        info!(pod = %pod, force = force, "Pod removed");
        Ok(())
    }

    async fn list_pods(&self) -> Result<Vec<PodSummary>> {
        let stdout = self.run(&["pod", "ps", "--format", "json"]).await?;
        parse_pods(&stdout)
    }

    async fn list_containers(&self, pod: &str) -> Result<Vec<ContainerSummary>> {
        let filter = format!("pod={}", pod);
        let stdout = self
            .run(&["ps", "-a", "--filter", filter.as_str(), "--format", "json"])
            .await?;
        let containers = parse_containers(&stdout)?;

        // The filter matches by name or id prefix; keep exact pod matches only.
        Ok(containers
            .into_iter()
            .filter(|c| c.pod_name.as_deref().map_or(true, |p| p == pod))
            .collect())
    }

    async fn exec(&self, container: &str, argv: &[&str]) -> Result<CommandResult> {
        let mut args = vec!["exec", container];
        args.extend_from_slice(argv);
        self.output(&args).await
    }

    fn exec_command(&self, container: &str, workdir: &str, argv: &[String]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["exec", "--workdir", workdir, container]);
        cmd.args(argv);
        cmd
    }

    fn follow_logs_command(&self, container: &str) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["logs", "-f", container]);
        cmd
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PodRecord {
    #[serde(default)]
    id: String,
    name: String,
    #[serde(default)]
    status: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerRecord {
    id: String,
    #[serde(default)]
    names: Vec<String>,
    #[serde(default)]
    state: String,
    #[serde(default)]
    pod_name: Option<String>,
    #[serde(default)]
    is_infra: bool,
    #[serde(default)]
    created: serde_json::Value,
}

fn parse_pods(stdout: &str) -> Result<Vec<PodSummary>> {
    if stdout.trim().is_empty() || stdout.trim() == "null" {
        return Ok(Vec::new());
    }
    let records: Vec<PodRecord> = serde_json::from_str(stdout)?;
    Ok(records
        .into_iter()
        .map(|r| PodSummary {
            id: r.id,
            name: r.name,
            status: r.status,
        })
        .collect())
}

fn parse_containers(stdout: &str) -> Result<Vec<ContainerSummary>> {
    if stdout.trim().is_empty() || stdout.trim() == "null" {
        return Ok(Vec::new());
    }
    let records: Vec<ContainerRecord> = serde_json::from_str(stdout)?;
    Ok(records
        .into_iter()
        .filter_map(|r| {
            let name = r.names.into_iter().next()?;
            Some(ContainerSummary {
                id: r.id,
                name,
                state: ContainerState::from_engine(&r.state),
                pod_name: r.pod_name.filter(|p| !p.is_empty()),
                is_infra: r.is_infra,
                // Older engines report an RFC 3339 string, newer ones epoch seconds.
                created: match &r.created {
                    serde_json::Value::Number(n) => n.as_i64(),
                    serde_json::Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
                        .ok()
                        .map(|t| t.timestamp()),
                    _ => None,
                },
            })
        })
        .collect())
}
