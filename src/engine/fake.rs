//! In-memory engine used by unit tests. Process bodies run as local `sh -c`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::PortMapping;
use crate::engine::traits::ContainerEngine;
use crate::engine::{CommandResult, ContainerState, ContainerSummary, PodSummary};
use crate::error::{ManagerError, Result};
use crate::tenant::ResourceLimits;

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub pod: String,
    pub state: ContainerState,
    pub is_infra: bool,
    pub created: i64,
}

#[derive(Default)]
struct FakeState {
    pods: BTreeMap<String, ()>,
    containers: BTreeMap<String, FakeContainer>,
    calls: Vec<String>,
    fail_next: Option<String>,
    next_id: u64,
}

pub struct FakeEngine {
    state: Mutex<FakeState>,
    follow_script: String,
    broken_exec: AtomicBool,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::with_follow_script("echo following; sleep 30")
    }

    pub fn with_follow_script(script: &str) -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            follow_script: script.to_string(),
            broken_exec: AtomicBool::new(false),
        }
    }

    pub fn add_pod(&self, pod: &str) {
        let mut state = self.state.lock().unwrap();
        state.pods.insert(pod.to_string(), ());
        let infra = format!("{}-infra", pod);
        state.containers.insert(
            infra.clone(),
            FakeContainer {
                id: infra,
                pod: pod.to_string(),
                state: ContainerState::Running,
                is_infra: true,
                created: 1_700_000_000,
            },
        );
    }

    pub fn add_container(&self, pod: &str, name: &str, state: ContainerState) {
        let mut guard = self.state.lock().unwrap();
        guard.next_id += 1;
        let id = format!("cid-{}", guard.next_id);
        guard.containers.insert(
            name.to_string(),
            FakeContainer {
                id,
                pod: pod.to_string(),
                state,
                is_infra: false,
                created: 1_700_000_000,
            },
        );
    }

    pub fn container(&self, name: &str) -> Option<FakeContainer> {
        self.state.lock().unwrap().containers.get(name).cloned()
    }

    pub fn has_pod(&self, pod: &str) -> bool {
        self.state.lock().unwrap().pods.contains_key(pod)
    }

    /// Make the next engine call fail with the given stderr.
    pub fn fail_next(&self, stderr: &str) {
        self.state.lock().unwrap().fail_next = Some(stderr.to_string());
    }

    /// Make spawned exec commands point at a binary that does not exist.
    pub fn break_exec(&self) {
        self.broken_exec.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    fn record(&self, call: String) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call.clone());
        if let Some(stderr) = state.fail_next.take() {
            return Err(ManagerError::ExternalCommand {
                command: call,
                stderr,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn pod_exists(&self, pod: &str) -> Result<bool> {
        self.record(format!("pod exists {}", pod))?;
        Ok(self.has_pod(pod))
    }

    async fn create_pod(&self, pod: &str, _ports: &[PortMapping]) -> Result<()> {
        self.record(format!("pod create {}", pod))?;
        self.add_pod(pod);
        Ok(())
    }

    async fn create_sandbox_container(
        &self,
        pod: &str,
        sandbox_id: &str,
        _limits: &ResourceLimits,
        _image: &str,
    ) -> Result<String> {
        self.record(format!("run {} {}", pod, sandbox_id))?;
        self.add_container(pod, sandbox_id, ContainerState::Running);
        Ok(self.container(sandbox_id).map(|c| c.id).unwrap_or_default())
    }

    async fn container_exists(&self, container: &str) -> Result<bool> {
        self.record(format!("container exists {}", container))?;
        Ok(self.container(container).is_some())
    }

    async fn container_state(&self, container: &str) -> Result<ContainerState> {
        self.record(format!("inspect {}", container))?;
        self.container(container)
            .map(|c| c.state)
            .ok_or_else(|| ManagerError::ExternalCommand {
                command: format!("inspect {}", container),
                stderr: "no such container".to_string(),
            })
    }

    async fn start_container(&self, container: &str) -> Result<()> {
        self.record(format!("start {}", container))?;
        if let Some(c) = self.state.lock().unwrap().containers.get_mut(container) {
            c.state = ContainerState::Running;
        }
        Ok(())
    }

    async fn restart_container(&self, container: &str) -> Result<()> {
        self.record(format!("restart {}", container))?;
        if let Some(c) = self.state.lock().unwrap().containers.get_mut(container) {
            c.state = ContainerState::Running;
        }
        Ok(())
    }

    async fn remove_pod(&self, pod: &str, force: bool) -> Result<()> {
        self.record(format!("pod rm {} force={}", pod, force))?;
        let mut state = self.state.lock().unwrap();
        state.pods.remove(pod);
        state.containers.retain(|_, c| c.pod != pod);
        Ok(())
    }

    async fn list_pods(&self) -> Result<Vec<PodSummary>> {
        self.record("pod ps".to_string())?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .pods
            .keys()
            .map(|name| PodSummary {
                id: format!("pod-{}", name),
                name: name.clone(),
                status: "Running".to_string(),
            })
            .collect())
    }

    async fn list_containers(&self, pod: &str) -> Result<Vec<ContainerSummary>> {
        self.record(format!("ps {}", pod))?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .containers
            .iter()
            .filter(|(_, c)| c.pod == pod)
            .map(|(name, c)| ContainerSummary {
                id: c.id.clone(),
                name: name.clone(),
                state: c.state.clone(),
                pod_name: Some(c.pod.clone()),
                is_infra: c.is_infra,
                created: Some(c.created),
            })
            .collect())
    }

    async fn exec(&self, container: &str, argv: &[&str]) -> Result<CommandResult> {
        self.record(format!("exec {} {}", container, argv.join(" ")))?;
        Ok(CommandResult {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
        })
    }

    fn exec_command(&self, _container: &str, _workdir: &str, argv: &[String]) -> Command {
        if self.broken_exec.load(Ordering::SeqCst) {
            return Command::new("/nonexistent/sandbox-engine");
        }
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd
    }

    fn follow_logs_command(&self, _container: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", self.follow_script.as_str()]);
        cmd
    }
}
