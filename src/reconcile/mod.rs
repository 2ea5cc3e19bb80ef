use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::engine::{ContainerEngine, ContainerSummary};
use crate::error::Result;
use crate::tenant::{validate_id, Plan, Sandbox, SandboxStatus, Tenant, TenantRegistry};

const UNKNOWN_USER: &str = "unknown";

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub pods_scanned: usize,
    pub tenants_adopted: Vec<String>,
    pub sandboxes_adopted: Vec<String>,
    /// Every tenant tracked after the pass
    pub tenants: Vec<String>,
    pub total_sandboxes: usize,
}

/// Adopts pods and containers that exist in the engine but not in the registry.
///
/// A newly adopted tenant gets the cheapest plan whose quota covers the
/// containers already in its pod.
///
/// Already-tracked tenants and sandboxes are never overwritten, so running
/// the job repeatedly is harmless.
pub struct ReconciliationJob {
    engine: Arc<dyn ContainerEngine>,
    registry: Arc<TenantRegistry>,
}

impl ReconciliationJob {
    pub fn new(engine: Arc<dyn ContainerEngine>, registry: Arc<TenantRegistry>) -> Self {
        Self { engine, registry }
    }

    pub async fn run(&self) -> Result<ReconcileReport> {
        let pods = self.engine.list_pods().await?;
        let mut report = ReconcileReport {
            pods_scanned: pods.len(),
            ..ReconcileReport::default()
        };

        for pod in pods {
            let Some(tenant_id) = self.registry.tenant_id_from_pod(&pod.name) else {
                debug!(pod = %pod.name, "Skipping pod outside the tenant naming scheme");
                continue;
            };
            if let Err(e) = validate_id("tenantId", tenant_id) {
                warn!(pod = %pod.name, error = %e, "Skipping pod with unusable tenant id");
                continue;
            }

            let containers: Vec<ContainerSummary> = match self.engine.list_containers(&pod.name).await
            {
                Ok(containers) => containers.into_iter().filter(|c| !c.is_infra).collect(),
                Err(e) => {
                    warn!(pod = %pod.name, error = %e, "Failed to list pod containers");
                    let tenant = Tenant::new(tenant_id, pod.name.clone(), Plan::default());
                    if self.registry.adopt_if_absent(tenant).await {
                        report.tenants_adopted.push(tenant_id.to_string());
                    }
                    continue;
                }
            };

            let plan = Plan::fitting(containers.len()).unwrap_or_else(|| {
                warn!(
                    pod = %pod.name,
                    containers = containers.len(),
                    "Pod holds more sandboxes than any plan allows"
                );
                Plan::Business
            });
            let tenant = Tenant::new(tenant_id, pod.name.clone(), plan);
            if self.registry.adopt_if_absent(tenant).await {
                report.tenants_adopted.push(tenant_id.to_string());
            }

            for container in containers {
                let sandbox = sandbox_from_container(tenant_id, container);
                let sandbox_id = sandbox.id.clone();
                if self.registry.adopt_sandbox_if_absent(sandbox).await {
                    report.sandboxes_adopted.push(sandbox_id);
                }
            }

            if let Ok(tenant) = self.registry.get_tenant(tenant_id).await {
                if tenant.sandboxes.len() > tenant.resource_limits.max_sandboxes {
                    warn!(
                        tenant_id = %tenant_id,
                        sandboxes = tenant.sandboxes.len(),
                        max = tenant.resource_limits.max_sandboxes,
                        "Tenant is over its sandbox quota; new sandboxes are refused until it shrinks"
                    );
                }
            }
        }

        report.tenants = self
            .registry
            .list_tenants()
            .await
            .into_iter()
            .map(|t| t.id)
            .collect();
        report.total_sandboxes = self.registry.sandbox_count().await;

        info!(
            pods = report.pods_scanned,
            tenants_adopted = report.tenants_adopted.len(),
            sandboxes_adopted = report.sandboxes_adopted.len(),
            "Reconciliation finished"
        );
        Ok(report)
    }
}

fn sandbox_from_container(tenant_id: &str, container: ContainerSummary) -> Sandbox {
    let status = if container.state.is_running() {
        SandboxStatus::Running
    } else {
        SandboxStatus::Stopped
    };
    let created_at = container
        .created
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now);

    Sandbox {
        user_id: guess_user_id(tenant_id, &container.name),
        id: container.name,
        container_id: container.id,
        tenant_id: tenant_id.to_string(),
        status,
        created_at,
    }
}

/// Best guess at the owning user from a `<tenant>-<user>-<millis>` container name.
pub fn guess_user_id(tenant_id: &str, container_name: &str) -> String {
    let Some(rest) = container_name
        .strip_prefix(tenant_id)
        .and_then(|r| r.strip_prefix('-'))
    else {
        return UNKNOWN_USER.to_string();
    };

    let user = match rest.rsplit_once('-') {
        Some((user, stamp)) if !stamp.is_empty() && stamp.bytes().all(|b| b.is_ascii_digit()) => {
            user
        }
        _ => rest,
    };

    if user.is_empty() {
        UNKNOWN_USER.to_string()
    } else {
        user.to_string()
    }
}
