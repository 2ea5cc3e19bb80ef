use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::directory::{DirectoryMirror, SandboxRecord, TenantRecord};
use crate::engine::ContainerEngine;
use crate::error::{ManagerError, Result};
use crate::tenant::{validate_id, Plan, Sandbox, SandboxStatus, Tenant};

/// Whether `create_tenant` created a new pod or adopted an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TenantOrigin {
    Created,
    Reused,
}

impl TenantOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Reused => "reused",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreatedTenant {
    pub tenant: Tenant,
    pub origin: TenantOrigin,
}

#[derive(Default)]
struct RegistryState {
    tenants: BTreeMap<String, Tenant>,
    /// Sandbox ids whose containers are being created, counted against quota
    reserved: BTreeMap<String, HashSet<String>>,
}

/// Authoritative in-memory registry of tenants and their sandboxes.
///
/// Engine side effects go through the `ContainerEngine`; every successful
/// mutation is mirrored to the directory service on a best-effort basis.
pub struct TenantRegistry {
    engine: Arc<dyn ContainerEngine>,
    mirror: Arc<dyn DirectoryMirror>,
    config: EngineConfig,
    state: RwLock<RegistryState>,
}

impl TenantRegistry {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        mirror: Arc<dyn DirectoryMirror>,
        config: EngineConfig,
    ) -> Self {
        Self {
            engine,
            mirror,
            config,
            state: RwLock::new(RegistryState::default()),
        }
    }

    pub fn pod_name(&self, tenant_id: &str) -> String {
        format!("{}{}", self.config.pod_prefix, tenant_id)
    }

    /// Tenant id encoded in a pod name, if the pod follows the naming convention.
    pub fn tenant_id_from_pod<'a>(&self, pod_name: &'a str) -> Option<&'a str> {
        pod_name
            .strip_prefix(self.config.pod_prefix.as_str())
            .filter(|id| !id.is_empty())
    }

    pub async fn create_tenant(&self, tenant_id: &str, plan: &str) -> Result<CreatedTenant> {
        validate_id("tenantId", tenant_id)?;
        let plan: Plan = plan.parse()?;

        if self.state.read().await.tenants.contains_key(tenant_id) {
            return Err(ManagerError::AlreadyExists {
                kind: "Tenant",
                id: tenant_id.to_string(),
            });
        }

        let pod_name = self.pod_name(tenant_id);
        let origin = if self.engine.pod_exists(&pod_name).await? {
            info!(pod = %pod_name, "Pod already exists, reusing it");
            TenantOrigin::Reused
        } else {
            self.engine
                .create_pod(&pod_name, &self.config.port_mappings)
                .await?;
            TenantOrigin::Created
        };

        let tenant = Tenant::new(tenant_id, pod_name, plan);
        {
            let mut state = self.state.write().await;
            if state.tenants.contains_key(tenant_id) {
                return Err(ManagerError::AlreadyExists {
                    kind: "Tenant",
                    id: tenant_id.to_string(),
                });
            }
            state.tenants.insert(tenant_id.to_string(), tenant.clone());
        }

        info!(tenant_id = %tenant_id, plan = %plan, origin = origin.as_str(), "Tenant registered");
        self.mirror_tenant(&tenant, origin.as_str()).await;

        Ok(CreatedTenant { tenant, origin })
    }

    pub async fn get_tenant(&self, tenant_id: &str) -> Result<Tenant> {
        self.state
            .read()
            .await
            .tenants
            .get(tenant_id)
            .cloned()
            .ok_or_else(|| ManagerError::not_found("Tenant", tenant_id))
    }

    pub async fn list_tenants(&self) -> Vec<Tenant> {
        self.state.read().await.tenants.values().cloned().collect()
    }

    /// Remove the tenant's pod (and with it every sandbox container), then forget it.
    ///
    /// If the engine refuses, the tenant stays registered.
    pub async fn delete_tenant(&self, tenant_id: &str, force: bool) -> Result<Tenant> {
        let pod_name = self.get_tenant(tenant_id).await?.pod_name;

        self.engine.remove_pod(&pod_name, force).await?;

        let removed = {
            let mut state = self.state.write().await;
            state.reserved.remove(tenant_id);
            state.tenants.remove(tenant_id)
        }
        .ok_or_else(|| ManagerError::not_found("Tenant", tenant_id))?;

        info!(tenant_id = %tenant_id, sandboxes = removed.sandboxes.len(), "Tenant removed");
        if let Err(e) = self.mirror.delete_tenant(tenant_id).await {
            warn!(tenant_id = %tenant_id, error = %e, "Failed to delete tenant from directory");
        }

        Ok(removed)
    }

    /// Switch plans. A plan whose quota is below the sandboxes in use is refused.
    pub async fn update_plan(&self, tenant_id: &str, plan: &str) -> Result<Tenant> {
        let plan: Plan = plan.parse()?;

        let tenant = {
            let mut state = self.state.write().await;
            let reserved = state.reserved.get(tenant_id).map_or(0, HashSet::len);
            let tenant = state
                .tenants
                .get_mut(tenant_id)
                .ok_or_else(|| ManagerError::not_found("Tenant", tenant_id))?;

            let in_use = tenant.sandboxes.len() + reserved;
            let max = plan.limits().max_sandboxes;
            if in_use > max {
                return Err(ManagerError::Validation(format!(
                    "Tenant '{}' has {} sandboxes but plan '{}' allows at most {}",
                    tenant_id, in_use, plan, max
                )));
            }
            tenant.plan = plan;
            tenant.resource_limits = plan.limits();
            tenant.clone()
        };

        info!(tenant_id = %tenant_id, plan = %plan, "Tenant plan updated");
        self.mirror_tenant(&tenant, "updated").await;
        Ok(tenant)
    }

    /// Register a tenant discovered outside this process. Returns false if the id is already tracked.
    pub async fn adopt_if_absent(&self, tenant: Tenant) -> bool {
        let adopted = {
            let mut state = self.state.write().await;
            if state.tenants.contains_key(&tenant.id) {
                false
            } else {
                state.tenants.insert(tenant.id.clone(), tenant.clone());
                true
            }
        };

        if adopted {
            info!(tenant_id = %tenant.id, pod = %tenant.pod_name, "Adopted existing tenant pod");
            self.mirror_tenant(&tenant, "synced").await;
        }
        adopted
    }

    /// Create a sandbox container for a user, enforcing the tenant's quota.
    ///
    /// The slot is reserved before the engine is called, so concurrent
    /// requests can never overshoot `max_sandboxes`.
    pub async fn create_sandbox(&self, tenant_id: &str, user_id: &str) -> Result<Sandbox> {
        validate_id("userId", user_id)?;

        let (sandbox_id, pod_name, limits) = {
            let mut state = self.state.write().await;
            let tenant = state
                .tenants
                .get(tenant_id)
                .ok_or_else(|| ManagerError::not_found("Tenant", tenant_id))?;

            let pod_name = tenant.pod_name.clone();
            let limits = tenant.resource_limits.clone();
            let existing: HashSet<String> = tenant.sandboxes.keys().cloned().collect();

            let reserved = state.reserved.entry(tenant_id.to_string()).or_default();
            if existing.len() + reserved.len() >= limits.max_sandboxes {
                return Err(ManagerError::QuotaExceeded {
                    tenant_id: tenant_id.to_string(),
                    max: limits.max_sandboxes,
                });
            }

            let mut stamp = Utc::now().timestamp_millis();
            let mut sandbox_id = format!("{}-{}-{}", tenant_id, user_id, stamp);
            while existing.contains(&sandbox_id) || reserved.contains(&sandbox_id) {
                stamp += 1;
                sandbox_id = format!("{}-{}-{}", tenant_id, user_id, stamp);
            }
            reserved.insert(sandbox_id.clone());

            (sandbox_id, pod_name, limits)
        };

        let created = self
            .engine
            .create_sandbox_container(&pod_name, &sandbox_id, &limits, &self.config.base_image)
            .await;

        let mut state = self.state.write().await;
        if let Some(reserved) = state.reserved.get_mut(tenant_id) {
            reserved.remove(&sandbox_id);
        }
        let container_id = created?;

        let sandbox = Sandbox {
            id: sandbox_id.clone(),
            container_id,
            tenant_id: tenant_id.to_string(),
            user_id: user_id.to_string(),
            status: SandboxStatus::Running,
            created_at: Utc::now(),
        };

        // The tenant may have been deleted while the container was created.
        let tenant = state
            .tenants
            .get_mut(tenant_id)
            .ok_or_else(|| ManagerError::not_found("Tenant", tenant_id))?;
        tenant.sandboxes.insert(sandbox_id.clone(), sandbox.clone());
        drop(state);

        info!(tenant_id = %tenant_id, sandbox_id = %sandbox_id, "Sandbox created");
        self.mirror_sandbox(&sandbox).await;
        Ok(sandbox)
    }

    /// Register a sandbox discovered outside this process. Returns false if already tracked
    /// or if the owning tenant is unknown.
    pub async fn adopt_sandbox_if_absent(&self, sandbox: Sandbox) -> bool {
        let adopted = {
            let mut state = self.state.write().await;
            match state.tenants.get_mut(&sandbox.tenant_id) {
                Some(tenant) if !tenant.sandboxes.contains_key(&sandbox.id) => {
                    tenant.sandboxes.insert(sandbox.id.clone(), sandbox.clone());
                    true
                }
                _ => false,
            }
        };

        if adopted {
            info!(tenant_id = %sandbox.tenant_id, sandbox_id = %sandbox.id, "Adopted existing sandbox");
            self.mirror_sandbox(&sandbox).await;
        }
        adopted
    }

    pub async fn find_sandbox(&self, sandbox_id: &str) -> Option<Sandbox> {
        self.state
            .read()
            .await
            .tenants
            .values()
            .find_map(|t| t.sandboxes.get(sandbox_id).cloned())
    }

    /// Record a status transition driven by a lifecycle operation.
    pub async fn set_sandbox_status(&self, sandbox_id: &str, status: SandboxStatus) {
        let changed = {
            let mut state = self.state.write().await;
            state
                .tenants
                .values_mut()
                .find_map(|t| t.sandboxes.get_mut(sandbox_id))
                .filter(|s| s.status != status)
                .map(|s| {
                    s.status = status;
                    s.clone()
                })
        };

        if let Some(sandbox) = changed {
            self.mirror_sandbox(&sandbox).await;
        }
    }

    /// Point-in-time copy of every tenant, ordered by id.
    pub async fn snapshot(&self) -> Vec<Tenant> {
        self.list_tenants().await
    }

    pub async fn sandbox_count(&self) -> usize {
        self.state
            .read()
            .await
            .tenants
            .values()
            .map(|t| t.sandboxes.len())
            .sum()
    }

    async fn mirror_tenant(&self, tenant: &Tenant, status: &str) {
        let record = TenantRecord::from_tenant(tenant, status);
        if let Err(e) = self.mirror.save_tenant(&record).await {
            warn!(tenant_id = %tenant.id, error = %e, "Failed to mirror tenant to directory");
        }
    }

    async fn mirror_sandbox(&self, sandbox: &Sandbox) {
        if let Err(e) = self.mirror.save_sandbox(&SandboxRecord::from(sandbox)).await {
            warn!(sandbox_id = %sandbox.id, error = %e, "Failed to mirror sandbox to directory");
        }
    }
}
