mod parse;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::DirectoryConfig;
use crate::error::Result;
use crate::tenant::{ResourceLimits, Sandbox, SandboxStatus, Tenant};

pub use parse::ParseMirror;

/// Mirror copy of a tenant as stored in the directory service.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantRecord {
    pub tenant_id: String,
    pub pod_name: String,
    pub plan: String,
    pub resources: ResourceLimits,
    /// How the tenant came to exist: created, reused or synced
    pub status: String,
}

impl TenantRecord {
    pub fn from_tenant(tenant: &Tenant, status: &str) -> Self {
        Self {
            tenant_id: tenant.id.clone(),
            pod_name: tenant.pod_name.clone(),
            plan: tenant.plan.to_string(),
            resources: tenant.resource_limits.clone(),
            status: status.to_string(),
        }
    }
}

/// Mirror copy of a sandbox as stored in the directory service.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxRecord {
    pub sandbox_id: String,
    pub container_id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub status: SandboxStatus,
}

impl From<&Sandbox> for SandboxRecord {
    fn from(sandbox: &Sandbox) -> Self {
        Self {
            sandbox_id: sandbox.id.clone(),
            container_id: sandbox.container_id.clone(),
            tenant_id: sandbox.tenant_id.clone(),
            user_id: sandbox.user_id.clone(),
            status: sandbox.status,
        }
    }
}

/// External directory that mirrors, but does not own, registry state.
///
/// Callers treat every method as best-effort: a failure is logged and the
/// in-memory registry stays authoritative.
#[async_trait]
pub trait DirectoryMirror: Send + Sync {
    /// Insert or update a tenant keyed by tenant id
    async fn save_tenant(&self, record: &TenantRecord) -> Result<()>;

    /// Delete a tenant and every sandbox mirrored under it
    async fn delete_tenant(&self, tenant_id: &str) -> Result<()>;

    /// Insert or update a sandbox keyed by sandbox id
    async fn save_sandbox(&self, record: &SandboxRecord) -> Result<()>;
}

/// Mirror used when no directory service is configured.
pub struct NoopMirror;

#[async_trait]
impl DirectoryMirror for NoopMirror {
    async fn save_tenant(&self, _record: &TenantRecord) -> Result<()> {
        Ok(())
    }

    async fn delete_tenant(&self, _tenant_id: &str) -> Result<()> {
        Ok(())
    }

    async fn save_sandbox(&self, _record: &SandboxRecord) -> Result<()> {
        Ok(())
    }
}

/// Build the mirror selected by configuration.
pub fn create_mirror(config: &DirectoryConfig) -> Result<Arc<dyn DirectoryMirror>> {
    if config.enabled {
        Ok(Arc::new(ParseMirror::new(config)?))
    } else {
        Ok(Arc::new(NoopMirror))
    }
}
