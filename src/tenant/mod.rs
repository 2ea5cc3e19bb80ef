mod registry;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ManagerError, Result};

pub use registry::{CreatedTenant, TenantOrigin, TenantRegistry};

/// Billing plan; each maps to a fixed set of resource limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    #[default]
    Basic,
    Pro,
    Business,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Pro => "pro",
            Self::Business => "business",
        }
    }

    pub fn limits(&self) -> ResourceLimits {
        let (memory, cpus, max_sandboxes) = match self {
            Self::Basic => ("512m", 0.5, 10),
            Self::Pro => ("1g", 1.0, 20),
            Self::Business => ("2g", 2.0, 30),
        };
        ResourceLimits {
            memory_limit: memory.to_string(),
            cpu_limit: cpus,
            max_sandboxes,
        }
    }

    /// Cheapest plan whose quota admits `sandboxes`.
    pub fn fitting(sandboxes: usize) -> Option<Plan> {
        [Self::Basic, Self::Pro, Self::Business]
            .into_iter()
            .find(|plan| plan.limits().max_sandboxes >= sandboxes)
    }
}

impl FromStr for Plan {
    type Err = ManagerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" => Ok(Self::Basic),
            "pro" => Ok(Self::Pro),
            "business" => Ok(Self::Business),
            other => Err(ManagerError::Validation(format!(
                "Invalid plan '{}'. Available plans: basic, pro, business",
                other
            ))),
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-sandbox container limits and the tenant's sandbox quota.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(rename = "memory")]
    pub memory_limit: String,
    #[serde(rename = "cpus")]
    pub cpu_limit: f64,
    #[serde(rename = "maxSandboxes")]
    pub max_sandboxes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sandbox {
    #[serde(rename = "sandboxId")]
    pub id: String,
    pub container_id: String,
    pub tenant_id: String,
    pub user_id: String,
    pub status: SandboxStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
    #[serde(rename = "tenantId")]
    pub id: String,
    pub pod_name: String,
    pub plan: Plan,
    #[serde(rename = "resources")]
    pub resource_limits: ResourceLimits,
    pub created_at: DateTime<Utc>,
    pub sandboxes: BTreeMap<String, Sandbox>,
}

impl Tenant {
    pub fn new(id: &str, pod_name: String, plan: Plan) -> Self {
        Self {
            id: id.to_string(),
            pod_name,
            plan,
            resource_limits: plan.limits(),
            created_at: Utc::now(),
            sandboxes: BTreeMap::new(),
        }
    }
}

/// Check that an identifier is safe to embed in engine object names.
pub fn validate_id(field: &str, value: &str) -> Result<()> {
    validate_name(field, value, MAX_ID_LEN)
}

/// Check a sandbox id taken from a request before it reaches the engine.
///
/// Sandbox ids are `<tenant>-<user>-<millis>`, so they may be longer than
/// the ids they are built from.
pub fn validate_sandbox_id(value: &str) -> Result<()> {
    validate_name("sandboxId", value, MAX_SANDBOX_ID_LEN)
}

const MAX_ID_LEN: usize = 64;
const MAX_SANDBOX_ID_LEN: usize = 2 * MAX_ID_LEN + 24;

fn validate_name(field: &str, value: &str, max_len: usize) -> Result<()> {
    if value.is_empty() {
        return Err(ManagerError::Validation(format!("{} is required", field)));
    }
    // A leading '-' would be read as an engine CLI flag.
    if value.len() > max_len
        || !value.starts_with(|c: char| c.is_ascii_alphanumeric())
        || !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        return Err(ManagerError::Validation(format!(
            "{} must start with a letter or digit and may only contain letters, digits, '_', '.' and '-' (max {} chars)",
            field, max_len
        )));
    }
    Ok(())
}
