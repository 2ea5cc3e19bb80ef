use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::config::PreviewConfig;
use crate::error::{ManagerError, Result};

/// A preview URL registered for a port the tenant pod already publishes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Preview {
    pub instance_id: String,
    pub sandbox_id: String,
    pub port: u16,
    pub access_url: String,
    pub created_at: DateTime<Utc>,
}

pub struct PreviewRegistry {
    config: PreviewConfig,
    previews: Mutex<BTreeMap<String, Preview>>,
}

impl PreviewRegistry {
    pub fn new(config: PreviewConfig) -> Self {
        Self {
            config,
            previews: Mutex::new(BTreeMap::new()),
        }
    }

    fn previews(&self) -> MutexGuard<'_, BTreeMap<String, Preview>> {
        self.previews.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create(&self, sandbox_id: &str, port: u16) -> Result<Preview> {
        if !self.config.ports.contains(&port) {
            let allowed: Vec<String> = self.config.ports.iter().map(u16::to_string).collect();
            return Err(ManagerError::Validation(format!(
                "Invalid port {}. Must be one of: {}",
                port,
                allowed.join(", ")
            )));
        }

        let mut previews = self.previews();
        let mut stamp = Utc::now().timestamp_millis();
        let mut instance_id = format!("preview-{}-{}", sandbox_id, stamp);
        while previews.contains_key(&instance_id) {
            stamp += 1;
            instance_id = format!("preview-{}-{}", sandbox_id, stamp);
        }

        let preview = Preview {
            instance_id: instance_id.clone(),
            sandbox_id: sandbox_id.to_string(),
            port,
            access_url: format!("http://{}:{}", self.config.host, port),
            created_at: Utc::now(),
        };
        previews.insert(instance_id, preview.clone());
        info!(sandbox_id = %sandbox_id, port, instance_id = %preview.instance_id, "Preview registered");
        Ok(preview)
    }

    pub fn list(&self, sandbox_id: &str) -> Vec<Preview> {
        self.previews()
            .values()
            .filter(|p| p.sandbox_id == sandbox_id)
            .cloned()
            .collect()
    }

    pub fn remove(&self, sandbox_id: &str, instance_id: &str) -> Result<Preview> {
        let mut previews = self.previews();
        match previews.get(instance_id) {
            Some(p) if p.sandbox_id == sandbox_id => {}
            _ => return Err(ManagerError::not_found("Preview", instance_id)),
        }
        previews
            .remove(instance_id)
            .ok_or_else(|| ManagerError::not_found("Preview", instance_id))
    }

    /// Drop every preview of the given sandboxes.
    pub fn remove_sandboxes(&self, sandbox_ids: &[String]) -> usize {
        let mut previews = self.previews();
        let before = previews.len();
        previews.retain(|_, p| !sandbox_ids.contains(&p.sandbox_id));
        before - previews.len()
    }
}
