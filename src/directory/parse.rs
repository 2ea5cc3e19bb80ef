use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::DirectoryConfig;
use crate::directory::{DirectoryMirror, SandboxRecord, TenantRecord};
use crate::error::{ManagerError, Result};

const TENANT_CLASS: &str = "Tenant";
const SANDBOX_CLASS: &str = "Sandbox";

/// Mirror backed by a Parse-compatible REST object store.
///
/// Objects are keyed by a business field (`tenantId`, `sandboxId`); upserts
/// look the object up by that key first and then update or create it.
pub struct ParseMirror {
    client: Client,
    base_url: String,
    app_id: String,
    master_key: Option<String>,
}

impl ParseMirror {
    pub fn new(config: &DirectoryConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;

        Ok(Self {
            client,
            base_url: config.server_url.trim_end_matches('/').to_string(),
            app_id: config.app_id.clone(),
            master_key: config.master_key.clone(),
        })
    }

    fn class_url(&self, class: &str) -> String {
        format!("{}/classes/{}", self.base_url, class)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request
            .header("X-Parse-Application-Id", &self.app_id)
            .header("content-type", "application/json");
        match &self.master_key {
            Some(key) => request.header("X-Parse-Master-Key", key),
            None => request,
        }
    }

    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ManagerError::Mirror(format!(
                "directory returned {}: {}",
                status.as_u16(),
                error_text
            )));
        }
        Ok(response)
    }

    /// Object ids of every object in `class` whose `field` equals `value`.
    async fn find_ids(&self, class: &str, field: &str, value: &str) -> Result<Vec<String>> {
        let filter = serde_json::json!({ field: value }).to_string();
        let response = self
            .authorize(self.client.get(self.class_url(class)))
            .query(&[("where", filter)])
            .send()
            .await?;

        let found: QueryResponse = Self::check(response).await?.json().await?;
        Ok(found.results.into_iter().map(|o| o.object_id).collect())
    }

    async fn upsert<T: Serialize + Sync>(
        &self,
        class: &str,
        key_field: &str,
        key: &str,
        body: &T,
    ) -> Result<()> {
        let existing = self.find_ids(class, key_field, key).await?;
        let request = match existing.first() {
            Some(object_id) => self
                .client
                .put(format!("{}/{}", self.class_url(class), object_id)),
            None => self.client.post(self.class_url(class)),
        };

        let response = self.authorize(request).json(body).send().await?;
        Self::check(response).await?;
        debug!(class = %class, key = %key, "Mirrored object to directory");
        Ok(())
    }

    async fn delete_where(&self, class: &str, field: &str, value: &str) -> Result<usize> {
        let ids = self.find_ids(class, field, value).await?;
        for object_id in &ids {
            let url = format!("{}/{}", self.class_url(class), object_id);
            let response = self.authorize(self.client.delete(url)).send().await?;
            Self::check(response).await?;
        }
        Ok(ids.len())
    }
}

#[async_trait]
impl DirectoryMirror for ParseMirror {
    async fn save_tenant(&self, record: &TenantRecord) -> Result<()> {
        self.upsert(TENANT_CLASS, "tenantId", &record.tenant_id, record)
            .await
    }

    async fn delete_tenant(&self, tenant_id: &str) -> Result<()> {
        self.delete_where(TENANT_CLASS, "tenantId", tenant_id).await?;
        let removed = self
            .delete_where(SANDBOX_CLASS, "tenantId", tenant_id)
            .await?;
        debug!(tenant_id = %tenant_id, sandboxes = removed, "Deleted tenant from directory");
        Ok(())
    }

    async fn save_sandbox(&self, record: &SandboxRecord) -> Result<()> {
        self.upsert(SANDBOX_CLASS, "sandboxId", &record.sandbox_id, record)
            .await
    }
}

// Parse REST API types

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<ObjectRef>,
}

#[derive(Deserialize)]
struct ObjectRef {
    #[serde(rename = "objectId")]
    object_id: String,
}
