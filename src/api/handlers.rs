use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::api::extract::JsonBody;
use crate::api::AppState;
use crate::directory::TenantRecord;
use crate::error::{ManagerError, Result};
use crate::reconcile::ReconcileReport;
use crate::supervisor::{LaunchRequest, ProcessInfo, ProcessLogs};
use crate::tenant::{Sandbox, SandboxStatus, Tenant};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTenantBody {
    tenant_id: Option<String>,
    plan: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSandboxBody {
    user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdatePlanBody {
    plan: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PreviewBody {
    port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteTenantQuery {
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    offset: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxCreated {
    sandbox_id: String,
    container_id: String,
    status: SandboxStatus,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStarted {
    success: bool,
    sandbox_id: String,
    process_id: String,
}

#[derive(Serialize)]
pub struct TenantList {
    tenants: Vec<Tenant>,
}

#[derive(Serialize)]
pub struct ProcessList {
    processes: Vec<ProcessInfo>,
}

const DEFAULT_PREVIEW_PORT: u16 = 3000;

fn required(field: &str, value: Option<String>) -> Result<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ManagerError::Validation(format!("{} is required", field)))
}

pub async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn create_tenant(
    State(state): State<AppState>,
    JsonBody(body): JsonBody<CreateTenantBody>,
) -> Result<Json<TenantRecord>> {
    let tenant_id = required("tenantId", body.tenant_id)?;
    let plan = body.plan.unwrap_or_else(|| "basic".to_string());

    let created = state.registry.create_tenant(&tenant_id, &plan).await?;
    Ok(Json(TenantRecord::from_tenant(
        &created.tenant,
        created.origin.as_str(),
    )))
}

pub async fn list_tenants(State(state): State<AppState>) -> Json<TenantList> {
    Json(TenantList {
        tenants: state.registry.list_tenants().await,
    })
}

pub async fn get_tenant(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Json<Tenant>> {
    Ok(Json(state.registry.get_tenant(&tenant_id).await?))
}

pub async fn delete_tenant(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Query(query): Query<DeleteTenantQuery>,
) -> Result<Json<Value>> {
    let tenant = state.registry.get_tenant(&tenant_id).await?;
    let sandbox_ids: Vec<String> = tenant.sandboxes.keys().cloned().collect();

    let terminated = state.supervisor.terminate_sandboxes(&sandbox_ids).await;
    state.registry.delete_tenant(&tenant_id, query.force).await?;
    state.previews.remove_sandboxes(&sandbox_ids);

    info!(tenant_id = %tenant_id, terminated, "Tenant deleted");
    Ok(Json(json!({
        "message": format!("Tenant {} removed successfully", tenant_id)
    })))
}

pub async fn update_plan(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    JsonBody(body): JsonBody<UpdatePlanBody>,
) -> Result<Json<TenantRecord>> {
    let plan = required("plan", body.plan)?;
    let tenant = state.registry.update_plan(&tenant_id, &plan).await?;
    Ok(Json(TenantRecord::from_tenant(&tenant, "updated")))
}

pub async fn create_sandbox(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    JsonBody(body): JsonBody<CreateSandboxBody>,
) -> Result<Json<SandboxCreated>> {
    let user_id = required("userId", body.user_id)?;
    let Sandbox {
        id,
        container_id,
        status,
        ..
    } = state.registry.create_sandbox(&tenant_id, &user_id).await?;

    Ok(Json(SandboxCreated {
        sandbox_id: id,
        container_id,
        status,
    }))
}

pub async fn install_and_start(
    State(state): State<AppState>,
    Path(sandbox_id): Path<String>,
    JsonBody(request): JsonBody<LaunchRequest>,
) -> Result<Json<ProcessStarted>> {
    let process_id = state
        .supervisor
        .install_and_start(&sandbox_id, &request)
        .await?;

    Ok(Json(ProcessStarted {
        success: true,
        sandbox_id,
        process_id,
    }))
}

pub async fn restart(
    State(state): State<AppState>,
    Path(sandbox_id): Path<String>,
) -> Result<Json<ProcessStarted>> {
    let process_id = state.supervisor.restart(&sandbox_id).await?;
    Ok(Json(ProcessStarted {
        success: true,
        sandbox_id,
        process_id,
    }))
}

pub async fn stop(
    State(state): State<AppState>,
    Path(sandbox_id): Path<String>,
) -> Result<Json<Value>> {
    let process_id = state.supervisor.stop(&sandbox_id).await?;
    Ok(Json(json!({
        "success": true,
        "processId": process_id,
        "message": "Application stopped successfully",
    })))
}

pub async fn process_logs(
    State(state): State<AppState>,
    Path(process_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<ProcessLogs>> {
    Ok(Json(
        state
            .supervisor
            .read_logs(&process_id, query.offset)
            .await?,
    ))
}

pub async fn list_processes(State(state): State<AppState>) -> Json<ProcessList> {
    Json(ProcessList {
        processes: state.supervisor.list_processes(),
    })
}

async fn ensure_sandbox(state: &AppState, sandbox_id: &str) -> Result<()> {
    if state.registry.find_sandbox(sandbox_id).await.is_some() {
        return Ok(());
    }
    Err(ManagerError::not_found("Sandbox", sandbox_id))
}

pub async fn create_preview(
    State(state): State<AppState>,
    Path(sandbox_id): Path<String>,
    JsonBody(body): JsonBody<PreviewBody>,
) -> Result<Json<Value>> {
    ensure_sandbox(&state, &sandbox_id).await?;
    let port = body.port.unwrap_or(DEFAULT_PREVIEW_PORT);

    let preview = state.previews.create(&sandbox_id, port)?;
    Ok(Json(json!({
        "instanceId": preview.instance_id,
        "status": "created",
        "port": preview.port,
        "accessUrl": preview.access_url,
    })))
}

pub async fn list_previews(
    State(state): State<AppState>,
    Path(sandbox_id): Path<String>,
) -> Json<Value> {
    let previews = state.previews.list(&sandbox_id);
    Json(json!({
        "sandboxId": sandbox_id,
        "previews": previews,
    }))
}

pub async fn delete_preview(
    State(state): State<AppState>,
    Path((sandbox_id, instance_id)): Path<(String, String)>,
) -> Result<Json<Value>> {
    state.previews.remove(&sandbox_id, &instance_id)?;
    Ok(Json(json!({
        "success": true,
        "message": "Preview closed successfully",
    })))
}

pub async fn reconcile(State(state): State<AppState>) -> Result<Json<ReconcileReport>> {
    Ok(Json(state.reconciler.run().await?))
}
