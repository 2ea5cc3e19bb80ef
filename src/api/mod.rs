//! HTTP API and the WebSocket log subscription endpoint.

mod extract;
mod handlers;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Serialize;
use tracing::{error, info};

use crate::broadcast::Broadcaster;
use crate::engine::ContainerEngine;
use crate::error::{ManagerError, Result};
use crate::preview::PreviewRegistry;
use crate::reconcile::ReconciliationJob;
use crate::supervisor::ProcessSupervisor;
use crate::tenant::TenantRegistry;

/// Shared handles every request handler works with.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<dyn ContainerEngine>,
    pub registry: Arc<TenantRegistry>,
    pub supervisor: ProcessSupervisor,
    pub broadcaster: Arc<Broadcaster>,
    pub previews: Arc<PreviewRegistry>,
    pub reconciler: Arc<ReconciliationJob>,
    /// Bearer token required on every route except `/healthz`
    pub auth_token: Option<Arc<str>>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for ManagerError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(error = %self, details = ?self.details(), "Request failed");
        }

        let body = ErrorBody {
            error: self.to_string(),
            details: self.details().map(str::to_string),
        };
        (status, Json(body)).into_response()
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let raw = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = raw.trim().strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then_some(token)
}

pub(crate) fn auth_ok(expected: Option<&str>, headers: &HeaderMap) -> bool {
    match expected {
        None => true,
        Some(expected) => bearer_token(headers) == Some(expected),
    }
}

async fn require_token(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if auth_ok(state.auth_token.as_deref(), request.headers()) {
        next.run(request).await
    } else {
        ManagerError::Unauthorized.into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/tenants", post(handlers::create_tenant).get(handlers::list_tenants))
        .route(
            "/tenants/:tenant_id",
            get(handlers::get_tenant).delete(handlers::delete_tenant),
        )
        .route("/tenants/:tenant_id/plan", put(handlers::update_plan))
        .route("/tenants/:tenant_id/sandboxes", post(handlers::create_sandbox))
        .route(
            "/sandboxes/:sandbox_id/install-and-start",
            post(handlers::install_and_start),
        )
        .route("/sandboxes/:sandbox_id/restart", post(handlers::restart))
        .route("/sandboxes/:sandbox_id/stop", post(handlers::stop))
        .route("/sandboxes/:sandbox_id/preview", post(handlers::create_preview))
        .route(
            "/sandboxes/:sandbox_id/preview/:instance_id",
            delete(handlers::delete_preview),
        )
        .route("/sandboxes/:sandbox_id/previews", get(handlers::list_previews))
        .route("/processes", get(handlers::list_processes))
        .route("/processes/:process_id/logs", get(handlers::process_logs))
        .route("/reconcile", post(handlers::reconcile))
        .route("/ws", get(ws::log_stream))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token))
        .route("/healthz", get(handlers::healthz))
        .with_state(state)
}

/// Bind and serve until the process is interrupted.
pub async fn serve(state: AppState, addr: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Sandbox manager listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request as HttpRequest;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use crate::config::{EngineConfig, PreviewConfig, SupervisorConfig};
    use crate::directory::NoopMirror;
    use crate::engine::fake::FakeEngine;
    use crate::logstore::LogStore;

    pub(crate) struct TestApp {
        pub(crate) state: AppState,
        pub(crate) engine: Arc<FakeEngine>,
        _dir: TempDir,
    }

    pub(crate) fn test_app(auth_token: Option<&str>) -> TestApp {
        let engine = Arc::new(FakeEngine::new());
        let registry = Arc::new(TenantRegistry::new(
            engine.clone(),
            Arc::new(NoopMirror),
            EngineConfig::default(),
        ));
        let dir = TempDir::new().unwrap();
        let broadcaster = Arc::new(Broadcaster::new());
        let supervisor = ProcessSupervisor::new(
            engine.clone(),
            registry.clone(),
            Arc::new(LogStore::new(dir.path())),
            broadcaster.clone(),
            SupervisorConfig {
                grace_period_secs: 1,
                ..SupervisorConfig::default()
            },
        );
        let state = AppState {
            engine: engine.clone(),
            registry: registry.clone(),
            supervisor,
            broadcaster,
            previews: Arc::new(PreviewRegistry::new(PreviewConfig::default())),
            reconciler: Arc::new(ReconciliationJob::new(engine.clone(), registry)),
            auth_token: auth_token.map(Arc::from),
        };
        TestApp {
            state,
            engine,
            _dir: dir,
        }
    }

    async fn call(app: &TestApp, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = HttpRequest::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = router(app.state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_tenant_and_sandbox_flow() {
        let app = test_app(None);

        let (status, body) = call(
            &app,
            "POST",
            "/tenants",
            Some(json!({"tenantId": "t1", "plan": "basic"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tenantId"], "t1");
        assert_eq!(body["podName"], "tenant-t1");
        assert_eq!(body["status"], "created");
        assert_eq!(
            body["resources"],
            json!({"memory": "512m", "cpus": 0.5, "maxSandboxes": 10})
        );

        let (status, _) = call(
            &app,
            "POST",
            "/tenants",
            Some(json!({"tenantId": "t1", "plan": "basic"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = call(
            &app,
            "POST",
            "/tenants/t1/sandboxes",
            Some(json!({"userId": "u1"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "running");
        let sandbox_id = body["sandboxId"].as_str().unwrap().to_string();
        assert!(sandbox_id.starts_with("t1-u1-"));
        assert!(body["containerId"].is_string());

        let (status, body) = call(&app, "GET", "/tenants/t1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["sandboxes"][&sandbox_id].is_object());

        let (status, body) = call(&app, "GET", "/tenants", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tenants"].as_array().unwrap().len(), 1);

        let (status, body) = call(
            &app,
            "PUT",
            "/tenants/t1/plan",
            Some(json!({"plan": "pro"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["resources"]["maxSandboxes"], 20);

        let (status, body) = call(&app, "DELETE", "/tenants/t1?force=true", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Tenant t1 removed successfully");
        assert!(app
            .engine
            .calls()
            .contains(&"pod rm tenant-t1 force=true".to_string()));

        let (status, _) = call(&app, "GET", "/tenants/t1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let app = test_app(None);

        let (status, body) = call(&app, "POST", "/tenants", Some(json!({"plan": "basic"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("tenantId"));

        let (status, _) = call(
            &app,
            "POST",
            "/tenants",
            Some(json!({"tenantId": "t1", "plan": "gold"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &app,
            "POST",
            "/tenants/nobody/sandboxes",
            Some(json!({"userId": "u1"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&app, "GET", "/processes/nope/logs?offset=0", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_malformed_bodies_are_validation_errors() {
        let app = test_app(None);

        let (status, body) = call(&app, "POST", "/tenants", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "tenantId is required");

        let (status, body) = call(&app, "POST", "/tenants", Some(json!({"tenantId": 5}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().starts_with("Invalid JSON body"));

        call(&app, "POST", "/tenants", Some(json!({"tenantId": "t1"}))).await;
        let (status, _) = call(&app, "POST", "/tenants/t1/sandboxes", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = call(&app, "PUT", "/tenants/t1/plan", Some(json!({"plan": 2}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, body) = call(&app, "POST", "/tenants/t1/sandboxes", Some(json!({"userId": "u1"}))).await;
        let sandbox_id = body["sandboxId"].as_str().unwrap().to_string();

        for port in [json!("3000"), json!(70000), json!(-1)] {
            let (status, _) = call(
                &app,
                "POST",
                &format!("/sandboxes/{}/preview", sandbox_id),
                Some(json!({ "port": port.clone() })),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "port {}", port);
        }
        let (_, body) = call(&app, "GET", &format!("/sandboxes/{}/previews", sandbox_id), None).await;
        assert!(body["previews"].as_array().unwrap().is_empty());

        let (status, _) = call(
            &app,
            "POST",
            &format!("/sandboxes/{}/install-and-start", sandbox_id),
            Some(json!({"command": 5})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(app.state.supervisor.list_processes().is_empty());
    }

    #[tokio::test]
    async fn test_empty_preview_body_uses_default_port() {
        let app = test_app(None);
        call(&app, "POST", "/tenants", Some(json!({"tenantId": "t1"}))).await;
        let (_, body) = call(&app, "POST", "/tenants/t1/sandboxes", Some(json!({"userId": "u1"}))).await;
        let sandbox_id = body["sandboxId"].as_str().unwrap().to_string();

        let (status, body) = call(&app, "POST", &format!("/sandboxes/{}/preview", sandbox_id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["port"], 3000);
        assert_eq!(body["status"], "created");
    }

    #[tokio::test]
    async fn test_engine_failure_carries_details() {
        let app = test_app(None);
        app.engine.fail_next("cannot connect to podman socket");
        let (status, body) = call(
            &app,
            "POST",
            "/tenants",
            Some(json!({"tenantId": "t1", "plan": "basic"})),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["details"], "cannot connect to podman socket");
    }

    #[tokio::test]
    async fn test_quota_maps_to_429() {
        let app = test_app(None);
        call(&app, "POST", "/tenants", Some(json!({"tenantId": "t1"}))).await;
        for _ in 0..10 {
            let (status, _) = call(&app, "POST", "/tenants/t1/sandboxes", Some(json!({"userId": "u1"}))).await;
            assert_eq!(status, StatusCode::OK);
        }
        let (status, _) = call(&app, "POST", "/tenants/t1/sandboxes", Some(json!({"userId": "u1"}))).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_install_and_start_then_poll_logs() {
        let app = test_app(None);
        call(&app, "POST", "/tenants", Some(json!({"tenantId": "t1"}))).await;
        let (_, body) = call(&app, "POST", "/tenants/t1/sandboxes", Some(json!({"userId": "u1"}))).await;
        let sandbox_id = body["sandboxId"].as_str().unwrap().to_string();

        let (status, body) = call(
            &app,
            "POST",
            &format!("/sandboxes/{}/install-and-start", sandbox_id),
            Some(json!({"command": "echo hi", "install": false})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["sandboxId"], sandbox_id.as_str());
        let process_id = body["processId"].as_str().unwrap().to_string();

        let mut offset = 0;
        let mut logs = String::new();
        let mut finished = false;
        for _ in 0..250 {
            let (status, body) = call(
                &app,
                "GET",
                &format!("/processes/{}/logs?offset={}", process_id, offset),
                None,
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            logs.push_str(body["logs"].as_str().unwrap());
            offset = body["nextOffset"].as_u64().unwrap();
            if body["status"] == "completed" {
                finished = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(finished);

        let (_, body) = call(
            &app,
            "GET",
            &format!("/processes/{}/logs?offset={}", process_id, offset),
            None,
        )
        .await;
        logs.push_str(body["logs"].as_str().unwrap());
        assert!(logs.contains("hi\n"));

        let (_, body) = call(&app, "GET", "/processes", None).await;
        assert_eq!(body["processes"][0]["processId"], process_id.as_str());

        let (status, _) = call(&app, "POST", &format!("/sandboxes/{}/stop", sandbox_id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_previews() {
        let app = test_app(None);
        call(&app, "POST", "/tenants", Some(json!({"tenantId": "t1"}))).await;
        let (_, body) = call(&app, "POST", "/tenants/t1/sandboxes", Some(json!({"userId": "u1"}))).await;
        let sandbox_id = body["sandboxId"].as_str().unwrap().to_string();

        let (status, body) = call(
            &app,
            "POST",
            &format!("/sandboxes/{}/preview", sandbox_id),
            Some(json!({"port": 8080})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["accessUrl"], "http://localhost:8080");
        let instance_id = body["instanceId"].as_str().unwrap().to_string();

        let (status, _) = call(
            &app,
            "POST",
            &format!("/sandboxes/{}/preview", sandbox_id),
            Some(json!({"port": 22})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, body) = call(&app, "GET", &format!("/sandboxes/{}/previews", sandbox_id), None).await;
        assert_eq!(body["previews"].as_array().unwrap().len(), 1);

        let (status, _) = call(
            &app,
            "DELETE",
            &format!("/sandboxes/{}/preview/{}", sandbox_id, instance_id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_bearer_token_is_enforced() {
        let app = test_app(Some("s3cret"));

        let (status, _) = call(&app, "GET", "/tenants", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = call(&app, "GET", "/healthz", None).await;
        assert_eq!(status, StatusCode::OK);

        let request = HttpRequest::builder()
            .uri("/tenants")
            .header(header::AUTHORIZATION, "Bearer s3cret")
            .body(Body::empty())
            .unwrap();
        let response = router(app.state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_auth_ok() {
        let mut headers = HeaderMap::new();
        assert!(auth_ok(None, &headers));
        assert!(!auth_ok(Some("t"), &headers));
        headers.insert(header::AUTHORIZATION, "Bearer t".parse().unwrap());
        assert!(auth_ok(Some("t"), &headers));
        headers.insert(header::AUTHORIZATION, "Bearer other".parse().unwrap());
        assert!(!auth_ok(Some("t"), &headers));
    }

    #[tokio::test]
    async fn test_reconcile_endpoint() {
        let app = test_app(None);
        app.engine.add_pod("tenant-acme");
        let (status, body) = call(&app, "POST", "/reconcile", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tenants"], json!(["acme"]));
        assert_eq!(body["totalSandboxes"], 0);
    }
}
