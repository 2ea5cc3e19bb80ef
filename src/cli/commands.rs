use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use crate::api::{self, AppState};
use crate::broadcast::Broadcaster;
use crate::cli::args::{ConfigAction, ConfigArgs, InitArgs, OutputFormat, ServeArgs};
use crate::config::loader::get_config_path;
use crate::config::types::ManagerConfig;
use crate::directory::create_mirror;
use crate::engine::{ContainerEngine, PodmanEngine};
use crate::error::{ManagerError, Result};
use crate::logstore::LogStore;
use crate::preview::PreviewRegistry;
use crate::reconcile::{ReconcileReport, ReconciliationJob};
use crate::supervisor::{spawn_retention_sweeper, ProcessSupervisor};
use crate::tenant::TenantRegistry;

// ============================================================================
// Server Commands
// ============================================================================

/// Run the API server until interrupted
pub async fn serve(args: ServeArgs, config: ManagerConfig) -> Result<()> {
    let bind = args.bind.unwrap_or_else(|| config.server.bind.clone());
    let port = args.port.unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{}:{}", bind, port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", bind, port))?;

    let auth_token = args
        .auth_token
        .or_else(|| config.server.auth_token.clone())
        .filter(|t| !t.is_empty());
    if auth_token.is_none() {
        warn!("No auth token configured; the API accepts unauthenticated requests");
    }

    let podman = PodmanEngine::new(&config.engine);
    if !podman.is_available().await {
        warn!(binary = %config.engine.binary, "Container engine is not responding");
    }

    let state = build_state(&config, Arc::new(podman), auth_token)?;

    if !args.no_reconcile {
        match state.reconciler.run().await {
            Ok(report) => info!(
                tenants = report.tenants.len(),
                sandboxes = report.total_sandboxes,
                "Startup reconciliation complete"
            ),
            Err(e) => warn!(error = %e, "Startup reconciliation failed"),
        }
    }

    let sweeper = spawn_retention_sweeper(state.supervisor.clone(), config.logs.retention.clone());
    let result = api::serve(state, addr).await;
    sweeper.abort();
    result
}

/// Run a single reconciliation pass and report what was adopted
pub async fn reconcile(config: ManagerConfig, format: OutputFormat) -> Result<()> {
    let engine = Arc::new(PodmanEngine::new(&config.engine));
    let state = build_state(&config, engine, None)?;
    let report = state.reconciler.run().await?;
    output_report(&report, format)
}

// ============================================================================
// Config Commands
// ============================================================================

pub async fn init(args: InitArgs) -> Result<()> {
    let config_path = get_config_path();

    if config_path.exists() && !args.force {
        println!("Configuration already exists at: {}", config_path.display());
        println!("Use --force to overwrite");
        return Ok(());
    }

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let toml_str = toml::to_string_pretty(&ManagerConfig::default())
        .map_err(|e| ManagerError::Config(e.to_string()))?;
    std::fs::write(&config_path, toml_str)?;

    println!("Created configuration at: {}", config_path.display());
    println!("\nQuick start:");
    println!("  # Start the API on the configured port");
    println!("  sandbox-manager serve");
    println!();
    println!("  # Adopt existing tenant pods without serving");
    println!("  sandbox-manager reconcile");

    Ok(())
}

pub async fn config(args: ConfigArgs, config: ManagerConfig) -> Result<()> {
    match args.action {
        ConfigAction::Show => {
            let toml_str = toml::to_string_pretty(&config)
                .map_err(|e| ManagerError::Config(e.to_string()))?;
            println!("{}", toml_str);
        }
        ConfigAction::Path => {
            println!("{}", get_config_path().display());
        }
    }
    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Wire every component around a single engine handle.
pub fn build_state(
    config: &ManagerConfig,
    engine: Arc<dyn ContainerEngine>,
    auth_token: Option<String>,
) -> Result<AppState> {
    let mirror = create_mirror(&config.directory)?;
    let registry = Arc::new(TenantRegistry::new(
        engine.clone(),
        mirror,
        config.engine.clone(),
    ));
    let broadcaster = Arc::new(Broadcaster::new());
    let logs = Arc::new(LogStore::new(config.logs.dir.clone()));
    let supervisor = ProcessSupervisor::new(
        engine.clone(),
        registry.clone(),
        logs,
        broadcaster.clone(),
        config.supervisor.clone(),
    );
    let reconciler = Arc::new(ReconciliationJob::new(engine.clone(), registry.clone()));

    Ok(AppState {
        engine,
        registry,
        supervisor,
        broadcaster,
        previews: Arc::new(PreviewRegistry::new(config.preview.clone())),
        reconciler,
        auth_token: auth_token.map(Arc::from),
    })
}

fn output_report(report: &ReconcileReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            println!("Scanned {} pod(s)", report.pods_scanned);
            println!(
                "Adopted {} tenant(s), {} sandbox(es)",
                report.tenants_adopted.len(),
                report.sandboxes_adopted.len()
            );
            for tenant in &report.tenants_adopted {
                println!("  + tenant {}", tenant);
            }
            for sandbox in &report.sandboxes_adopted {
                println!("  + sandbox {}", sandbox);
            }
            println!(
                "Tracking {} tenant(s) with {} sandbox(es)",
                report.tenants.len(),
                report.total_sandboxes
            );
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(report)?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::FakeEngine;
    use crate::engine::ContainerState;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_build_state_shares_one_registry() {
        let dir = TempDir::new().unwrap();
        let mut config = ManagerConfig::default();
        config.logs.dir = dir.path().join("logs");

        let engine = Arc::new(FakeEngine::new());
        engine.add_pod("tenant-acme");
        engine.add_container("tenant-acme", "acme-bob-1", ContainerState::Running);

        let state = build_state(&config, engine, Some("secret".into())).unwrap();
        assert_eq!(state.auth_token.as_deref(), Some("secret"));

        let report = state.reconciler.run().await.unwrap();
        assert_eq!(report.tenants_adopted, vec!["acme"]);
        assert!(state.registry.find_sandbox("acme-bob-1").await.is_some());
    }
}
