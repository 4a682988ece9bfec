use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde_json::json;

use agency::api::{self, AppState};
use agency::broadcast::Hub;
use agency::cli::{Cli, Commands};
use agency::config;
use agency::model::{NewEvent, kind};
use agency::orchestration::manager::{AgentManager, ManagerSettings};
use agency::orchestration::process::PtySpawner;
use agency::store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = config::load_config(&cli)?;
    tracing::info!(
        agency_dir = %config.agency_dir.display(),
        data_dir = %config.data_dir.display(),
        projects_dir = %config.projects_dir.display(),
        "Config loaded"
    );

    match cli.command {
        Commands::Init { .. } => {
            let written = config::scaffold(&config)?;
            println!(
                "Initialized {} ({} role definition(s) written)",
                config.agency_dir.display(),
                written.len()
            );
            for path in written {
                println!("  {}", path.display());
            }
        }
        Commands::Serve { .. } => {
            // 1. Store and roster.
            let store = Store::open(&config.database_path())
                .with_context(|| format!("Failed to open {}", config.database_path().display()))?;
            let added = store.agents().seed(&config.roster)?;
            if added > 0 {
                tracing::info!(added, "seeded agent roster");
            }
            std::fs::create_dir_all(&config.projects_dir).with_context(|| {
                format!("Failed to create {}", config.projects_dir.display())
            })?;

            // 2. Hub and manager.
            let hub = Hub::new(store);
            let manager = AgentManager::new(
                ManagerSettings::from(&config),
                hub.clone(),
                Arc::new(PtySpawner),
            );
            hub.record(
                NewEvent::new(kind::SYSTEM_STARTUP)
                    .data(json!({ "host": config.host, "port": config.port }))
                    .message("Agency server started"),
            )?;

            // 3. Optional auto-orchestration.
            if config.auto_orchestrate {
                manager.enable_auto_orchestration(Some(Duration::from_millis(
                    config.orchestration_interval_ms,
                )));
            }

            // 4. Serve until Ctrl-C, then stop every agent.
            let addr = format!("{}:{}", config.host, config.port);
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .with_context(|| format!("Failed to bind {addr}"))?;
            tracing::info!(%addr, "listening");

            let state = AppState::new(hub, manager.clone());
            api::serve(listener, state, async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("Failed to listen for Ctrl-C: {}", e);
                    std::future::pending::<()>().await;
                }
                tracing::info!("shutdown requested");
            })
            .await?;

            manager.stop_all().await;
        }
    }

    Ok(())
}
