use std::sync::Arc;

use claw_swarm::api::{AppState, swarm_routes};
use claw_swarm::config::SwarmConfig;
use claw_swarm::store::{Database, LibSqlBackend};
use claw_swarm::swarm::reclaim;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = SwarmConfig::from_env()?;

    eprintln!("🐝 Claw Swarm v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://0.0.0.0:{}/api/v1", config.port);
    eprintln!(
        "   Batches: min {}, target {}, max {}",
        config.aggregation.min_items_to_aggregate,
        config.aggregation.target_items_to_aggregate,
        config.aggregation.max_items_to_aggregate,
    );

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&config.db_path).await?);
    eprintln!("   Database: {}", config.db_path.display());

    // ── Lease reclaimer ──────────────────────────────────────────────────
    let _reclaim_handle = match config.task_lease {
        Some(lease) => {
            eprintln!("   Task lease: {}s", lease.as_secs());
            Some(reclaim::spawn_reclaim_task(Arc::clone(&db), lease))
        }
        None => {
            eprintln!("   Task lease: disabled");
            None
        }
    };

    // ── HTTP ─────────────────────────────────────────────────────────────
    let port = config.port;
    let app = swarm_routes(AppState::new(db, config));
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    tracing::info!(port, "Swarm API server started");
    axum::serve(listener, app).await?;

    Ok(())
}
