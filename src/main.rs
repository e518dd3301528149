//! pgcache - Coordinated maintenance for a PostgreSQL-backed distributed cache
//!
//! Runs the leader election loop, the expired-item maintenance task and the
//! read-only inspection API.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pgcache::api::{create_router, AppState};
use pgcache::cache::PgExpiredItemRemover;
use pgcache::config::Config;
use pgcache::leadership::{spawn_event_logger, spawn_leader_elector, LeaderElector, LeadershipState};
use pgcache::lock::PgAdvisoryLock;
use pgcache::tasks::{spawn_maintenance_task, MaintenanceGate, MaintenanceScheduler};

/// Main entry point for the cache coordinator.
///
/// # Startup Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Load and validate configuration from environment variables
/// 3. Connect the maintenance pool to Postgres
/// 4. Start the leader elector (when coordination is enabled)
/// 5. Start the expired-item maintenance task
/// 6. Serve the inspection API on the configured port
/// 7. On SIGINT/SIGTERM, stop the background tasks, releasing the lock if held
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "info" level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pgcache=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting pgcache coordinator");

    let config = Config::from_env();
    config.validate()?;
    let database_url = config
        .database_url
        .clone()
        .context("DATABASE_URL must be set")?;
    let lock_key = config.lock_key();
    info!(
        instance_id = %config.instance_id,
        table = %format!("{}.{}", config.schema_name, config.table_name),
        lock_key,
        coordination_enabled = config.coordination_enabled,
        cleanup_interval_s = config.maintenance.interval.as_secs(),
        batch_size = config.maintenance.batch_size,
        "Configuration loaded"
    );

    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&database_url)
        .await
        .context("connecting maintenance pool")?;
    let remover = PgExpiredItemRemover::new(pool, &config.schema_name, &config.table_name)?;

    let cancel = CancellationToken::new();
    let leadership = Arc::new(LeadershipState::new(config.instance_id.clone()));
    // Outlives the shutdown token so the elector's final transition is logged
    let logger_cancel = CancellationToken::new();
    let event_logger = spawn_event_logger(leadership.subscribe(), logger_cancel.clone());

    let (gate, elector_handle) = if config.coordination_enabled {
        let provider = PgAdvisoryLock::from_url(&database_url, config.election.acquire_timeout)?;
        let elector = Arc::new(LeaderElector::new(
            leadership.clone(),
            Arc::new(provider),
            lock_key,
            config.election.clone(),
        ));
        let handle = spawn_leader_elector(elector, cancel.clone());
        info!("Leader elector started");
        (MaintenanceGate::Leadership(leadership.clone()), Some(handle))
    } else {
        warn!("Coordination disabled: every instance runs expired-item cleanup");
        (MaintenanceGate::Uncoordinated, None)
    };

    let scheduler = Arc::new(MaintenanceScheduler::new(
        gate,
        Arc::new(remover),
        config.maintenance.clone(),
    ));
    let maintenance_handle = spawn_maintenance_task(scheduler, cancel.clone());
    info!("Background maintenance task started");

    let app = create_router(AppState::new(
        leadership.clone(),
        config.coordination_enabled,
    ));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("Inspection API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await
        .context("serving inspection API")?;

    // The elector releases the advisory lock on its way out
    if let Some(handle) = elector_handle {
        if let Err(e) = handle.await {
            warn!(error = %e, "Leader elector task ended abnormally");
        }
    }
    if let Err(e) = maintenance_handle.await {
        warn!(error = %e, "Maintenance task ended abnormally");
    }
    leadership.dispose();
    logger_cancel.cancel();
    let _ = event_logger.await;

    info!("Coordinator shutdown complete");
    Ok(())
}

/// Waits for shutdown signal (Ctrl+C or SIGTERM), then cancels background tasks.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    cancel.cancel();
}
