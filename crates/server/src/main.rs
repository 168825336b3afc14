use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gradeflow_core::{
    create_event_system, load_config, validate_config, EngineEvent, EventStore, Executor,
    ExecutorBackend, HttpExecutor, ProgressAggregator, Scheduler, SqliteEventStore,
    SqliteWorkStore, WorkController, WorkStore,
};
use gradeflow_server::api::create_router;
use gradeflow_server::state::AppState;

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long shutdown waits for the event writer to drain
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::var("GRADEFLOW_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.toml"));

    info!("Loading configuration from {:?}", config_path);
    let config = load_config(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    validate_config(&config).context("Configuration validation failed")?;

    info!("Configuration loaded successfully");
    info!("Database path: {:?}", config.database.path);

    // Config hash for the event log
    let config_json = serde_json::to_string(&config).unwrap_or_default();
    let config_hash = format!("{:x}", Sha256::digest(config_json.as_bytes()));
    let config_hash_short = &config_hash[..16];

    let store: Arc<dyn WorkStore> = Arc::new(
        SqliteWorkStore::new(&config.database.path).context("Failed to create work store")?,
    );
    info!("Work store initialized");

    let event_store: Arc<dyn EventStore> = Arc::new(
        SqliteEventStore::new(&config.database.path).context("Failed to create event store")?,
    );
    info!("Event store initialized");

    let (event_handle, event_writer) =
        create_event_system(Arc::clone(&event_store), config.database.event_buffer);
    let writer_handle = tokio::spawn(event_writer.run());

    event_handle
        .emit(EngineEvent::ServiceStarted {
            version: VERSION.to_string(),
            config_hash: config_hash_short.to_string(),
        })
        .await;

    let executor: Arc<dyn Executor> = match config.executor.backend {
        ExecutorBackend::Http => {
            let http_config = config
                .executor
                .http
                .clone()
                .context("http executor selected but no [executor.http] section provided")?;
            info!("Using HTTP executor at {}", http_config.url);
            Arc::new(HttpExecutor::new(http_config).context("Failed to build HTTP executor")?)
        }
    };

    let aggregator = Arc::new(ProgressAggregator::new(
        Arc::clone(&store),
        event_handle.clone(),
    ));

    let scheduler = Arc::new(Scheduler::new(
        config.scheduler.clone(),
        Arc::clone(&store),
        executor,
        Arc::clone(&aggregator),
        event_handle.clone(),
    ));

    if config.scheduler.enabled {
        scheduler
            .start()
            .await
            .context("Failed to start scheduler")?;
        info!("Scheduler started");
    } else {
        info!("Scheduler disabled in config");
    }

    let controller = WorkController::new(
        Arc::clone(&store),
        aggregator,
        Arc::clone(&scheduler),
        event_handle.clone(),
        config.retry,
    );

    let state = Arc::new(AppState::new(
        config.clone(),
        store,
        event_store,
        event_handle.clone(),
        Arc::clone(&scheduler),
        controller,
    ));

    let app = create_router(state);

    let addr = SocketAddr::new(config.server.host, config.server.port);
    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutting down...");
    if scheduler.is_running() {
        scheduler.stop().await;
        info!("Scheduler stopped");
    }

    event_handle
        .emit(EngineEvent::ServiceStopped {
            reason: "graceful_shutdown".to_string(),
        })
        .await;

    // The writer exits once every EventHandle clone is gone; in-flight
    // executions may still hold one, so bound the wait.
    drop(scheduler);
    drop(event_handle);
    match tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer_handle).await {
        Ok(_) => info!("Event writer stopped"),
        Err(_) => warn!("Event writer did not drain within {:?}", WRITER_DRAIN_TIMEOUT),
    }

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
