//! Activa Sync Binary Entry Point
//!
//! Runs capture, sync, maintenance and the presenter API in one process.
//! Core functionality is provided by the `activa_sync` library crate.

use std::net::SocketAddr;
use std::sync::Arc;

use activa_sync::{
    CaptureScheduler, Clock, ErrorSink, Event, EventRecorder, EventSeverity, HttpReadingSource,
    HttpTransport, MaintenanceScheduler, NetworkSignal, RetentionTask, Schedule, StorageBuilder,
    SyncEngine, SystemClock,
    config::AppConfig,
    server::{AppState, create_router},
};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Activa Sync - offline-resilient telemetry for the Activa dashboard
#[derive(Parser, Debug)]
#[command(name = "activa-sync", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        default_value = "configs/config.yaml",
        env = "ACTIVA_CONFIG"
    )]
    config: String,

    /// Server bind address (overrides config file)
    #[arg(long, env = "ACTIVA_SERVER_BIND")]
    server_bind: Option<String>,

    /// Server port (overrides config file)
    #[arg(long, env = "ACTIVA_SERVER_PORT")]
    server_port: Option<u16>,

    /// Database file path (overrides config file)
    #[arg(long, env = "ACTIVA_DB_PATH")]
    db_path: Option<String>,

    /// Remote sync endpoint (overrides config file)
    #[arg(long, env = "ACTIVA_SYNC_ENDPOINT")]
    sync_endpoint: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,activa_sync=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Activa Sync - offline-resilient telemetry");

    let cli = Cli::parse();

    tracing::info!(path = %cli.config, "Loading configuration");
    let mut config = AppConfig::load(&cli.config)?;

    // CLI > ENV > config file
    if let Some(bind) = cli.server_bind {
        config.server.bind = bind;
    }
    if let Some(port) = cli.server_port {
        config.server.port = port;
    }
    if let Some(path) = cli.db_path {
        config.database.path = path;
    }
    if let Some(endpoint) = cli.sync_endpoint {
        config.set_sync_endpoint(&endpoint);
    }
    config.validate()?;

    tracing::info!(
        db = %config.database.path,
        capacity = config.database.capacity,
        endpoint = %config.sync.endpoint,
        device_id = %config.sync.engine.device_id,
        "Configuration loaded"
    );

    // Storage
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let handles = StorageBuilder::new(&config.database.path)
        .capacity(config.database.capacity)
        .channel_capacity(config.database.channel_capacity)
        .build()
        .await?;
    tracing::info!("Storage initialized");

    let sink: Arc<dyn ErrorSink> = Arc::new(EventRecorder::new(handles.buffer.clone()));
    sink.report(Event::system(EventSeverity::Info, "Service started"));

    let shutdown = CancellationToken::new();
    let mut tasks = Vec::new();

    // Capture
    if config.capture.enabled {
        let source = HttpReadingSource::new(config.capture.source.clone())?;
        let scheduler = CaptureScheduler::new(
            config.capture.schedule.clone(),
            Arc::new(source),
            handles.buffer.clone(),
            Arc::clone(&sink),
            Arc::clone(&clock),
        );
        tasks.push(tokio::spawn(scheduler.run(shutdown.clone())));
    } else {
        tracing::info!("Capture disabled");
    }

    // Sync
    let transport = HttpTransport::new(config.sync.transport())?;
    let engine = SyncEngine::new(
        config.sync.engine.clone(),
        handles.buffer.clone(),
        Arc::new(transport),
        Arc::clone(&sink),
        Arc::clone(&clock),
    );
    let sync_status = engine.subscribe();
    let network = NetworkSignal::new();
    tasks.push(tokio::spawn(engine.run(network.clone(), shutdown.clone())));

    // Maintenance
    let maintenance = MaintenanceScheduler::new(Arc::clone(&sink)).await?;
    let retention = RetentionTask::new(
        config.retention.clone(),
        handles.admin.clone(),
        Arc::clone(&sink),
    );
    maintenance
        .add_retention(retention, Schedule::cron(&config.retention.schedule)?)
        .await?;
    maintenance.start().await?;

    tokio::spawn(watch_signals(shutdown.clone(), network));

    // Presenter API
    if config.server.enabled {
        let app = create_router(AppState {
            buffer_reader: handles.buffer_reader.clone(),
            event_reader: handles.event_reader.clone(),
            dashboard: handles.dashboard.clone(),
            sync_status,
            clock: Arc::clone(&clock),
        });

        let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Web server listening on: http://{}", addr);
        tracing::info!("Press Ctrl+C to shutdown");

        let token = shutdown.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await?;
    } else {
        tracing::info!("Presenter API disabled; press Ctrl+C to shutdown");
        shutdown.cancelled().await;
    }

    tracing::info!("Stopping capture and sync...");
    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Pipeline task panicked");
        }
    }

    tracing::info!("Shutting down maintenance scheduler...");
    if let Err(e) = maintenance.shutdown().await {
        tracing::error!(error = %e, "Failed to shutdown maintenance scheduler");
    }

    sink.report(Event::system(EventSeverity::Info, "Service stopping"));

    tracing::info!("Shutting down storage...");
    if let Err(e) = handles.shutdown().await {
        tracing::error!(error = %e, "Failed to shutdown storage");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Cancel `shutdown` on Ctrl+C or SIGTERM. On unix, SIGUSR1 wakes the sync
/// engine (e.g. from a network dispatcher hook when connectivity returns).
async fn watch_signals(shutdown: CancellationToken, network: NetworkSignal) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    #[cfg(unix)]
    let network_up = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::user_defined1()) {
            Ok(mut sig) => {
                while sig.recv().await.is_some() {
                    tracing::info!("Received SIGUSR1, triggering sync");
                    network.notify();
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to install SIGUSR1 handler"),
        }
        std::future::pending::<()>().await;
    };

    #[cfg(not(unix))]
    let network_up = {
        let _ = network;
        std::future::pending::<()>()
    };

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal");
        }
        _ = network_up => {}
    }

    shutdown.cancel();
}
