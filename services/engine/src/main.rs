use std::env;
use std::sync::Arc;

use engine::http::HttpState;
use engine::store::postgres::{create_pool, run_migrations, PostgresMetadataStore};
use engine::{blob_store::FsBlobStore, config, device_monitor::DeviceMonitor, scheduler::Scheduler, Engine};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_owned());
    let dataset_base_dir = env::var("DATASET_BASE_DIR").unwrap_or_else(|_| "/var/lib/transmission-engine/datasets".to_owned());

    let cfg = config::load_config().unwrap_or_else(|e| {
        eprintln!("FATAL: failed to load config: {e}");
        std::process::exit(1);
    });
    info!(tick_ms = cfg.scheduler_tick_interval_ms, max_concurrent = cfg.max_concurrent_transmissions, "config loaded");

    info!("connecting to database...");
    let pool = create_pool(&database_url).await.unwrap_or_else(|e| {
        eprintln!("FATAL: failed to connect to database: {e}");
        std::process::exit(1);
    });
    run_migrations(&pool).await.unwrap_or_else(|e| {
        eprintln!("FATAL: failed to run migrations: {e}");
        std::process::exit(1);
    });
    info!("migrations applied");

    let store: Arc<dyn engine::store::MetadataStore> = Arc::new(PostgresMetadataStore::new(pool));
    let blobs: Arc<dyn engine::blob_store::BlobStore> = Arc::new(FsBlobStore::new(dataset_base_dir));

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    let engine = Engine::new(cfg, store, blobs);

    let scheduler = Arc::new(Scheduler::new(engine.clone()));
    let scheduler_handle = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run().await })
    };

    let monitor = DeviceMonitor::new(engine.clone());
    let monitor_handle = tokio::spawn(async move { monitor.run().await });

    let pool_health_handle = {
        let pool = engine.pool.clone();
        tokio::spawn(async move { pool.run_health_check_loop().await })
    };

    let http_state = HttpState {
        engine: engine.clone(),
        prometheus,
    };
    let router = engine::http::build_router(http_state);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await.unwrap_or_else(|e| {
        eprintln!("FATAL: failed to bind {bind_addr}: {e}");
        std::process::exit(1);
    });
    info!(addr = %bind_addr, "transmission engine listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("http server error");

    info!("shutdown signal received, draining in-flight dispatches");
    monitor_handle.abort();
    pool_health_handle.abort();
    scheduler.stop().await;
    scheduler_handle.abort();
    engine.shutdown().await;
    info!("transmission engine shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
