//! Drain the processing queue: claim jobs, run the pipeline, record the
//! outcome, and sweep terminal jobs periodically.

use std::future::ready;
use std::sync::Arc;
use std::time;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;
use tokio::sync::watch;
use tracing::info;

use clip_common::backoff::PollBackoff;
use clip_common::cache::PgCacheStore;
use clip_common::frames::FfmpegFrameExtractor;
use clip_common::health::HealthRegistry;
use clip_common::metrics::{serve, setup_metrics_routes};
use clip_common::pipeline::Pipeline;
use clip_common::queue::PgJobStore;
use clip_common::remote::{RemoteAnalyzer, RemoteMediaFetcher};
use clip_worker::config::Config;
use clip_worker::worker::{ClipWorker, WorkerSettings};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let worker_id = format!(
        "worker-{}-{}",
        gethostname::gethostname().to_string_lossy(),
        std::process::id()
    );

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness
        .register("worker".to_string(), ::time::Duration::seconds(60))
        .await;

    let cache = Arc::new(
        PgCacheStore::new(
            &config.database_url,
            config.max_pg_connections,
            config.cache_ttl_hours,
        )
        .await
        .expect("failed to initialize cache store"),
    );
    let jobs = Arc::new(
        PgJobStore::new(
            &config.database_url,
            config.max_pg_connections,
            config.max_attempts,
        )
        .await
        .expect("failed to initialize job store"),
    );

    let pipeline = Arc::new(Pipeline::new(
        Arc::new(RemoteMediaFetcher::new(
            &config.scraper_base_url,
            config.remote_timeout.0,
        )),
        Arc::new(RemoteAnalyzer::new(
            &config.analyzer_base_url,
            config.remote_timeout.0,
        )),
        Arc::new(FfmpegFrameExtractor::new(&config.ffmpeg_path)),
        cache.clone(),
        &worker_id,
    ));

    let worker = ClipWorker::new(
        &worker_id,
        jobs,
        cache,
        pipeline,
        WorkerSettings {
            max_concurrent_jobs: config.max_concurrent_jobs,
            backoff: PollBackoff::new(config.poll_interval.0, config.poll_max_backoff.0),
            cleanup_interval: time::Duration::from_secs(config.cleanup_interval_hours * 3600),
            cleanup_retention_days: config.cleanup_retention_days,
            cleanup_batch_size: config.cleanup_batch_size,
            shutdown_timeout: config.shutdown_timeout.0,
        },
        worker_liveness,
    );

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let router = setup_metrics_routes(router);
    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received, draining worker");
        shutdown_tx.send(true).ok();
    });

    worker.run(shutdown_rx).await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler")
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

pub async fn index() -> &'static str {
    "clip worker"
}
