//! Hybrid ingest service: serve cached results, process inline when a
//! direct slot is free, enqueue for the worker pool otherwise.

use std::future::ready;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;
use eyre::Result;

use clip_common::cache::PgCacheStore;
use clip_common::frames::FfmpegFrameExtractor;
use clip_common::health::HealthRegistry;
use clip_common::metrics::setup_metrics_routes;
use clip_common::pipeline::Pipeline;
use clip_common::queue::PgJobStore;
use clip_common::remote::{RemoteAnalyzer, RemoteMediaFetcher};
use clip_dispatcher::config::Config;
use clip_dispatcher::dispatch::Dispatcher;
use clip_dispatcher::handlers;

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let liveness = HealthRegistry::new("liveness");
    let admission_liveness = liveness
        .register("admission".to_string(), ::time::Duration::seconds(60))
        .await;
    // The dispatcher has no scheduler loop of its own, so a heartbeat
    // task keeps the admission component from going stale.
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(15));
        loop {
            interval.tick().await;
            admission_liveness.report_healthy().await;
        }
    });

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

    let processor_id = format!("dispatcher-{}", std::process::id());
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
        &processor_id,
    ));

    let dispatcher = Arc::new(Dispatcher::new(
        cache,
        jobs,
        pipeline,
        config.max_direct_processing,
        config.direct_timeout.0,
    ));

    let app = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let app = handlers::add_routes(app, dispatcher);
    let app = setup_metrics_routes(app);

    match listen(app, config.bind()).await {
        Ok(_) => {}
        Err(e) => tracing::error!("failed to start clip-dispatcher http server, {}", e),
    }
}

pub async fn index() -> &'static str {
    "clip dispatcher"
}
