use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use deadpool_redis::redis::cmd;
use deadpool_redis::{Config, Pool, Runtime};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use regionjoin::checkpoint::{CheckpointStore, FileCheckpointStore};
use regionjoin::clock::SystemClock;
use regionjoin::config::{RegionJoinConfig, SinkKind};
use regionjoin::engine::{supervise, Engine, EngineIo};
use regionjoin::metrics::EngineMetrics;
use regionjoin::shutdown::ShutdownSignal;
use regionjoin::sink::log::LogSink;
use regionjoin::sink::redis::RedisStreamSink;
use regionjoin::sink::OutputSink;
use regionjoin::source::redis::RedisStreamSource;
use regionjoin::RegionDefinition;

#[derive(Clone)]
struct AppState {
    redis_pool: Pool,
    config: Arc<RegionJoinConfig>,
    metrics: Arc<EngineMetrics>,
    instance: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Initialize Logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // 2. Load Configuration
    let config = match RegionJoinConfig::load() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return Err(e.into());
        }
    };

    let instance = format!(
        "{}-{}",
        hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "regionjoin".to_string()),
        &uuid::Uuid::new_v4().to_string()[..8]
    );
    info!(instance = %instance, "Starting regionjoin");

    // 3. Setup Redis Pool
    let pool = Config::from_url(config.redis.url.clone()).create_pool(Some(Runtime::Tokio1))?;

    let seed = Arc::new(load_seed(&config)?);
    let store: Arc<dyn CheckpointStore> = Arc::new(
        FileCheckpointStore::new(&config.checkpoint.dir).with_retain(config.checkpoint.retain),
    );
    let sink: Arc<dyn OutputSink> = match config.streams.output.sink {
        SinkKind::Redis => Arc::new(
            RedisStreamSink::new(pool.clone(), config.output_stream())
                .with_max_len(config.redis.max_len),
        ),
        SinkKind::Log => Arc::new(LogSink::with_prefix(config.output_stream())),
    };
    let metrics = Arc::new(EngineMetrics::new());
    let shutdown = ShutdownSignal::new();

    // 4. HTTP server for health and metrics
    let app_state = Arc::new(AppState {
        redis_pool: pool.clone(),
        config: config.clone(),
        metrics: metrics.clone(),
        instance,
    });
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .with_state(app_state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("regionjoin listening on {}", addr);

    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.triggered().await })
            .await;
        if let Err(e) = result {
            error!(error = %e, "HTTP server failed");
        }
    });

    let signals = shutdown.clone();
    tokio::spawn(async move { signals.listen_for_signals().await });

    // 5. Supervise engine runs until shutdown
    let engine_config = config.engine_config();
    let runs = {
        let config = config.clone();
        let metrics = metrics.clone();
        let shutdown = shutdown.clone();
        move |attempt: u32| {
            let config = config.clone();
            let engine_config = engine_config.clone();
            let pool = pool.clone();
            let sink = sink.clone();
            let store = store.clone();
            let metrics = metrics.clone();
            let seed = seed.clone();
            let shutdown = shutdown.clone();
            async move {
                if attempt > 0 {
                    info!(attempt, "Restarting engine");
                }
                let io = EngineIo {
                    events: Box::new(RedisStreamSource::new(pool.clone(), config.event_stream())),
                    references: Box::new(RedisStreamSource::new(pool, config.reference_stream())),
                    sink,
                    store,
                    clock: Arc::new(SystemClock),
                    metrics,
                };
                let engine = Engine::start(engine_config, io, &seed).await?;
                engine.run(&shutdown).await
            }
        }
    };
    let supervisor = supervise(runs, &shutdown, config.restart_policy(), &metrics);
    tokio::pin!(supervisor);

    let grace = async {
        shutdown.triggered().await;
        tokio::time::sleep(shutdown.timeout()).await;
    };

    let result = tokio::select! {
        result = &mut supervisor => result,
        _ = grace => {
            warn!(timeout_secs = shutdown.timeout().as_secs(), "Engine did not stop in time, exiting without final checkpoint");
            shutdown.trigger();
            let _ = server.await;
            return Ok(());
        }
    };

    shutdown.trigger();
    let _ = server.await;

    match result {
        Ok(report) => {
            info!(
                checkpoint_id = report.last_checkpoint.checkpoint_id,
                emitted = report.metrics.emitted,
                "regionjoin stopped"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Engine stopped on error");
            Err(e.into())
        }
    }
}

/// Definitions to seed the replicas with when there is no checkpoint.
fn load_seed(config: &RegionJoinConfig) -> Result<Vec<RegionDefinition>, Box<dyn std::error::Error>> {
    let Some(path) = &config.engine.seed_file else {
        return Ok(Vec::new());
    };
    let bytes = std::fs::read(path)?;
    let definitions = RegionDefinition::parse_seed(&bytes)?;
    info!(path = %path.display(), definitions = definitions.len(), "Loaded seed definitions");
    Ok(definitions)
}

async fn health_check(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    let mut conn = state.redis_pool.get().await.map_err(|e| {
        error!("Failed to get Redis connection: {}", e);
        StatusCode::SERVICE_UNAVAILABLE
    })?;

    let _: String = cmd("PING").query_async(&mut conn).await.map_err(|e| {
        error!("Redis PING failed: {}", e);
        StatusCode::SERVICE_UNAVAILABLE
    })?;

    let streams = &state.config.streams;
    Ok(Json(json!({
        "status": "ok",
        "redis": "connected",
        "instance": state.instance,
        "streams": {
            "event": { "name": state.config.event_stream(), "region": streams.event.region },
            "reference": {
                "name": state.config.reference_stream(),
                "region": streams.reference.stream.region,
            },
            "output": { "name": state.config.output_stream(), "region": streams.output.stream.region },
        }
    })))
}

/// Engine counters as JSON
async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "instance": state.instance,
        "engine": state.metrics.snapshot(),
    }))
}
