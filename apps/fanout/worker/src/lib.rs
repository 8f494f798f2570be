//! Fan-out Worker Service
//!
//! Runs `WORKER_CONCURRENCY` worker loops against the Redis stores and serves
//! the ingress, status and dead-letter admin API on the same process.
//!
//! ## Architecture
//!
//! ```text
//! POST /notifications
//!   ↓
//! NotificationService ── job record + ready list (Redis)
//!   ↓
//! Worker loops (N per process, any number of processes)
//!   ↓ claim → fan out → decide
//! succeeded | retry_scheduled (delayed zset) | dead_lettered (DLQ stream)
//! ```
//!
//! ## Features
//!
//! - Atomic claims, safe with any number of workers
//! - Exponential backoff between attempts
//! - Claim leases so jobs of a crashed worker are recovered
//! - Graceful shutdown: loops finish their current job before exiting

use axum::Router;
use core_config::{Environment, FromEnv, redis::RedisConfig, server::ServerConfig};
use domain_notifications::{
    DeadLetterInspector, FanOutExecutor, JobDefaults, JobStore, NotificationService,
    PipelineConfig, QueueStore, RedisJobStore, RedisQueueStore, SimulatedDeliverer,
    SimulatedDelivererConfig, SystemClock, Worker, WorkerConfig, handlers, metrics,
};
use eyre::{Result, WrapErr};
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{Level, error, info, warn};

const CONNECT_ATTEMPTS: u32 = 5;

/// Run the fan-out worker
///
/// 1. Sets up error reports, structured logging and Prometheus metrics
/// 2. Loads configuration from the environment
/// 3. Connects to Redis
/// 4. Starts the worker loops and the HTTP server
/// 5. On SIGINT/SIGTERM, stops accepting requests and waits for the loops
///
/// # Errors
///
/// Returns an error if configuration is invalid, Redis is unreachable, the
/// HTTP listener cannot bind, or a worker loop fails fatally.
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);
    metrics::init_metrics();

    let name = env!("CARGO_PKG_NAME");
    let version = env!("CARGO_PKG_VERSION");
    info!(name, version, environment = ?environment, "Starting fan-out worker service");

    let server_config = ServerConfig::from_env().wrap_err("Failed to load server configuration")?;
    let redis_config = RedisConfig::from_env().wrap_err("Failed to load Redis configuration")?;
    let pipeline = PipelineConfig::from_env().wrap_err("Failed to load pipeline configuration")?;
    let worker_config = WorkerConfig::from_env().wrap_err("Failed to load worker configuration")?;
    let deliverer_config = SimulatedDelivererConfig::from_env()
        .wrap_err("Failed to load deliverer configuration")?;

    info!(
        key_prefix = %pipeline.key_prefix,
        default_max_retries = pipeline.default_max_retries,
        dispatch = ?pipeline.dispatch,
        concurrency = worker_config.concurrency,
        lease_ms = worker_config.lease.map(|l| l.as_millis() as u64),
        heartbeat_ms = worker_config.heartbeat_interval().map(|h| h.as_millis() as u64),
        "Configuration loaded"
    );

    info!("Connecting to Redis...");
    let redis = connect_with_retry(&redis_config.uri)
        .await
        .wrap_err("Failed to connect to Redis")?;
    info!("Connected to Redis successfully");

    let jobs: Arc<dyn JobStore> = Arc::new(RedisJobStore::new(redis.clone(), &pipeline.key_prefix));
    let queue: Arc<dyn QueueStore> = Arc::new(RedisQueueStore::new(redis, &pipeline.key_prefix));
    let clock = Arc::new(SystemClock);

    let executor = Arc::new(
        FanOutExecutor::new(Arc::new(SimulatedDeliverer::new(deliverer_config)))
            .with_mode(pipeline.dispatch)
            .with_delivery_timeout(pipeline.delivery_timeout),
    );

    let service = NotificationService::new(
        jobs.clone(),
        queue.clone(),
        clock.clone(),
        JobDefaults::from(&pipeline),
    );
    let inspector = DeadLetterInspector::new(queue.clone(), service.clone(), clock.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    let mut workers = JoinSet::new();
    for index in 0..worker_config.concurrency {
        let worker = Worker::new(
            jobs.clone(),
            queue.clone(),
            executor.clone(),
            pipeline.retry,
            clock.clone(),
            worker_config.for_loop(index),
        );
        let shutdown = shutdown_rx.clone();
        workers.spawn(async move { worker.run(shutdown).await });
    }
    info!(loops = worker_config.concurrency, "Worker loops started");

    tokio::spawn({
        let shutdown_tx = shutdown_tx.clone();
        async move {
            if let Err(e) = shutdown_signal().await {
                error!(error = %e, "Error waiting for shutdown signal");
            }
            let _ = shutdown_tx.send(true);
        }
    });

    let state = handlers::AppState::new(service, inspector, name, version);
    let server = serve(state, &server_config, shutdown_rx.clone());

    let served = server.await;
    if let Err(e) = &served {
        error!(error = %e, "HTTP server failed, stopping worker loops");
    }
    let _ = shutdown_tx.send(true);

    let mut failed = 0usize;
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                failed += 1;
                error!(error = %e, "Worker loop exited with error");
            }
            Err(e) => {
                failed += 1;
                error!(error = %e, "Worker loop panicked");
            }
        }
    }

    served?;
    if failed > 0 {
        return Err(eyre::eyre!("{failed} worker loop(s) failed"));
    }
    info!("Fan-out worker service stopped");
    Ok(())
}

async fn serve(
    state: handlers::AppState,
    config: &ServerConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let app: Router = handlers::router(state).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    let addr = config.address();
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind HTTP server to {}", addr))?;
    info!(address = %addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .wrap_err("HTTP server failed")
}

/// Connect with exponential backoff, then verify with PING.
async fn connect_with_retry(uri: &str) -> Result<ConnectionManager> {
    let client = redis::Client::open(uri).wrap_err("Invalid Redis URI")?;
    let mut delay = Duration::from_millis(200);

    for attempt in 1..=CONNECT_ATTEMPTS {
        match ConnectionManager::new(client.clone()).await {
            Ok(manager) => {
                let mut conn = manager.clone();
                let _: String = redis::cmd("PING").query_async(&mut conn).await?;
                return Ok(manager);
            }
            Err(e) if attempt < CONNECT_ATTEMPTS => {
                warn!(attempt, error = %e, delay_ms = delay.as_millis() as u64, "Redis connection failed, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(eyre::eyre!("Redis connection attempts exhausted"))
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
        .wrap_err("Failed to install SIGTERM handler")?;

    #[cfg(unix)]
    let terminate = async move {
        terminate.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = signal::ctrl_c() => {
            result.wrap_err("Failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C, initiating shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}
