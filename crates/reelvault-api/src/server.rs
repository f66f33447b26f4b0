//! Server assembly and lifecycle
//!
//! Construction is strictly topological: store, config cache, event bus,
//! worker pools, trigger engine, retry scheduler, cron scheduler, then
//! HTTP. Shutdown walks the same order backwards: stop admissions,
//! cancel the schedulers, drain the pools, then join whatever is left.

use axum::middleware;
use axum::routing::get;
use axum::Router;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::middleware::resolve_subject;
use crate::state::AppState;
use reelvault_core::{
    Clock, Config, ConfigCache, ConfigKind, CronScheduler, Db, DeadLetterQueue, Error, EventBus,
    FfmpegProbe, FsLibraryScanner, JobStore, LibraryScanner, MediaProbe, Phase, PoolDeps,
    RetryScheduler, ScenePathCache, SqliteSceneRepo, StreamAdmission, SystemClock, TaskSupervisor,
    WorkerPool,
};

/// Boot failures, mapped to CLI exit codes
#[derive(Debug)]
pub enum ServeError {
    /// Bad configuration (exit 1)
    Config(Error),

    /// Could not bind the listen address (exit 2)
    Bind(std::io::Error),

    /// Storage failed to open or migrate (exit 3)
    Storage(Error),

    /// Runtime failure after a clean boot
    Runtime(Error),
}

impl ServeError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ServeError::Config(_) => 1,
            ServeError::Bind(_) => 2,
            ServeError::Storage(_) => 3,
            ServeError::Runtime(_) => 1,
        }
    }
}

impl fmt::Display for ServeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServeError::Config(e) => write!(f, "configuration error: {}", e),
            ServeError::Bind(e) => write!(f, "bind error: {}", e),
            ServeError::Storage(e) => write!(f, "storage init failed: {}", e),
            ServeError::Runtime(e) => write!(f, "server error: {}", e),
        }
    }
}

impl std::error::Error for ServeError {}

/// A fully wired application, not yet serving
pub struct App {
    pub state: AppState,
    supervisor: TaskSupervisor,
    scheduler_token: CancellationToken,
    pools: HashMap<Phase, WorkerPool>,
    drain_grace: Duration,
}

impl App {
    /// Open the configured database and build everything on top of it
    pub async fn build(config: &Config) -> Result<Self, ServeError> {
        config.validate().map_err(ServeError::Config)?;

        let db = Db::open(&config.database.path, config.database.max_connections)
            .await
            .map_err(ServeError::Storage)?;
        db.migrate().await.map_err(ServeError::Storage)?;

        let probe: Arc<dyn MediaProbe> = Arc::new(FfmpegProbe::new(&config.library.artifacts_dir));
        Self::build_with(config, db, probe).await
    }

    /// Assemble on a caller-supplied database and probe. The boot order
    /// here is the dependency order; nothing reaches back at a component
    /// built after it.
    pub async fn build_with(
        config: &Config,
        db: Db,
        probe: Arc<dyn MediaProbe>,
    ) -> Result<Self, ServeError> {
        let mut supervisor = TaskSupervisor::new();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        // Storage-backed leaves.
        let store = JobStore::new(db.clone(), clock.clone());
        let scenes = SqliteSceneRepo::new(db.clone(), clock.clone());
        let dlq = DeadLetterQueue::new(db.clone(), clock.clone());

        // Config snapshots; invalid stored config is a config error, not
        // a storage one.
        let configs = ConfigCache::load(db.clone()).await.map_err(|e| match e {
            Error::Database(_) => ServeError::Storage(e),
            other => ServeError::Config(other),
        })?;

        let events = EventBus::new(config.events.buffer);

        // Worker pools, fed back to the engine through a channel so the
        // construction stays one-directional.
        let (completion_tx, completion_rx) = mpsc::channel(256);
        let scenes_port: Arc<dyn reelvault_core::SceneRepo> = Arc::new(scenes.clone());
        let deps = PoolDeps {
            store: store.clone(),
            events: events.clone(),
            scenes: scenes_port,
            probe,
            clock: clock.clone(),
            configs: configs.clone(),
            dlq: dlq.clone(),
        };

        let pool_config = configs.pool();
        let mut pools = HashMap::new();
        for phase in Phase::ALL {
            let pool = WorkerPool::new(
                phase,
                deps.clone(),
                config.jobs.queue_cap,
                config.jobs.timeout_for(phase),
                completion_tx.clone(),
            );
            pool.start(pool_config.workers_for(phase)).await;
            pools.insert(phase, pool);
        }

        let engine = reelvault_core::TriggerEngine::new(
            store.clone(),
            configs.clone(),
            events.clone(),
            Arc::new(scenes.clone()),
            dlq.clone(),
            clock.clone(),
            pools.clone(),
            config.jobs.bulk_cap,
        );
        let listener_handle =
            engine.spawn_completion_listener(completion_rx, supervisor.child_token());
        supervisor.register("completion-listener", listener_handle);

        // Streaming side.
        let admission = StreamAdmission::new(config.streaming.max_global, config.streaming.max_per_ip);
        let paths = ScenePathCache::new(config.streaming.path_cache_size, Arc::new(scenes.clone()));
        let cache_for_hook = paths.clone();
        scenes.on_delete(move |scene_id| cache_for_hook.invalidate(scene_id));

        // Schedulers share one token so shutdown can stop them before
        // the pools drain.
        let scheduler_token = supervisor.child_token();

        let retry = Arc::new(RetryScheduler::new(
            store.clone(),
            configs.clone(),
            engine.clone(),
            dlq.clone(),
            clock.clone(),
            Duration::from_secs(config.jobs.retry_tick_s),
            config.jobs.retry_page,
        ));
        supervisor.register("retry-scheduler", retry.spawn(scheduler_token.clone()));

        let scanner: Arc<dyn LibraryScanner> = Arc::new(FsLibraryScanner::new(
            &config.library.media_dir,
            scenes.clone(),
            engine.clone(),
        ));
        let cron = CronScheduler::new(
            configs.clone(),
            engine.clone(),
            scanner.clone(),
            clock.clone(),
            Duration::from_secs(10),
        );
        let rebuild = cron.rebuild_handle();
        supervisor.register("cron-scheduler", cron.spawn(scheduler_token.clone()));

        // Config swaps resize the pools and rebuild the cron table.
        let pools_for_resize = pools.clone();
        let configs_for_resize = configs.clone();
        configs.subscribe(move |kind| match kind {
            ConfigKind::Pool => {
                let pool_config = configs_for_resize.pool();
                for (phase, pool) in pools_for_resize.clone() {
                    let workers = pool_config.workers_for(phase);
                    tokio::spawn(async move { pool.resize(workers).await });
                }
            }
            ConfigKind::Trigger => {
                let _ = rebuild.send(1);
            }
            ConfigKind::Retry => {}
        });

        // History retention.
        let gc_store = store.clone();
        let retention_days = config.jobs.retention_days;
        let gc_token = supervisor.child_token();
        supervisor.register(
            "job-gc",
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = gc_token.cancelled() => break,
                        _ = sleep(Duration::from_secs(3600)) => {}
                    }
                    match gc_store.gc(retention_days).await {
                        Ok(0) => {}
                        Ok(n) => info!("Job GC removed {} terminal jobs", n),
                        Err(e) => warn!("Job GC failed: {}", e),
                    }
                }
            }),
        );

        if config.library.scan_on_start {
            let scanner = scanner.clone();
            supervisor.register(
                "initial-scan",
                tokio::spawn(async move {
                    if let Err(e) = scanner.scan().await {
                        warn!("Initial library scan failed: {}", e);
                    }
                }),
            );
        }

        let state = AppState {
            engine,
            store,
            dlq,
            configs,
            events,
            admission,
            paths,
            scenes,
            clock,
            status_interval: Duration::from_secs(config.events.status_interval_s),
        };

        Ok(Self {
            state,
            supervisor,
            scheduler_token,
            pools,
            drain_grace: Duration::from_secs(config.jobs.drain_grace_s),
        })
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Ordered teardown: schedulers first, then pool drain, then the
    /// remaining tasks.
    pub async fn shutdown(self) {
        info!("Shutting down");
        self.scheduler_token.cancel();

        for pool in self.pools.values() {
            pool.drain(self.drain_grace).await;
        }

        self.supervisor.shutdown(self.drain_grace).await;
        info!("Shutdown complete");
    }
}

/// Run the server until a shutdown signal arrives
pub async fn run(config: Config) -> Result<(), ServeError> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| ServeError::Config(Error::validation(format!("invalid listen address: {}", e))))?;

    let app = App::build(&config).await?;
    let router = app.router();

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(ServeError::Bind)?;

    info!("Reelvault listening on http://{}", addr);
    log_routes();

    let serve_result = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    // Admissions stopped with the listener; unwind the rest in order.
    app.shutdown().await;

    serve_result.map_err(|e| ServeError::Runtime(Error::internal(e.to_string())))
}

fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .merge(crate::routes::phases::router())
        .merge(crate::routes::jobs::router())
        .merge(crate::routes::config::router())
        .merge(crate::routes::stream::router())
        .merge(crate::routes::events::router())
        .layer(middleware::from_fn(resolve_subject))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}

fn log_routes() {
    info!("Routes:");
    info!("  GET  /health                      - Health check");
    info!("  POST /scenes/:id/phases/:phase    - Submit one phase");
    info!("  POST /phases/:phase/bulk          - Bulk submit");
    info!("  GET  /jobs                        - Job history + queue status");
    info!("  POST /jobs/:id/cancel             - Cancel a job");
    info!("  GET  /jobs/dlq                    - Dead-letter listing");
    info!("  POST /jobs/dlq/:id/retry          - Resubmit a dead letter");
    info!("  POST /jobs/dlq/:id/abandon        - Abandon a dead letter");
    info!("  GET/PUT /config/pool              - Worker counts");
    info!("  GET/PUT /config/trigger           - Trigger table");
    info!("  GET/PUT /config/retry             - Retry tunables");
    info!("  GET  /stream/:scene_id            - Range streaming");
    info!("  GET  /events                      - Server-sent events");
}

async fn health_check() -> &'static str {
    "OK"
}
