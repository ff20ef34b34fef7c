//! # Telematics Broadcast Server
//!
//! Subscribes to live per-device telemetry on a Redis Pub/Sub channel, keeps a
//! short session window per trip, enriches each sample with the local speed
//! limit and a motion classification, and streams the results to dashboards
//! over Server-Sent Events.
//!
//! ## Tasks:
//! - **Ingestor**: Redis subscription feeding the pipeline, resubscribing after a fixed delay.
//! - **Connectivity Monitor**: announces device connect/disconnect transitions.
//! - **Session Reaper**: evicts trips that have gone quiet.
//! - **Trip List Ticker**: periodically broadcasts the active trip ids.
//! - **Downstream**: `GET /sse` for viewers and `GET /health`.
//!
//! Startup fails hard when the classifier artifact, the CSV dataset file, the
//! resolver client or the listening socket cannot be set up. Shutdown is driven
//! by `tokio-graceful` (Ctrl+C / SIGTERM) and propagated to every task through
//! one cancellation token.

mod telematics_logic;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use static_init::dynamic;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_graceful::{Shutdown, ShutdownGuard};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use lib_tripcast::{
    BroadcastHub, CentroidClassifier, ConnectivityMonitor, CsvSink, NominatimResolver, PipelineParts, RedisIngestor,
    SessionReaper, TelemetryPipeline, TripRegistry, run_trip_list_ticker,
};

use telematics_logic::config::{ServerSettings, load_config};
use telematics_logic::downstream::{self, AppState};
use telematics_logic::logger::setup_logging;

// load .env files before anything else
#[dynamic]
static DOTENV_INIT: () = {
    let dotenv_os: &str = if cfg!(target_os = "windows") {
        ".env.windows"
    } else {
        ".env.linux"
    };

    dotenvy::dotenv().ok();
    dotenvy::from_filename(dotenv_os).ok();
};

/// Everything built during startup, ready to be spawned.
struct Engine {
    settings: ServerSettings,
    registry: Arc<TripRegistry>,
    hub: Arc<BroadcastHub>,
    pipeline: Arc<TelemetryPipeline>,
    monitor: Arc<ConnectivityMonitor>,
    reaper: Arc<SessionReaper>,
    listener: TcpListener,
}

impl Engine {
    async fn build(settings: ServerSettings) -> Result<Engine> {
        let engine_settings = settings.engine.clone();

        let classifier = CentroidClassifier::load(&settings.model_path, engine_settings.window_capacity)
            .context("classifier artifact could not be loaded")?;
        info!(labels = ?classifier.labels(), path = %settings.model_path.display(), "classifier loaded");

        let sink = CsvSink::open(&settings.csv_path)
            .with_context(|| format!("CSV dataset {} could not be opened", settings.csv_path.display()))?;

        let resolver = NominatimResolver::new(
            &settings.resolver_url,
            &settings.resolver_user_agent,
            settings.resolver_timeout,
        )
        .context("road resolver client could not be built")?;

        let registry = Arc::new(TripRegistry::new(engine_settings.window_capacity));
        let hub = Arc::new(BroadcastHub::new(engine_settings.subscriber_buffer));

        let pipeline = Arc::new(TelemetryPipeline::new(PipelineParts {
            registry: registry.clone(),
            hub: hub.clone(),
            classifier: Arc::new(classifier),
            resolver: Arc::new(resolver),
            sink: Arc::new(sink),
            enrichment_interval: engine_settings.enrichment_interval,
            speeding_tolerance_kmh: engine_settings.speeding_tolerance_kmh,
        }));

        let monitor = Arc::new(ConnectivityMonitor::new(
            registry.clone(),
            hub.clone(),
            engine_settings.device_timeout,
            engine_settings.monitor_interval,
        ));
        let reaper = Arc::new(SessionReaper::new(
            registry.clone(),
            hub.clone(),
            engine_settings.trip_inactivity_timeout,
            engine_settings.reaper_interval,
        ));

        let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;

        Ok(Engine {
            settings,
            registry,
            hub,
            pipeline,
            monitor,
            reaper,
            listener,
        })
    }

    /// Runs every task until the shutdown guard fires, then cancels and joins them.
    async fn run(self, guard: ShutdownGuard) {
        let token = CancellationToken::new();
        let engine = self.settings.engine.clone();
        let mut tasks = JoinSet::new();

        let ingestor = Arc::new(RedisIngestor::new(
            &self.settings.redis_url,
            &self.settings.topic,
            engine.reconnect_delay,
            self.pipeline.clone(),
        ));
        tasks.spawn(ingestor.clone().run(token.clone()));
        tasks.spawn(self.monitor.clone().run(token.clone()));
        tasks.spawn(self.reaper.clone().run(token.clone()));
        tasks.spawn(run_trip_list_ticker(
            self.registry.clone(),
            self.hub.clone(),
            engine.trip_list_interval,
            token.clone(),
        ));

        let state = AppState {
            hub: self.hub.clone(),
            monitor: self.monitor.clone(),
            pipeline: self.pipeline.clone(),
            shutdown: token.clone(),
        };
        let listener = self.listener;
        tasks.spawn(async move {
            if let Err(e) = downstream::run(listener, state).await {
                error!("Downstream server failed: {:#}", e);
            }
        });

        guard.cancelled().await;
        info!("shutdown signal received, stopping tasks");
        token.cancel();

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("task ended abnormally: {}", e);
            }
        }
        info!(
            subscribe_attempts = ingestor.attempts(),
            accepted = self.pipeline.accepted(),
            rejected = self.pipeline.rejected(),
            lookups = self.pipeline.lookups_started(),
            "engine stopped"
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = load_config()?;
    let _log_guard = setup_logging(&settings.log_dir, &settings.log_level)?;
    info!(
        port = settings.port,
        redis = %settings.redis_url,
        topic = %settings.topic,
        window = settings.engine.window_capacity,
        "starting server_telematics"
    );

    let engine = match Engine::build(settings).await {
        Ok(engine) => engine,
        Err(e) => {
            error!("startup failed: {:#}", e);
            return Err(e);
        }
    };

    let shutdown = Shutdown::default();
    shutdown.spawn_task_fn(move |guard| engine.run(guard));

    match shutdown.shutdown_with_limit(Duration::from_secs(10)).await {
        Ok(elapsed) => {
            info!(
                "shutdown: gracefully {}s after shutdown signal received",
                elapsed.as_secs_f64()
            );
        }
        Err(e) => {
            info!("shutdown: forcefully due to timeout: {}", e);
        }
    }

    info!("Bye!");

    Ok(())
}
