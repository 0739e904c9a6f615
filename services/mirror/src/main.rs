use anyhow::{Context, Result};
use mirror_service::api::{start_api_server, AppState};
use mirror_service::config::{Config, ServiceConfig};
use mirror_service::{hub, listener, rescan};
use mirror_service::{
    ImageTypeMatcher, KafkaNotificationSource, Mirror, MirrorSettings, NotificationSource,
    ObjectStore, S3ObjectStore,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service);

    info!(
        service = %config.service.name,
        bucket = %config.s3.bucket,
        polling_mode = config.sync.polling_mode,
        "Starting Mirror Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let store: Arc<dyn ObjectStore> = Arc::new(S3ObjectStore::new(&config.s3).await);
    let matcher = Arc::new(
        ImageTypeMatcher::new(&config.image_types).context("Failed to compile image types")?,
    );
    let settings = MirrorSettings::from_config(&config).context("Failed to compile file patterns")?;

    let (events, event_hub, hub_handle) = hub::channel(
        config.sync.event_channel_capacity,
        config.api.subscriber_queue_capacity,
    );
    let mirror = Mirror::new(settings, store, matcher, &config.cache.dir, events);

    let shutdown = CancellationToken::new();
    let hub_task = tokio::spawn(event_hub.run(shutdown.clone()));

    // Rebuild what a previous run left on disk
    let rebuilt = mirror
        .rebuild_from_disk()
        .context("Failed to rebuild cache from disk")?;
    info!(
        rebuilt,
        main = %config.main_cache_dir().display(),
        thumbnails = %config.thumbnails_cache_dir().display(),
        "Cache directories ready"
    );

    // Initial scan, whatever the driver
    if let Err(e) = rescan::rescan_once(&mirror).await {
        if config.cache.exit_on_backend_error {
            return Err(e).context("Initial scan failed");
        }
        error!(error = %e, "Initial scan failed");
    }

    // Spawn the sync driver
    let driver_handle = if config.sync.polling_mode {
        let mirror = Arc::clone(&mirror);
        let period = config.polling_period();
        let exit_on_error = config.cache.exit_on_backend_error;
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            rescan::run_rescan_loop(mirror, period, exit_on_error, shutdown)
                .await
                .context("Rescan driver failed")
        })
    } else {
        let source: Arc<dyn NotificationSource> = Arc::new(
            KafkaNotificationSource::new(&config.notifications)
                .context("Failed to initialize bucket notifications")?,
        );
        let mirror = Arc::clone(&mirror);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            listener::run_listener(mirror, source, shutdown)
                .await
                .context("Notification driver failed")
        })
    };

    // Spawn API server task
    let api_state = AppState {
        mirror: Arc::clone(&mirror),
        hub: hub_handle,
    };
    let api_config = config.api.clone();
    let api_shutdown = shutdown.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config, api_shutdown).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Mirror service started successfully");

    // Wait for a shutdown signal or for the driver to give up
    let mut driver_handle = driver_handle;
    let driver_result = tokio::select! {
        _ = shutdown_signal() => None,
        joined = &mut driver_handle => Some(joined),
    };

    info!("Shutting down mirror service");
    shutdown.cancel();

    let failure = match driver_result {
        Some(Ok(Ok(()))) => {
            warn!("Sync driver stopped on its own");
            None
        }
        Some(Ok(Err(e))) => Some(e),
        Some(Err(e)) => Some(anyhow::Error::new(e).context("Sync driver panicked")),
        None => {
            if tokio::time::timeout(Duration::from_secs(10), driver_handle).await.is_err() {
                warn!("Sync driver did not stop in time");
            }
            None
        }
    };

    if tokio::time::timeout(Duration::from_secs(10), api_handle).await.is_err() {
        warn!("API server did not stop in time");
    }
    let _ = hub_task.await;
    let cancelled = mirror.timers().cancel_all();
    info!(timers = cancelled, "Mirror service stopped");

    if let Some(e) = failure {
        error!(error = %format!("{e:#}"), "Exiting after backend error");
        return Err(e);
    }

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(service: &ServiceConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&service.log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if service.log_format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
