use anyhow::Result;
use perfsync::*;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::time::Duration;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(
            w,
            "{}",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z")
        )
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(_) => {
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_timer(LocalTimer)
        .with_env_filter(filter)
        .init();

    let app_config = config::AppConfig::load()?;
    tracing::info!(
        version = version::VERSION,
        device_id = %app_config.sampling.device_id,
        tick_ms = app_config.sampling.tick_interval_ms,
        "starting"
    );

    let store = Arc::new(
        store::SqliteStore::connect(
            &app_config.database.path,
            app_config.database.max_pool_size,
            app_config.database.retention_days,
        )
        .await?,
    );
    store.init().await?;

    let initial_auth = match &app_config.identity.user_id {
        Some(user) => models::AuthState::signed_in(user.clone()),
        None => models::AuthState::signed_out(),
    };
    let (auth_tx, auth_rx) = watch::channel(initial_auth);
    let auth_tx = Arc::new(auth_tx);
    let (online_tx, online_rx) = watch::channel(true);
    let (live_tx, _) = broadcast::channel::<models::Sample>(app_config.sampling.live_capacity);

    let buffer = Arc::new(buffer::BatchBuffer::new(app_config.buffer_config()));
    let stats = Arc::new(status::PipelineStats::default());
    let recent = Arc::new(status::RecentSamples::new(app_config.sampling.live_capacity));
    let gateway = gateway::PersistenceGateway::new(store.clone());
    let sampler = sampler::Sampler::new(
        sampler::SysinfoSource::new(),
        app_config.sampling.device_id.clone(),
        app_config.tick_interval(),
    );

    let scheduler = scheduler::spawn(
        scheduler::SchedulerDeps {
            sampler,
            buffer: buffer.clone(),
            gateway: gateway.clone(),
            stats: stats.clone(),
            recent: recent.clone(),
            live_tx: live_tx.clone(),
            auth_rx,
            online_rx,
        },
        scheduler::SchedulerConfig {
            tick_interval: app_config.tick_interval(),
            connectivity_grace: Duration::from_secs(app_config.pipeline.connectivity_grace_secs),
            shutdown_timeout: Duration::from_secs(app_config.pipeline.shutdown_timeout_secs),
            stats_log_interval: Duration::from_secs(app_config.pipeline.stats_log_interval_secs),
            anomaly_flush: app_config.sampling.anomaly_flush,
            retry: app_config.retry_policy(),
        },
    );
    let probe_handle = connectivity::spawn_probe(
        store.clone(),
        Duration::from_secs(app_config.pipeline.connectivity_probe_secs),
        online_tx,
    );
    let maintenance_handle = maintenance::spawn(
        store.clone(),
        maintenance::MaintenanceConfig {
            prune_interval_secs: app_config.database.maintenance_interval_secs,
            vacuum_schedule: app_config.database.vacuum_schedule.clone(),
        },
    );

    let app = routes::app(routes::RouterDeps {
        gateway,
        control: scheduler.control(),
        stats,
        buffer,
        recent,
        live_tx,
        auth_tx,
        device_id: app_config.sampling.device_id.clone(),
    });
    let addr = format!("{}:{}", app_config.server.host, app_config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_signal().await;
            tracing::info!("Received shutdown signal");
        })
        .await?;

    // Final flush before the store goes away
    scheduler.shutdown().await?;
    probe_handle.abort();
    maintenance_handle.abort();
    tracing::info!("shutdown complete");
    Ok(())
}
