// Background store maintenance: prune samples past retention on a fixed interval.
// VACUUM runs on an optional cron schedule (local time).

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::store::SqliteStore;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    pub prune_interval_secs: u64,
    /// Cron expression with seconds, e.g. "0 0 3 * * *" = 03:00 daily.
    pub vacuum_schedule: Option<String>,
}

pub fn spawn(store: Arc<SqliteStore>, config: MaintenanceConfig) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        run(store, config).await;
    })
}

#[instrument(skip(store), fields(interval_secs = config.prune_interval_secs))]
async fn run(store: Arc<SqliteStore>, config: MaintenanceConfig) {
    let mut prune_tick = tokio::time::interval(Duration::from_secs(config.prune_interval_secs));
    prune_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let (vacuum_tx, mut vacuum_rx) = tokio::sync::mpsc::channel::<()>(1);
    if let Some(schedule) = config.vacuum_schedule.clone() {
        tokio::spawn(vacuum_scheduler(schedule, vacuum_tx));
    } else {
        drop(vacuum_tx);
    }
    let mut vacuum_open = true;

    loop {
        tokio::select! {
            _ = prune_tick.tick() => {
                match store.prune_old_data().await {
                    Ok(0) => {}
                    Ok(n) => info!(operation = "prune_old_data", rows = n, "pruned samples past retention"),
                    Err(e) => warn!(error = %e, "prune failed"),
                }
            }
            msg = vacuum_rx.recv(), if vacuum_open => {
                match msg {
                    Some(()) => match store.vacuum().await {
                        Ok(()) => info!("vacuum complete"),
                        Err(e) => warn!(error = %e, "vacuum failed"),
                    },
                    None => vacuum_open = false,
                }
            }
        }
    }
}

/// Sends on `tx` at each scheduled VACUUM time.
async fn vacuum_scheduler(cron_str: String, tx: tokio::sync::mpsc::Sender<()>) {
    let Ok(schedule) = cron::Schedule::from_str(&cron_str) else {
        warn!(cron = %cron_str, "invalid vacuum_schedule; VACUUM will not run");
        return;
    };
    loop {
        let now = chrono::Local::now();
        match schedule.after(&now).next() {
            Some(next) => {
                let delay = (next - now).to_std().unwrap_or(Duration::from_secs(1));
                tokio::time::sleep(delay).await;
                if tx.send(()).await.is_err() {
                    break;
                }
            }
            None => tokio::time::sleep(Duration::from_secs(3600)).await,
        }
    }
}
