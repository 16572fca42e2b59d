// Connectivity signal: pings the store and publishes reachability on a watch channel.

use crate::store::RemoteStore;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Duration, interval, timeout};

/// Spawns the probe. The first ping runs immediately; the task ends when every receiver is gone.
pub fn spawn_probe<S: RemoteStore>(
    store: Arc<S>,
    period: Duration,
    online_tx: watch::Sender<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = interval(period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = online_tx.closed() => break,
            }
            let online = match timeout(period, store.ping()).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    tracing::debug!(error = %e, operation = "ping", "store unreachable");
                    false
                }
                Err(_) => {
                    tracing::debug!(operation = "ping", "store ping timed out");
                    false
                }
            };
            online_tx.send_if_modified(|current| {
                let changed = *current != online;
                *current = online;
                changed
            });
        }
        tracing::debug!("connectivity probe stopped");
    })
}
