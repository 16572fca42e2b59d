// Scheduler state machine on a paused clock: cadence, triggers, identity, retry, shutdown

mod common;

use common::{CountingSource, DEVICE, FakeStore, seqs};
use perfsync::buffer::{BatchBuffer, BufferConfig};
use perfsync::gateway::PersistenceGateway;
use perfsync::models::AuthState;
use perfsync::retry::RetryPolicy;
use perfsync::sampler::Sampler;
use perfsync::scheduler::{SchedulerConfig, SchedulerDeps, SchedulerHandle, spawn};
use perfsync::status::{PipelineState, PipelineStats, RecentSamples};
use perfsync::store::StoreError;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::sync::{broadcast, watch};
use tokio::time::{Duration, sleep};

const TICK: Duration = Duration::from_secs(1);

struct Harness {
    source: Arc<CountingSource>,
    store: Arc<FakeStore>,
    stats: Arc<PipelineStats>,
    recent: Arc<RecentSamples>,
    live_tx: broadcast::Sender<perfsync::models::Sample>,
    auth_tx: watch::Sender<AuthState>,
    online_tx: watch::Sender<bool>,
    handle: SchedulerHandle,
}

fn config() -> SchedulerConfig {
    SchedulerConfig {
        tick_interval: TICK,
        connectivity_grace: Duration::from_secs(30),
        shutdown_timeout: Duration::from_secs(5),
        stats_log_interval: Duration::from_secs(3600),
        anomaly_flush: false,
        retry: RetryPolicy {
            jitter: 0.0,
            ..Default::default()
        },
    }
}

fn batch_of(max_batch_size: usize) -> BufferConfig {
    BufferConfig {
        max_batch_size,
        max_batch_age: Duration::from_secs(300),
        max_buffered_samples: 3600,
    }
}

fn start(buffer: BufferConfig, config: SchedulerConfig, auth: AuthState) -> Harness {
    start_with(buffer, config, auth, Arc::new(FakeStore::default()))
}

fn start_with(
    buffer: BufferConfig,
    config: SchedulerConfig,
    auth: AuthState,
    store: Arc<FakeStore>,
) -> Harness {
    let source = Arc::new(CountingSource::default());
    let stats = Arc::new(PipelineStats::default());
    let recent = Arc::new(RecentSamples::new(60));
    let (live_tx, _) = broadcast::channel(16);
    let (auth_tx, auth_rx) = watch::channel(auth);
    let (online_tx, online_rx) = watch::channel(true);
    let handle = spawn(
        SchedulerDeps {
            sampler: Sampler::new(source.clone(), DEVICE, config.tick_interval),
            buffer: Arc::new(BatchBuffer::new(buffer)),
            gateway: PersistenceGateway::new(store.clone()),
            stats: stats.clone(),
            recent: recent.clone(),
            live_tx: live_tx.clone(),
            auth_rx,
            online_rx,
        },
        config,
    );
    Harness {
        source,
        store,
        stats,
        recent,
        live_tx,
        auth_tx,
        online_tx,
        handle,
    }
}

fn alice() -> AuthState {
    AuthState::signed_in("alice")
}

#[tokio::test(start_paused = true)]
async fn five_ticks_make_one_ordered_batch() {
    let h = start(batch_of(5), config(), alice());
    sleep(Duration::from_millis(5500)).await;

    let batches = h.store.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].0, "alice");
    assert_eq!(seqs(&batches[0].1), vec![1, 2, 3, 4, 5]);
    assert!(batches[0].1.iter().all(|s| s.device_id == DEVICE));
    assert_eq!(h.recent.to_vec().len(), 5);

    h.handle.shutdown().await.unwrap();
    assert_eq!(h.store.insert_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn no_identity_means_idle_and_no_reads() {
    let h = start(batch_of(5), config(), AuthState::signed_out());
    sleep(Duration::from_secs(5)).await;
    assert_eq!(h.source.reads(), 0);
    assert_eq!(h.handle.state(), PipelineState::Idle);

    h.auth_tx.send_replace(alice());
    sleep(Duration::from_millis(1500)).await;
    assert_eq!(h.handle.state(), PipelineState::Sampling);
    assert_eq!(h.source.reads(), 1);
    h.handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn sign_out_mid_batch_flushes_under_outgoing_identity() {
    let h = start(batch_of(10), config(), alice());
    sleep(Duration::from_millis(3500)).await;
    h.auth_tx.send_replace(AuthState::signed_out());
    sleep(Duration::from_secs(5)).await;

    assert_eq!(seqs(&h.store.saved_for("alice")), vec![1, 2, 3]);
    assert_eq!(h.source.reads(), 3);
    assert_eq!(h.handle.state(), PipelineState::Idle);
    h.handle.shutdown().await.unwrap();
    assert_eq!(h.store.insert_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn identity_switch_keeps_samples_with_their_owner() {
    let h = start(batch_of(10), config(), alice());
    sleep(Duration::from_millis(3500)).await;
    h.auth_tx.send_replace(AuthState::signed_in("bob"));
    sleep(Duration::from_millis(2200)).await;
    h.handle.shutdown().await.unwrap();

    assert_eq!(seqs(&h.store.saved_for("alice")), vec![1, 2, 3]);
    assert_eq!(seqs(&h.store.saved_for("bob")), vec![4, 5]);
}

#[tokio::test(start_paused = true)]
async fn transient_failure_retries_without_loss_or_duplicates() {
    let store = Arc::new(FakeStore::default());
    store.fail_next([StoreError::Unavailable("timeout".into())]);
    let h = start_with(batch_of(3), config(), alice(), store);
    sleep(Duration::from_millis(10_500)).await;
    h.handle.shutdown().await.unwrap();

    let reads = h.source.reads();
    assert_eq!(reads, 10);
    assert_eq!(
        seqs(&h.store.saved_for("alice")),
        (1..=reads).collect::<Vec<_>>()
    );
    assert_eq!(h.stats.transient_failures.load(Ordering::Relaxed), 1);
    assert!(!h.stats.last_sync_failed());
}

#[tokio::test(start_paused = true)]
async fn rejected_batch_is_dropped_and_flagged() {
    let store = Arc::new(FakeStore::default());
    store.fail_next([StoreError::Rejected("CHECK constraint failed".into())]);
    let h = start_with(batch_of(2), config(), alice(), store);

    sleep(Duration::from_millis(2500)).await;
    assert!(h.stats.last_sync_failed());
    assert_eq!(h.stats.batches_rejected.load(Ordering::Relaxed), 1);
    assert_eq!(h.stats.samples_rejected.load(Ordering::Relaxed), 2);

    sleep(Duration::from_secs(2)).await;
    assert!(!h.stats.last_sync_failed());
    assert_eq!(seqs(&h.store.saved_for("alice")), vec![3, 4]);
    h.handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn sampling_continues_while_flushing() {
    let store = Arc::new(FakeStore::default());
    store.set_delay(Duration::from_secs(10));
    let h = start_with(batch_of(2), config(), alice(), store);

    sleep(Duration::from_millis(2500)).await;
    assert_eq!(h.handle.state(), PipelineState::Flushing);
    sleep(Duration::from_secs(3)).await;
    assert_eq!(h.source.reads(), 5);
    // One persist in flight at a time
    assert_eq!(h.store.insert_calls(), 1);

    sleep(Duration::from_secs(20)).await;
    let saved = h.store.saved_for("alice");
    assert_eq!(seqs(&saved[..4]), vec![1, 2, 3, 4]);
    h.handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn shutdown_flushes_remaining_and_stops() {
    let h = start(batch_of(100), config(), alice());
    let control = h.handle.control();
    sleep(Duration::from_millis(3500)).await;
    h.handle.shutdown().await.unwrap();

    assert_eq!(seqs(&h.store.saved_for("alice")), vec![1, 2, 3]);
    assert_eq!(control.state(), PipelineState::Stopped);
    assert_eq!(h.stats.samples_lost_on_shutdown.load(Ordering::Relaxed), 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_is_bounded_and_counts_losses() {
    let store = Arc::new(FakeStore::default());
    store.set_delay(Duration::from_secs(60));
    let mut cfg = config();
    cfg.shutdown_timeout = Duration::from_secs(2);
    let h = start_with(batch_of(100), cfg, alice(), store);
    sleep(Duration::from_millis(3500)).await;

    let started = tokio::time::Instant::now();
    h.handle.shutdown().await.unwrap();
    assert!(started.elapsed() <= Duration::from_secs(3));
    assert_eq!(h.stats.samples_lost_on_shutdown.load(Ordering::Relaxed), 3);
    assert!(h.store.batches().is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_reads_skip_the_tick() {
    let h = start(batch_of(3), config(), alice());
    h.source.fail_on(2);
    sleep(Duration::from_millis(4500)).await;

    assert_eq!(seqs(&h.store.saved_for("alice")), vec![1, 3, 4]);
    assert_eq!(h.stats.sample_errors.load(Ordering::Relaxed), 1);
    h.handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn anomaly_forces_early_flush() {
    let mut cfg = config();
    cfg.anomaly_flush = true;
    let h = start(batch_of(100), cfg, alice());
    sleep(Duration::from_millis(2500)).await;
    h.source.set_cpu(95.0);
    sleep(Duration::from_secs(1)).await;

    assert_eq!(seqs(&h.store.saved_for("alice")), vec![1, 2, 3]);
    assert_eq!(h.stats.anomalies.load(Ordering::Relaxed), 1);
    h.handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn connectivity_loss_past_grace_flushes_and_pauses() {
    let mut cfg = config();
    cfg.connectivity_grace = Duration::from_secs(5);
    let h = start(batch_of(100), cfg, alice());
    sleep(Duration::from_millis(2500)).await;
    h.online_tx.send_replace(false);

    sleep(Duration::from_secs(6)).await;
    assert_eq!(h.handle.state(), PipelineState::Idle);
    assert_eq!(seqs(&h.store.saved_for("alice")), vec![1, 2, 3, 4, 5, 6, 7]);
    let paused_at = h.source.reads();
    sleep(Duration::from_secs(5)).await;
    assert_eq!(h.source.reads(), paused_at);

    h.online_tx.send_replace(true);
    sleep(Duration::from_millis(1500)).await;
    assert_eq!(h.handle.state(), PipelineState::Sampling);
    assert_eq!(h.source.reads(), paused_at + 1);
    h.handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn short_outage_keeps_sampling() {
    let h = start(batch_of(100), config(), alice());
    sleep(Duration::from_millis(1500)).await;
    h.online_tx.send_replace(false);
    sleep(Duration::from_secs(3)).await;
    h.online_tx.send_replace(true);
    sleep(Duration::from_secs(1)).await;
    assert_eq!(h.handle.state(), PipelineState::Sampling);
    assert_eq!(h.source.reads(), 5);
    h.handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn flush_now_drains_on_request() {
    let h = start(batch_of(100), config(), alice());
    let mut live = h.live_tx.subscribe();
    sleep(Duration::from_millis(2500)).await;

    let queued = h.handle.control().flush_now().await;
    assert_eq!(queued, 2);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(seqs(&h.store.saved_for("alice")), vec![1, 2]);

    let first = live.recv().await.unwrap();
    assert_eq!(first.network_download, 1.0);
    h.handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn age_threshold_fires_between_slow_ticks() {
    let mut cfg = config();
    cfg.tick_interval = Duration::from_secs(10);
    let buffer = BufferConfig {
        max_batch_size: 100,
        max_batch_age: Duration::from_secs(5),
        max_buffered_samples: 3600,
    };
    let h = start(buffer, cfg, alice());

    sleep(Duration::from_secs(16)).await;
    let batches = h.store.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(seqs(&batches[0].1), vec![1]);

    sleep(Duration::from_secs(10)).await;
    let batches = h.store.batches();
    assert_eq!(batches.len(), 2);
    assert_eq!(seqs(&batches[1].1), vec![2]);
    h.handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn stalled_store_keeps_backlog_under_ceiling() {
    let store = Arc::new(FakeStore::default());
    store.set_delay(Duration::from_secs(100_000));
    let mut cfg = config();
    cfg.shutdown_timeout = Duration::from_secs(1);
    let buffer = BufferConfig {
        max_batch_size: 2,
        max_batch_age: Duration::from_secs(300),
        max_buffered_samples: 4,
    };
    let h = start_with(buffer, cfg, alice(), store);

    sleep(Duration::from_millis(200_500)).await;
    assert_eq!(h.source.reads(), 200);
    assert_eq!(h.store.insert_calls(), 1);
    assert_eq!(h.stats.samples_evicted.load(Ordering::Relaxed), 196);

    h.handle.shutdown().await.unwrap();
    // What was still held when the store gave out: one batch in flight, one queued
    assert_eq!(h.stats.samples_lost_on_shutdown.load(Ordering::Relaxed), 4);
    assert!(h.store.batches().is_empty());
}

#[tokio::test(start_paused = true)]
async fn out_of_range_reading_counts_as_sample_error() {
    let h = start(batch_of(3), config(), alice());
    h.source.set_cpu(250.0);
    sleep(Duration::from_millis(2500)).await;
    assert_eq!(h.stats.sample_errors.load(Ordering::Relaxed), 2);
    assert_eq!(h.stats.samples_collected.load(Ordering::Relaxed), 0);
    assert!(h.recent.to_vec().is_empty());

    h.source.set_cpu(10.0);
    sleep(Duration::from_secs(3)).await;
    assert_eq!(seqs(&h.store.saved_for("alice")), vec![3, 4, 5]);
    assert_eq!(h.stats.sample_errors.load(Ordering::Relaxed), 2);
    h.handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn failed_batch_merges_into_next_queued_batch() {
    let store = Arc::new(FakeStore::default());
    store.set_delay(Duration::from_millis(9500));
    store.fail_next([StoreError::Unavailable("timeout".into())]);
    let h = start_with(batch_of(2), config(), alice(), store);

    // [1, 2] fails at 11.5 s while [3, 4] is queued; the retry at 12.5 s lands at 22 s
    sleep(Duration::from_secs(23)).await;
    let batches = h.store.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].0, "alice");
    assert_eq!(seqs(&batches[0].1), vec![1, 2, 3, 4]);
    assert_eq!(h.store.insert_calls(), 3);
    assert_eq!(h.stats.transient_failures.load(Ordering::Relaxed), 1);
    assert_eq!(h.stats.samples_discarded.load(Ordering::Relaxed), 0);
    assert!(!h.stats.last_sync_failed());
    h.handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_discard_and_count() {
    let store = Arc::new(FakeStore::default());
    store.fail_next([
        StoreError::Unavailable("timeout".into()),
        StoreError::Unavailable("timeout".into()),
    ]);
    let mut cfg = config();
    cfg.retry = RetryPolicy {
        base_delay: Duration::from_millis(1500),
        jitter: 0.0,
        max_attempts: Some(2),
        ..Default::default()
    };
    let h = start_with(batch_of(2), cfg, alice(), store);

    // [1, 2] fails at 2 s; the retry at 3.5 s carries [1, 2, 3] and fails for good
    sleep(Duration::from_millis(5500)).await;
    assert_eq!(h.stats.transient_failures.load(Ordering::Relaxed), 2);
    assert_eq!(h.stats.samples_discarded.load(Ordering::Relaxed), 3);
    assert_eq!(seqs(&h.store.saved_for("alice")), vec![4, 5]);
    assert_eq!(h.store.insert_calls(), 3);
    h.handle.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn failure_after_identity_switch_is_not_reattributed() {
    let store = Arc::new(FakeStore::default());
    store.set_delay(Duration::from_secs(2));
    store.fail_next([StoreError::Unavailable("timeout".into())]);
    let h = start_with(batch_of(2), config(), alice(), store);

    // [1, 2] is in flight for alice when bob signs in; it fails at 4 s
    sleep(Duration::from_millis(3500)).await;
    h.auth_tx.send_replace(AuthState::signed_in("bob"));
    sleep(Duration::from_millis(5500)).await;

    assert_eq!(h.stats.transient_failures.load(Ordering::Relaxed), 1);
    assert_eq!(h.stats.samples_discarded.load(Ordering::Relaxed), 2);
    assert_eq!(seqs(&h.store.saved_for("alice")), vec![3]);
    assert_eq!(seqs(&h.store.saved_for("bob")), vec![4, 5]);
    h.handle.shutdown().await.unwrap();
}
