// Pipeline supervisor: owns the tick timer and buffer lifecycle, follows identity and
// connectivity, and keeps at most one persist in flight. Sampling never waits on a flush.

use crate::buffer::{Batch, BatchBuffer, FlushTrigger, ForceCause};
use crate::gateway::{PersistError, PersistOutcome, PersistenceGateway};
use crate::models::{AuthState, Identity, Sample};
use crate::retry::RetryPolicy;
use crate::sampler::{MetricsSource, Sampler, detect_anomaly};
use crate::status::{PipelineState, PipelineStats, RecentSamples};
use crate::store::RemoteStore;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Duration, Instant, Interval, interval_at, sleep_until, timeout_at};
use tracing::Instrument;

/// Rate limit for repeated sampling-failure warnings.
const SAMPLE_ERROR_WARN_INTERVAL: Duration = Duration::from_secs(60);
/// Stand-in deadline for disabled timer branches.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365);

pub struct SchedulerConfig {
    pub tick_interval: Duration,
    /// How long connectivity may be lost before sampling pauses.
    pub connectivity_grace: Duration,
    /// Upper bound on the final flush at shutdown.
    pub shutdown_timeout: Duration,
    pub stats_log_interval: Duration,
    /// Flush immediately when a sample crosses an anomaly threshold.
    pub anomaly_flush: bool,
    pub retry: RetryPolicy,
}

/// Collaborators and channels for the scheduler task.
pub struct SchedulerDeps<M, S> {
    pub sampler: Sampler<M>,
    pub buffer: Arc<BatchBuffer>,
    pub gateway: PersistenceGateway<S>,
    pub stats: Arc<PipelineStats>,
    pub recent: Arc<RecentSamples>,
    pub live_tx: broadcast::Sender<Sample>,
    pub auth_rx: watch::Receiver<AuthState>,
    pub online_rx: watch::Receiver<bool>,
}

enum Command {
    FlushNow(oneshot::Sender<usize>),
    Shutdown,
}

/// Cloneable control surface (status API, signal handler).
#[derive(Clone)]
pub struct SchedulerControl {
    commands: mpsc::Sender<Command>,
    state_rx: watch::Receiver<PipelineState>,
}

impl SchedulerControl {
    pub fn state(&self) -> PipelineState {
        *self.state_rx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PipelineState> {
        self.state_rx.clone()
    }

    /// Forces a flush of whatever is buffered. Returns the number of samples queued for
    /// persistence (0 when idle or empty).
    pub async fn flush_now(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::FlushNow(tx)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

pub struct SchedulerHandle {
    control: SchedulerControl,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn control(&self) -> SchedulerControl {
        self.control.clone()
    }

    pub fn state(&self) -> PipelineState {
        self.control.state()
    }

    /// Final flush (bounded by the shutdown timeout), then Stopped.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.control.commands.send(Command::Shutdown).await;
        self.join.await?;
        Ok(())
    }
}

/// A drained batch bound to the identity it was captured under.
struct Outbound {
    batch: Batch,
    identity: Identity,
    /// Failed attempts so far.
    attempt: u32,
}

type PersistDone = (Identity, u32, PersistOutcome);

struct Runner<M, S> {
    sampler: Sampler<M>,
    buffer: Arc<BatchBuffer>,
    gateway: PersistenceGateway<S>,
    stats: Arc<PipelineStats>,
    recent: Arc<RecentSamples>,
    live_tx: broadcast::Sender<Sample>,
    state_tx: watch::Sender<PipelineState>,
    config: SchedulerConfig,

    identity: Option<Identity>,
    offline_since: Option<Instant>,
    idle_for_connectivity: bool,
    inflight: Option<JoinHandle<PersistDone>>,
    inflight_len: usize,
    pending: VecDeque<Outbound>,
    /// Backoff deadline after a transient failure; dispatch waits for it.
    retry_at: Option<Instant>,
    /// Attempts carried by samples merged back into the buffer.
    carry_attempt: u32,
    last_sample_error_warn: Option<Instant>,
}

pub fn spawn<M, S>(deps: SchedulerDeps<M, S>, config: SchedulerConfig) -> SchedulerHandle
where
    M: MetricsSource + 'static,
    S: RemoteStore,
{
    let SchedulerDeps {
        sampler,
        buffer,
        gateway,
        stats,
        recent,
        live_tx,
        auth_rx,
        online_rx,
    } = deps;
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let (state_tx, state_rx) = watch::channel(PipelineState::Idle);

    let runner = Runner {
        sampler,
        buffer,
        gateway,
        stats,
        recent,
        live_tx,
        state_tx,
        config,
        identity: None,
        offline_since: None,
        idle_for_connectivity: false,
        inflight: None,
        inflight_len: 0,
        pending: VecDeque::new(),
        retry_at: None,
        carry_attempt: 0,
        last_sample_error_warn: None,
    };
    let span = tracing::info_span!(
        "scheduler",
        device_id = runner.sampler.device_id(),
        tick_ms = runner.config.tick_interval.as_millis() as u64
    );
    let join = tokio::spawn(runner.run(cmd_rx, auth_rx, online_rx).instrument(span));
    SchedulerHandle {
        control: SchedulerControl {
            commands: cmd_tx,
            state_rx,
        },
        join,
    }
}

async fn join_inflight(
    inflight: &mut Option<JoinHandle<PersistDone>>,
) -> Result<PersistDone, JoinError> {
    match inflight {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

impl<M, S> Runner<M, S>
where
    M: MetricsSource + 'static,
    S: RemoteStore,
{
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut auth_rx: watch::Receiver<AuthState>,
        mut online_rx: watch::Receiver<bool>,
    ) {
        let period = self.config.tick_interval;
        let mut tick = interval_at(Instant::now() + period, period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let stats_period = self.config.stats_log_interval;
        let mut stats_log_tick = interval_at(Instant::now() + stats_period, stats_period);
        stats_log_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        if !*online_rx.borrow_and_update() {
            self.offline_since = Some(Instant::now());
        }
        let initial = auth_rx.borrow_and_update().clone();
        self.on_auth_change(initial, &mut tick);

        let mut auth_open = true;
        let mut online_open = true;

        loop {
            let far = Instant::now() + FAR_FUTURE;
            let grace_deadline = self
                .offline_since
                .map(|t| t + self.config.connectivity_grace)
                .unwrap_or(far);
            let age_deadline = if self.sampling_enabled() && self.retry_at.is_none() {
                self.buffer.age_deadline()
            } else {
                None
            };
            tokio::select! {
                _ = tick.tick(), if self.sampling_enabled() => {
                    self.on_tick();
                }
                res = join_inflight(&mut self.inflight) => {
                    self.inflight = None;
                    self.on_persist_done(res);
                }
                _ = sleep_until(self.retry_at.unwrap_or(far)), if self.retry_at.is_some() => {
                    self.on_retry_due();
                }
                _ = sleep_until(age_deadline.unwrap_or(far)), if age_deadline.is_some() => {
                    if let Some(trigger) = self.buffer.poll_age(Instant::now()) {
                        self.enqueue_drain(trigger);
                    }
                }
                _ = sleep_until(grace_deadline),
                    if self.offline_since.is_some() && !self.idle_for_connectivity && self.identity.is_some() => {
                    self.on_grace_expired();
                }
                res = auth_rx.changed(), if auth_open => {
                    match res {
                        Ok(()) => {
                            let next = auth_rx.borrow_and_update().clone();
                            self.on_auth_change(next, &mut tick);
                        }
                        Err(_) => {
                            tracing::warn!("identity provider closed; treating as signed out");
                            auth_open = false;
                            self.on_auth_change(AuthState::signed_out(), &mut tick);
                        }
                    }
                }
                res = online_rx.changed(), if online_open => {
                    match res {
                        Ok(()) => {
                            let online = *online_rx.borrow_and_update();
                            self.on_connectivity_change(online, &mut tick);
                        }
                        Err(_) => online_open = false,
                    }
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::FlushNow(reply)) => {
                            let n = self.flush_now(ForceCause::UserRequest);
                            let _ = reply.send(n);
                        }
                        Some(Command::Shutdown) | None => break,
                    }
                }
                _ = stats_log_tick.tick() => {
                    let snap = self.stats.snapshot(*self.state_tx.borrow(), self.buffer.len());
                    tracing::info!(
                        state = ?snap.state,
                        buffered = snap.buffered,
                        pending_batches = self.pending.len(),
                        samples_collected = snap.samples_collected,
                        samples_saved = snap.samples_saved,
                        sample_errors = snap.sample_errors,
                        samples_evicted = snap.samples_evicted,
                        samples_discarded = snap.samples_discarded,
                        batches_rejected = snap.batches_rejected,
                        last_sync_failed = snap.last_sync_failed,
                        "pipeline stats"
                    );
                }
            }
        }

        self.shutdown().await;
    }

    fn sampling_enabled(&self) -> bool {
        self.identity.is_some() && !self.idle_for_connectivity
    }

    fn update_state(&self) {
        let state = if !self.sampling_enabled() {
            PipelineState::Idle
        } else if self.inflight.is_some() {
            PipelineState::Flushing
        } else {
            PipelineState::Sampling
        };
        self.state_tx.send_if_modified(|s| {
            let changed = *s != state;
            *s = state;
            changed
        });
    }

    fn on_tick(&mut self) {
        let now = Instant::now();
        match self.sampler.sample_once(Utc::now()) {
            Ok(sample) => {
                PipelineStats::add(&self.stats.samples_collected, 1);
                self.recent.push(sample.clone());
                // No receivers just means no dashboard is attached
                let _ = self.live_tx.send(sample.clone());

                let anomaly = detect_anomaly(&sample);
                if let Some(anomaly) = anomaly {
                    PipelineStats::add(&self.stats.anomalies, 1);
                    tracing::warn!(%anomaly, "anomalous reading");
                }
                let outcome = self.buffer.append(sample, now);
                if outcome.overflowed() {
                    PipelineStats::add(&self.stats.samples_evicted, outcome.evicted as u64);
                    tracing::warn!(
                        evicted = outcome.evicted,
                        ceiling = self.buffer.config().max_buffered_samples,
                        "buffer overflow; oldest samples evicted"
                    );
                }

                // While backing off, everything stays buffered for the retry drain
                if self.retry_at.is_some() {
                    return;
                }
                if let Some(trigger) = outcome.threshold {
                    self.enqueue_drain(trigger);
                } else if anomaly.is_some() && self.config.anomaly_flush {
                    self.enqueue_drain(FlushTrigger::Forced(ForceCause::Anomaly));
                }
            }
            Err(e) => {
                PipelineStats::add(&self.stats.sample_errors, 1);
                let should_warn = self
                    .last_sample_error_warn
                    .is_none_or(|t| t.elapsed() >= SAMPLE_ERROR_WARN_INTERVAL);
                if should_warn {
                    tracing::warn!(error = %e, operation = "sample_once", "tick skipped");
                    self.last_sample_error_warn = Some(Instant::now());
                }
                if self.retry_at.is_none()
                    && let Some(trigger) = self.buffer.poll_age(now)
                {
                    self.enqueue_drain(trigger);
                }
            }
        }
    }

    /// Drains the buffer under the current identity and hands it to dispatch.
    /// Returns how many samples were drained.
    fn enqueue_drain(&mut self, trigger: FlushTrigger) -> usize {
        let Some(identity) = self.identity.clone() else {
            return 0;
        };
        let Some(batch) = self.buffer.drain_for_flush(trigger) else {
            return 0;
        };
        let n = batch.len();
        tracing::debug!(samples = n, ?trigger, "batch drained");
        self.pending.push_back(Outbound {
            batch,
            identity,
            attempt: std::mem::take(&mut self.carry_attempt),
        });
        self.dispatch();
        n
    }

    fn flush_now(&mut self, cause: ForceCause) -> usize {
        // An explicit flush skips the remaining backoff
        self.retry_at = None;
        let n = self.enqueue_drain(FlushTrigger::Forced(cause));
        self.dispatch();
        n
    }

    /// Keeps buffered, queued and in-flight samples within the buffer ceiling by
    /// evicting from the oldest queued batch. Returns how many samples were evicted.
    fn enforce_ceiling(&mut self) -> usize {
        let ceiling = self.buffer.config().max_buffered_samples;
        let queued: usize = self.pending.iter().map(|out| out.batch.len()).sum();
        let held = self.inflight_len + self.buffer.len() + queued;
        let mut excess = held.saturating_sub(ceiling);
        let mut evicted = 0;
        while excess > 0 {
            let Some(front) = self.pending.front_mut() else {
                break;
            };
            let dropped = front.batch.evict_oldest(excess);
            evicted += dropped;
            excess -= dropped;
            if front.batch.is_empty() {
                self.pending.pop_front();
            }
        }
        if evicted > 0 {
            PipelineStats::add(&self.stats.samples_evicted, evicted as u64);
            tracing::warn!(
                evicted,
                ceiling,
                pending_batches = self.pending.len(),
                "persist backlog over ceiling; oldest queued samples evicted"
            );
        }
        evicted
    }

    /// Starts the next queued persist if none is in flight and no backoff is pending.
    fn dispatch(&mut self) {
        self.enforce_ceiling();
        if self.inflight.is_some() {
            self.update_state();
            return;
        }
        if self.retry_at.is_some_and(|t| Instant::now() < t) {
            self.update_state();
            return;
        }
        self.retry_at = None;
        let Some(out) = self.pending.pop_front() else {
            self.update_state();
            return;
        };
        self.inflight_len = out.batch.len();
        let gateway = self.gateway.clone();
        self.inflight = Some(tokio::spawn(async move {
            let Outbound {
                batch,
                identity,
                attempt,
            } = out;
            let outcome = gateway.persist(batch, Some(&identity)).await;
            (identity, attempt, outcome)
        }));
        self.update_state();
    }

    fn on_persist_done(&mut self, res: Result<PersistDone, JoinError>) {
        match res {
            Ok((_identity, attempt, Ok(receipt))) => {
                PipelineStats::add(&self.stats.samples_saved, receipt.count as u64);
                PipelineStats::add(&self.stats.batches_saved, 1);
                self.stats.record_sync_ok();
                if attempt > 0 {
                    tracing::info!(samples = receipt.count, attempts = attempt + 1, "batch saved after retry");
                } else {
                    tracing::debug!(operation = "persist", samples = receipt.count, "batch saved");
                }
            }
            Ok((identity, attempt, Err(failure))) => {
                self.on_persist_failed(identity, attempt, failure.batch, failure.error);
            }
            Err(e) => {
                PipelineStats::add(&self.stats.samples_discarded, self.inflight_len as u64);
                self.stats.record_sync_failure(format!("persist task failed: {e}"));
                tracing::error!(error = %e, samples = self.inflight_len, "persist task failed; batch lost");
            }
        }
        self.inflight_len = 0;
        self.dispatch();
    }

    fn on_persist_failed(&mut self, identity: Identity, attempt: u32, batch: Batch, error: PersistError) {
        let n = batch.len() as u64;
        match &error {
            PersistError::RejectedByStore(_) => {
                PipelineStats::add(&self.stats.batches_rejected, 1);
                PipelineStats::add(&self.stats.samples_rejected, n);
                self.stats.record_sync_failure(error.to_string());
                tracing::error!(error = %error, samples = n, "batch rejected by store; dropped");
                return;
            }
            PersistError::EmptyBatch => {
                tracing::debug!("empty batch skipped");
                return;
            }
            PersistError::TransientStore(_) | PersistError::Unauthenticated => {}
        }

        PipelineStats::add(&self.stats.transient_failures, 1);
        self.stats.record_sync_failure(error.to_string());
        let attempt = attempt + 1;

        if self.identity.as_ref() != Some(&identity) {
            PipelineStats::add(&self.stats.samples_discarded, n);
            tracing::warn!(error = %error, samples = n, "flush failed after identity change; samples discarded");
            return;
        }
        if self.config.retry.exhausted(attempt) {
            PipelineStats::add(&self.stats.samples_discarded, n);
            tracing::warn!(error = %error, samples = n, attempts = attempt, "retry budget exhausted; samples discarded");
            return;
        }

        // Merge forward: the failed samples go in front of the next batch to be sent
        match self.pending.front_mut() {
            Some(next) if next.identity == identity => {
                next.batch.prepend(batch);
                next.attempt = next.attempt.max(attempt);
            }
            _ => {
                let evicted = self.buffer.requeue(batch);
                if evicted > 0 {
                    PipelineStats::add(&self.stats.samples_evicted, evicted as u64);
                    tracing::warn!(evicted, "buffer overflow while requeueing failed batch");
                }
                self.carry_attempt = self.carry_attempt.max(attempt);
            }
        }

        let delay = if matches!(error, PersistError::Unauthenticated) {
            Duration::ZERO
        } else {
            self.config.retry.jittered_backoff(attempt)
        };
        self.retry_at = Some(Instant::now() + delay);
        tracing::warn!(error = %error, samples = n, attempt, retry_in_ms = delay.as_millis() as u64, "flush failed; will retry");
    }

    fn on_retry_due(&mut self) {
        self.retry_at = None;
        if self.pending.is_empty() && self.sampling_enabled() {
            self.enqueue_drain(FlushTrigger::Forced(ForceCause::Retry));
        }
        self.dispatch();
    }

    fn on_auth_change(&mut self, auth: AuthState, tick: &mut Interval) {
        let next = auth
            .identity()
            .map(|i| i.with_device(self.sampler.device_id()));
        if next == self.identity {
            return;
        }

        if let Some(prev) = self.identity.take() {
            // Flush-and-reset: the outgoing identity keeps its own samples
            self.retry_at = None;
            if let Some(batch) = self.buffer.force_flush_now(ForceCause::IdentityChange) {
                tracing::info!(samples = batch.len(), user_id = %prev.user_id, "identity change; flushing buffered samples");
                self.pending.push_back(Outbound {
                    batch,
                    identity: prev,
                    attempt: std::mem::take(&mut self.carry_attempt),
                });
            }
        } else {
            let stale = self.buffer.clear();
            if stale > 0 {
                PipelineStats::add(&self.stats.samples_discarded, stale as u64);
                tracing::warn!(samples = stale, "buffered samples without identity discarded");
            }
        }
        self.carry_attempt = 0;

        match &next {
            Some(identity) => {
                tracing::info!(user_id = %identity.user_id, "authenticated; sampling");
                tick.reset();
            }
            None => tracing::info!("signed out; sampling paused"),
        }
        self.identity = next;
        self.dispatch();
    }

    fn on_connectivity_change(&mut self, online: bool, tick: &mut Interval) {
        if online {
            if self.offline_since.take().is_some() {
                tracing::info!("connectivity restored");
            }
            if self.idle_for_connectivity {
                self.idle_for_connectivity = false;
                tick.reset();
                if !self.buffer.is_empty() {
                    self.flush_now(ForceCause::Retry);
                }
            }
        } else if self.offline_since.is_none() {
            tracing::warn!(
                grace_secs = self.config.connectivity_grace.as_secs(),
                "connectivity lost"
            );
            self.offline_since = Some(Instant::now());
        }
        self.update_state();
    }

    fn on_grace_expired(&mut self) {
        tracing::warn!("offline past grace period; pausing sampling");
        // Identity is still valid: attempt the flush; a failure merges back and waits
        self.flush_now(ForceCause::ConnectivityLoss);
        self.idle_for_connectivity = true;
        self.update_state();
    }

    /// Best-effort final flush bounded by shutdown_timeout; anything left is counted as lost.
    async fn shutdown(mut self) {
        let deadline = Instant::now() + self.config.shutdown_timeout;
        tracing::debug!("scheduler shutting down");

        match self.identity.clone() {
            Some(identity) => {
                if let Some(batch) = self.buffer.force_flush_now(ForceCause::Shutdown) {
                    self.pending.push_back(Outbound {
                        batch,
                        identity,
                        attempt: 0,
                    });
                }
            }
            None => {
                let n = self.buffer.clear();
                if n > 0 {
                    PipelineStats::add(&self.stats.samples_discarded, n as u64);
                    tracing::warn!(samples = n, "no identity at shutdown; buffered samples discarded");
                }
            }
        }

        if let Some(mut handle) = self.inflight.take() {
            match timeout_at(deadline, &mut handle).await {
                Ok(Ok((_, _, outcome))) => self.record_final(outcome),
                Ok(Err(e)) => {
                    self.record_lost(self.inflight_len, &format!("persist task failed: {e}"))
                }
                Err(_) => {
                    handle.abort();
                    self.record_lost(self.inflight_len, "in-flight persist timed out");
                }
            }
        }

        while let Some(out) = self.pending.pop_front() {
            let n = out.batch.len();
            match timeout_at(deadline, self.gateway.persist(out.batch, Some(&out.identity))).await
            {
                Ok(outcome) => self.record_final(outcome),
                Err(_) => self.record_lost(n, "shutdown timeout"),
            }
        }

        self.state_tx.send_replace(PipelineState::Stopped);
        tracing::info!("scheduler stopped");
    }

    fn record_final(&self, outcome: PersistOutcome) {
        match outcome {
            Ok(receipt) => {
                PipelineStats::add(&self.stats.samples_saved, receipt.count as u64);
                PipelineStats::add(&self.stats.batches_saved, 1);
                self.stats.record_sync_ok();
            }
            Err(failure) => {
                let n = failure.batch.len();
                if let PersistError::RejectedByStore(_) = failure.error {
                    PipelineStats::add(&self.stats.batches_rejected, 1);
                    PipelineStats::add(&self.stats.samples_rejected, n as u64);
                    self.stats.record_sync_failure(failure.error.to_string());
                    tracing::error!(error = %failure.error, samples = n, "final batch rejected by store");
                } else {
                    self.record_lost(n, &failure.error.to_string());
                }
            }
        }
    }

    fn record_lost(&self, samples: usize, reason: &str) {
        if samples == 0 {
            return;
        }
        PipelineStats::add(&self.stats.samples_lost_on_shutdown, samples as u64);
        self.stats.record_sync_failure(reason.to_string());
        tracing::error!(samples, reason, "samples lost at shutdown");
    }
}
