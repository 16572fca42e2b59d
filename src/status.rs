// Pipeline counters shared with the status API and the periodic stats log.

use crate::models::Sample;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    /// No identity (or offline past the grace period); not sampling.
    Idle,
    Sampling,
    /// A persist is in flight; sampling continues.
    Flushing,
    Stopped,
}

/// Every way a sample can leave the pipeline ends up in one of these counters.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub samples_collected: AtomicU64,
    pub samples_saved: AtomicU64,
    pub sample_errors: AtomicU64,
    pub samples_evicted: AtomicU64,
    pub samples_discarded: AtomicU64,
    pub samples_rejected: AtomicU64,
    pub samples_lost_on_shutdown: AtomicU64,
    pub batches_saved: AtomicU64,
    pub batches_rejected: AtomicU64,
    pub transient_failures: AtomicU64,
    pub anomalies: AtomicU64,
    last_sync_failed: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl PipelineStats {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_sync_ok(&self) {
        self.last_sync_failed.store(false, Ordering::Relaxed);
    }

    pub fn record_sync_failure(&self, error: impl Into<String>) {
        self.last_sync_failed.store(true, Ordering::Relaxed);
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(error.into());
        }
    }

    pub fn last_sync_failed(&self) -> bool {
        self.last_sync_failed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, state: PipelineState, buffered: usize) -> StatusSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatusSnapshot {
            state,
            buffered,
            samples_collected: load(&self.samples_collected),
            samples_saved: load(&self.samples_saved),
            sample_errors: load(&self.sample_errors),
            samples_evicted: load(&self.samples_evicted),
            samples_discarded: load(&self.samples_discarded),
            samples_rejected: load(&self.samples_rejected),
            samples_lost_on_shutdown: load(&self.samples_lost_on_shutdown),
            batches_saved: load(&self.batches_saved),
            batches_rejected: load(&self.batches_rejected),
            transient_failures: load(&self.transient_failures),
            anomalies: load(&self.anomalies),
            last_sync_failed: self.last_sync_failed(),
            last_error: self.last_error.lock().ok().and_then(|g| g.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub state: PipelineState,
    pub buffered: usize,
    pub samples_collected: u64,
    pub samples_saved: u64,
    pub sample_errors: u64,
    pub samples_evicted: u64,
    pub samples_discarded: u64,
    pub samples_rejected: u64,
    pub samples_lost_on_shutdown: u64,
    pub batches_saved: u64,
    pub batches_rejected: u64,
    pub transient_failures: u64,
    pub anomalies: u64,
    pub last_sync_failed: bool,
    pub last_error: Option<String>,
}

/// Last N samples for the realtime chart (one minute at the default cadence).
#[derive(Debug)]
pub struct RecentSamples {
    capacity: usize,
    samples: Mutex<VecDeque<Sample>>,
}

impl RecentSamples {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn push(&self, sample: Sample) {
        if let Ok(mut guard) = self.samples.lock() {
            if guard.len() >= self.capacity {
                guard.pop_front();
            }
            guard.push_back(sample);
        }
    }

    /// Oldest first.
    pub fn to_vec(&self) -> Vec<Sample> {
        self.samples
            .lock()
            .map(|g| g.iter().cloned().collect())
            .unwrap_or_default()
    }
}
