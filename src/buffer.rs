// Batch buffer: accumulates samples and decides when to flush.
// One producer appends; drains may come from elsewhere. All state sits behind one
// mutex so a drain takes everything appended before it and nothing after.

use crate::models::Sample;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tokio::time::{Duration, Instant};

/// One sample per second for five minutes.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 300;
pub const DEFAULT_MAX_BATCH_AGE: Duration = Duration::from_secs(5 * 60);
/// One hour at one sample per second.
pub const DEFAULT_MAX_BUFFERED_SAMPLES: usize = 3600;

/// Why a forced flush was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ForceCause {
    IdentityChange,
    ConnectivityLoss,
    Shutdown,
    UserRequest,
    Anomaly,
    Retry,
}

/// Why a batch was drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushTrigger {
    Size,
    Age,
    Forced(ForceCause),
}

#[derive(Debug, Clone)]
pub struct BufferConfig {
    pub max_batch_size: usize,
    pub max_batch_age: Duration,
    /// Hard ceiling; appending past it evicts the oldest sample.
    pub max_buffered_samples: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_batch_age: DEFAULT_MAX_BATCH_AGE,
            max_buffered_samples: DEFAULT_MAX_BUFFERED_SAMPLES,
        }
    }
}

/// Samples drained together, in capture order.
#[derive(Debug, Clone)]
pub struct Batch {
    samples: Vec<Sample>,
    opened_at: Instant,
    trigger: FlushTrigger,
}

impl Batch {
    pub fn new(samples: Vec<Sample>, opened_at: Instant, trigger: FlushTrigger) -> Self {
        Self {
            samples,
            opened_at,
            trigger,
        }
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<Sample> {
        self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// When the oldest sample in this batch entered the buffer.
    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    pub fn trigger(&self) -> FlushTrigger {
        self.trigger
    }

    /// Puts `earlier` in front of this batch's samples (merge-forward of a failed batch).
    pub fn prepend(&mut self, earlier: Batch) {
        let mut samples = earlier.samples;
        samples.append(&mut self.samples);
        self.samples = samples;
        self.opened_at = self.opened_at.min(earlier.opened_at);
    }

    /// Drops up to `n` of the oldest samples; returns how many went.
    /// `opened_at` is left as is, so the batch can only look older than it is.
    pub fn evict_oldest(&mut self, n: usize) -> usize {
        let n = n.min(self.samples.len());
        self.samples.drain(..n);
        n
    }
}

/// Result of one append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AppendOutcome {
    /// Threshold crossed by this append, if any.
    pub threshold: Option<FlushTrigger>,
    /// Oldest samples dropped to stay under the ceiling (data loss, not fatal).
    pub evicted: usize,
}

impl AppendOutcome {
    pub fn overflowed(&self) -> bool {
        self.evicted > 0
    }
}

/// Buffered samples with the instant each one entered the buffer, oldest first.
#[derive(Debug, Default)]
struct Inner {
    samples: VecDeque<(Instant, Sample)>,
}

impl Inner {
    fn opened_at(&self) -> Option<Instant> {
        self.samples.front().map(|(t, _)| *t)
    }
}

#[derive(Debug)]
pub struct BatchBuffer {
    config: BufferConfig,
    inner: Mutex<Inner>,
}

impl BatchBuffer {
    pub fn new(config: BufferConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    // A panic while holding the lock leaves the deque consistent, so keep using it.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn append(&self, sample: Sample, now: Instant) -> AppendOutcome {
        let mut inner = self.lock();
        let mut evicted = 0;
        while inner.samples.len() >= self.config.max_buffered_samples.max(1) {
            inner.samples.pop_front();
            evicted += 1;
        }
        inner.samples.push_back((now, sample));
        let opened_at = inner.opened_at().unwrap_or(now);

        let threshold = if inner.samples.len() >= self.config.max_batch_size {
            Some(FlushTrigger::Size)
        } else if now.saturating_duration_since(opened_at) >= self.config.max_batch_age {
            Some(FlushTrigger::Age)
        } else {
            None
        };
        AppendOutcome { threshold, evicted }
    }

    /// Age check without appending; `Some(Age)` once the oldest buffered sample is old enough.
    pub fn poll_age(&self, now: Instant) -> Option<FlushTrigger> {
        let opened_at = self.lock().opened_at()?;
        (now.saturating_duration_since(opened_at) >= self.config.max_batch_age)
            .then_some(FlushTrigger::Age)
    }

    /// Instant at which the age threshold fires; `None` when empty.
    pub fn age_deadline(&self) -> Option<Instant> {
        self.lock()
            .opened_at()
            .map(|t| t + self.config.max_batch_age)
    }

    /// Takes every buffered sample as one batch; `None` when empty.
    pub fn drain_for_flush(&self, trigger: FlushTrigger) -> Option<Batch> {
        let mut inner = self.lock();
        let opened_at = inner.opened_at()?;
        let samples: Vec<Sample> = inner.samples.drain(..).map(|(_, s)| s).collect();
        Some(Batch::new(samples, opened_at, trigger))
    }

    pub fn force_flush_now(&self, cause: ForceCause) -> Option<Batch> {
        self.drain_for_flush(FlushTrigger::Forced(cause))
    }

    /// Returns a failed batch to the head of the buffer, ahead of anything appended since.
    /// Its samples keep the batch's opening instant. Returns how many of the oldest
    /// samples were evicted to respect the ceiling.
    pub fn requeue(&self, batch: Batch) -> usize {
        if batch.is_empty() {
            return 0;
        }
        let mut inner = self.lock();
        let opened_at = batch.opened_at;
        let mut merged: VecDeque<(Instant, Sample)> = batch
            .samples
            .into_iter()
            .map(|s| (opened_at, s))
            .collect();
        merged.append(&mut inner.samples);
        let mut evicted = 0;
        while merged.len() > self.config.max_buffered_samples {
            merged.pop_front();
            evicted += 1;
        }
        inner.samples = merged;
        evicted
    }

    /// Drops everything buffered; returns how many samples were discarded.
    pub fn clear(&self) -> usize {
        let mut inner = self.lock();
        let n = inner.samples.len();
        inner.samples.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.lock().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().samples.is_empty()
    }
}

impl Default for BatchBuffer {
    fn default() -> Self {
        Self::new(BufferConfig::default())
    }
}
