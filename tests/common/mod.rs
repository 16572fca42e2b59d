// Shared test helpers: scripted metrics source and in-memory store
#![allow(dead_code)]

use chrono::{DateTime, Utc};
use perfsync::models::{DeviceStats, HistoryFilter, HourlyBucket, RawMetrics, Sample};
use perfsync::sampler::{MetricsSource, SamplerError};
use perfsync::store::{RemoteStore, StoreError};
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

pub const DEVICE: &str = "test-device";

/// Sample whose `network_download` carries `seq`, so order survives the pipeline.
pub fn sample(seq: u64) -> Sample {
    sample_at(seq, Utc::now())
}

pub fn sample_at(seq: u64, timestamp: DateTime<Utc>) -> Sample {
    Sample::from_metrics(
        DEVICE,
        timestamp,
        &RawMetrics {
            cpu_usage: 10.0,
            memory_usage: 20.0,
            network_download: seq as f64,
            ..Default::default()
        },
        0.0,
    )
}

pub fn seqs(samples: &[Sample]) -> Vec<u64> {
    samples.iter().map(|s| s.network_download as u64).collect()
}

/// Metrics source that numbers its reads (1, 2, 3, ...) in `network_download`.
#[derive(Default)]
pub struct CountingSource {
    reads: AtomicU64,
    fail_on: Mutex<HashSet<u64>>,
    cpu: Mutex<Option<f64>>,
}

impl CountingSource {
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Read number `n` (1-based) returns an error.
    pub fn fail_on(&self, n: u64) {
        self.fail_on.lock().unwrap().insert(n);
    }

    pub fn set_cpu(&self, cpu: f64) {
        *self.cpu.lock().unwrap() = Some(cpu);
    }
}

impl MetricsSource for CountingSource {
    fn read(&self, _device_id: &str) -> Result<RawMetrics, SamplerError> {
        let n = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on.lock().unwrap().contains(&n) {
            return Err(SamplerError::MetricsUnavailable(format!("scripted failure {n}")));
        }
        let cpu = self.cpu.lock().unwrap().unwrap_or(10.0);
        Ok(RawMetrics {
            cpu_usage: cpu,
            memory_usage: 20.0,
            network_download: n as f64,
            ..Default::default()
        })
    }
}

/// In-memory store recording every acknowledged insert.
#[derive(Default)]
pub struct FakeStore {
    inserts: Mutex<Vec<(String, Vec<Sample>)>>,
    failures: Mutex<VecDeque<StoreError>>,
    insert_calls: AtomicUsize,
    delay: Mutex<Option<Duration>>,
    offline: AtomicBool,
}

impl FakeStore {
    /// The next insert calls fail with these errors, in order.
    pub fn fail_next(&self, errors: impl IntoIterator<Item = StoreError>) {
        self.failures.lock().unwrap().extend(errors);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }

    pub fn batches(&self) -> Vec<(String, Vec<Sample>)> {
        self.inserts.lock().unwrap().clone()
    }

    /// Every stored sample for `user_id`, in insert order.
    pub fn saved_for(&self, user_id: &str) -> Vec<Sample> {
        self.inserts
            .lock()
            .unwrap()
            .iter()
            .filter(|(u, _)| u == user_id)
            .flat_map(|(_, s)| s.iter().cloned())
            .collect()
    }
}

impl RemoteStore for FakeStore {
    async fn insert_samples(&self, user_id: &str, samples: &[Sample]) -> Result<u64, StoreError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        let failure = self.failures.lock().unwrap().pop_front();
        if let Some(e) = failure {
            return Err(e);
        }
        self.inserts
            .lock()
            .unwrap()
            .push((user_id.to_string(), samples.to_vec()));
        Ok(samples.len() as u64)
    }

    async fn query_samples(
        &self,
        user_id: &str,
        filter: &HistoryFilter,
    ) -> Result<Vec<Sample>, StoreError> {
        let mut rows: Vec<Sample> = self
            .saved_for(user_id)
            .into_iter()
            .filter(|s| filter.device_id.as_deref().is_none_or(|d| s.device_id == d))
            .filter(|s| filter.start.is_none_or(|t| s.timestamp >= t))
            .filter(|s| filter.end.is_none_or(|t| s.timestamp <= t))
            .collect();
        rows.reverse();
        rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        rows.truncate(filter.limit as usize);
        Ok(rows)
    }

    async fn device_stats(
        &self,
        _user_id: &str,
        _device_id: &str,
        _from: DateTime<Utc>,
        _to: DateTime<Utc>,
    ) -> Result<Option<DeviceStats>, StoreError> {
        Ok(None)
    }

    async fn hourly_device_performance(
        &self,
        _user_id: &str,
        _device_id: &str,
        _hours: u32,
    ) -> Result<Vec<HourlyBucket>, StoreError> {
        Ok(Vec::new())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("offline".into()))
        } else {
            Ok(())
        }
    }
}
