// Sampler: one validated Sample per tick from a MetricsSource.
// Cadence belongs to the scheduler; this module only reads "now".

mod linux;
mod sysinfo_source;

pub use sysinfo_source::SysinfoSource;

use crate::models::{RawMetrics, Sample};
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

/// Rates above this (MB/s) are treated as bogus counter jumps and rejected.
pub const MAX_RATE_MB_S: f64 = 1000.0;

/// Estimated draw at 100% load, in watts.
const CPU_MAX_WATTS: f64 = 95.0;
const RAM_MAX_WATTS: f64 = 15.0;
const GPU_MAX_WATTS: f64 = 150.0;
const DISK_MAX_WATTS: f64 = 10.0;
/// Litres of water used to produce one kWh.
const LITRES_PER_KWH: f64 = 0.25;
const LITRES_PER_BOTTLE: f64 = 0.5;

const CPU_SPIKE_PERCENT: f64 = 80.0;
const MEMORY_SPIKE_PERCENT: f64 = 85.0;
const DISK_FULL_PERCENT: f64 = 95.0;

#[derive(Debug, thiserror::Error)]
pub enum SamplerError {
    #[error("metrics unavailable: {0}")]
    MetricsUnavailable(String),
}

/// Host metrics reader. Polled by the sampler once per tick.
pub trait MetricsSource: Send + Sync {
    fn read(&self, device_id: &str) -> Result<RawMetrics, SamplerError>;
}

impl<T: MetricsSource + ?Sized> MetricsSource for std::sync::Arc<T> {
    fn read(&self, device_id: &str) -> Result<RawMetrics, SamplerError> {
        (**self).read(device_id)
    }
}

/// Reading that warrants an immediate flush.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Anomaly {
    CpuSpike(f64),
    MemorySpike(f64),
    DiskFull(f64),
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Anomaly::CpuSpike(v) => write!(f, "cpu_spike ({v:.1}%)"),
            Anomaly::MemorySpike(v) => write!(f, "memory_spike ({v:.1}%)"),
            Anomaly::DiskFull(v) => write!(f, "disk_full ({v:.1}%)"),
        }
    }
}

pub struct Sampler<M> {
    source: M,
    device_id: String,
    tick_interval: Duration,
}

impl<M: MetricsSource> Sampler<M> {
    pub fn new(source: M, device_id: impl Into<String>, tick_interval: Duration) -> Self {
        Self {
            source,
            device_id: device_id.into(),
            tick_interval,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Reads the source once. Either a complete Sample or an error; never partial.
    pub fn sample_once(&self, now: DateTime<Utc>) -> Result<Sample, SamplerError> {
        let raw = self.source.read(&self.device_id)?;
        let clean = sanitize(&raw)?;
        let bottles = water_bottles_equivalent(&clean, self.tick_interval);
        Ok(Sample::from_metrics(
            self.device_id.clone(),
            now,
            &clean,
            bottles,
        ))
    }
}

/// Rejects a reading with any value outside its range: percentages in [0, 100],
/// rates in [0, MAX_RATE_MB_S]. NaN and infinities never pass.
pub fn sanitize(raw: &RawMetrics) -> Result<RawMetrics, SamplerError> {
    let fields = [
        ("cpu_usage", raw.cpu_usage, 100.0),
        ("memory_usage", raw.memory_usage, 100.0),
        ("gpu_usage", raw.gpu_usage, 100.0),
        ("disk_usage", raw.disk_usage, 100.0),
        ("disk_read_speed", raw.disk_read_speed, MAX_RATE_MB_S),
        ("disk_write_speed", raw.disk_write_speed, MAX_RATE_MB_S),
        ("network_download", raw.network_download, MAX_RATE_MB_S),
        ("network_upload", raw.network_upload, MAX_RATE_MB_S),
    ];
    for (name, value, max) in fields {
        if !(0.0..=max).contains(&value) {
            return Err(SamplerError::MetricsUnavailable(format!(
                "{name} out of range: {value}"
            )));
        }
    }
    Ok(*raw)
}

/// Bottles of water (0.5 L) behind the energy drawn over `interval` at this load.
pub fn water_bottles_equivalent(m: &RawMetrics, interval: Duration) -> f64 {
    let watts = (m.cpu_usage / 100.0) * CPU_MAX_WATTS
        + (m.memory_usage / 100.0) * RAM_MAX_WATTS
        + (m.gpu_usage / 100.0) * GPU_MAX_WATTS
        + (m.disk_usage / 100.0) * DISK_MAX_WATTS;
    let kwh = watts * interval.as_secs_f64() / (1000.0 * 3600.0);
    (kwh * LITRES_PER_KWH / LITRES_PER_BOTTLE).max(0.0)
}

/// First threshold crossed, checked in cpu, memory, disk order.
pub fn detect_anomaly(sample: &Sample) -> Option<Anomaly> {
    if sample.cpu_usage > CPU_SPIKE_PERCENT {
        Some(Anomaly::CpuSpike(sample.cpu_usage))
    } else if sample.memory_usage > MEMORY_SPIKE_PERCENT {
        Some(Anomaly::MemorySpike(sample.memory_usage))
    } else if sample.disk_usage > DISK_FULL_PERCENT {
        Some(Anomaly::DiskFull(sample.disk_usage))
    } else {
        None
    }
}
