// One instantaneous reading of the host

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metrics as read from the source, before validation and derivation.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMetrics {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub gpu_usage: f64,
    pub disk_usage: f64,
    /// MB/s
    pub disk_read_speed: f64,
    /// MB/s
    pub disk_write_speed: f64,
    /// MB/s
    pub network_download: f64,
    /// MB/s
    pub network_upload: f64,
}

/// Immutable once built by the sampler. Percentages are in [0,100]; rates and
/// the derived bottles figure are >= 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub gpu_usage: f64,
    pub disk_usage: f64,
    pub disk_read_speed: f64,
    pub disk_write_speed: f64,
    pub network_download: f64,
    pub network_upload: f64,
    pub water_bottles_equivalent: f64,
}

impl Sample {
    pub fn from_metrics(
        device_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        m: &RawMetrics,
        water_bottles_equivalent: f64,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp,
            cpu_usage: m.cpu_usage,
            memory_usage: m.memory_usage,
            gpu_usage: m.gpu_usage,
            disk_usage: m.disk_usage,
            disk_read_speed: m.disk_read_speed,
            disk_write_speed: m.disk_write_speed,
            network_download: m.network_download,
            network_upload: m.network_upload,
            water_bottles_equivalent,
        }
    }

    /// Timestamp as stored (unix millis).
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}
