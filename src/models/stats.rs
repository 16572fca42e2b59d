// Read-path models: history filter and store-side aggregates

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_HISTORY_LIMIT: u32 = 100;

fn default_limit() -> u32 {
    DEFAULT_HISTORY_LIMIT
}

/// Filters for the history query. Results are newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryFilter {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

impl Default for HistoryFilter {
    fn default() -> Self {
        Self {
            device_id: None,
            start: None,
            end: None,
            limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

/// Summary statistics over a window for one device (avg/min/max per metric).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStats {
    pub device_id: String,
    pub sample_count: i64,
    pub cpu_avg: f64,
    pub cpu_min: f64,
    pub cpu_max: f64,
    pub memory_avg: f64,
    pub memory_min: f64,
    pub memory_max: f64,
    pub gpu_avg: f64,
    pub gpu_min: f64,
    pub gpu_max: f64,
    pub disk_avg: f64,
    pub disk_min: f64,
    pub disk_max: f64,
    pub disk_read_avg: f64,
    pub disk_read_min: f64,
    pub disk_read_max: f64,
    pub disk_write_avg: f64,
    pub disk_write_min: f64,
    pub disk_write_max: f64,
    pub network_download_avg: f64,
    pub network_download_min: f64,
    pub network_download_max: f64,
    pub network_upload_avg: f64,
    pub network_upload_min: f64,
    pub network_upload_max: f64,
    pub water_bottles_total: f64,
}

/// One hour bucket of averages for the hourly chart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HourlyBucket {
    pub hour_start: DateTime<Utc>,
    pub sample_count: i64,
    pub cpu_avg: f64,
    pub memory_avg: f64,
    pub gpu_avg: f64,
    pub disk_avg: f64,
    pub water_bottles_total: f64,
}
