// Store-side aggregation: summary stats and hourly buckets computed in SQL.
// Callers never recompute these locally.

use super::{SqliteStore, StoreError};
use crate::models::{DeviceStats, HourlyBucket};
use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::instrument;

pub const MS_PER_HOUR: i64 = 3_600_000;

#[instrument(skip(store), fields(repo = "store", operation = "device_stats"))]
pub(super) async fn device_stats(
    store: &SqliteStore,
    user_id: &str,
    device_id: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Option<DeviceStats>, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT COUNT(*) AS sample_count,
               AVG(cpu_usage) AS cpu_avg, MIN(cpu_usage) AS cpu_min, MAX(cpu_usage) AS cpu_max,
               AVG(memory_usage) AS memory_avg, MIN(memory_usage) AS memory_min, MAX(memory_usage) AS memory_max,
               AVG(gpu_usage) AS gpu_avg, MIN(gpu_usage) AS gpu_min, MAX(gpu_usage) AS gpu_max,
               AVG(disk_usage) AS disk_avg, MIN(disk_usage) AS disk_min, MAX(disk_usage) AS disk_max,
               AVG(disk_read_speed) AS disk_read_avg, MIN(disk_read_speed) AS disk_read_min, MAX(disk_read_speed) AS disk_read_max,
               AVG(disk_write_speed) AS disk_write_avg, MIN(disk_write_speed) AS disk_write_min, MAX(disk_write_speed) AS disk_write_max,
               AVG(network_download) AS network_download_avg, MIN(network_download) AS network_download_min, MAX(network_download) AS network_download_max,
               AVG(network_upload) AS network_upload_avg, MIN(network_upload) AS network_upload_min, MAX(network_upload) AS network_upload_max,
               TOTAL(water_bottles_equivalent) AS water_bottles_total
        FROM performance_samples
        WHERE user_id = $1 AND device_id = $2 AND timestamp >= $3 AND timestamp <= $4
        "#,
    )
    .bind(user_id)
    .bind(device_id)
    .bind(from.timestamp_millis())
    .bind(to.timestamp_millis())
    .fetch_one(store.pool())
    .await?;

    let sample_count: i64 = row.try_get("sample_count")?;
    if sample_count == 0 {
        return Ok(None);
    }
    let f = |col: &str| -> Result<f64, StoreError> {
        Ok(row.try_get::<Option<f64>, _>(col)?.unwrap_or(0.0))
    };
    Ok(Some(DeviceStats {
        device_id: device_id.to_string(),
        sample_count,
        cpu_avg: f("cpu_avg")?,
        cpu_min: f("cpu_min")?,
        cpu_max: f("cpu_max")?,
        memory_avg: f("memory_avg")?,
        memory_min: f("memory_min")?,
        memory_max: f("memory_max")?,
        gpu_avg: f("gpu_avg")?,
        gpu_min: f("gpu_min")?,
        gpu_max: f("gpu_max")?,
        disk_avg: f("disk_avg")?,
        disk_min: f("disk_min")?,
        disk_max: f("disk_max")?,
        disk_read_avg: f("disk_read_avg")?,
        disk_read_min: f("disk_read_min")?,
        disk_read_max: f("disk_read_max")?,
        disk_write_avg: f("disk_write_avg")?,
        disk_write_min: f("disk_write_min")?,
        disk_write_max: f("disk_write_max")?,
        network_download_avg: f("network_download_avg")?,
        network_download_min: f("network_download_min")?,
        network_download_max: f("network_download_max")?,
        network_upload_avg: f("network_upload_avg")?,
        network_upload_min: f("network_upload_min")?,
        network_upload_max: f("network_upload_max")?,
        water_bottles_total: f("water_bottles_total")?,
    }))
}

/// Buckets rows with timestamp >= from by UTC hour. Ascending by hour.
#[instrument(skip(store), fields(repo = "store", operation = "hourly_buckets"))]
pub(super) async fn hourly_buckets(
    store: &SqliteStore,
    user_id: &str,
    device_id: &str,
    from: DateTime<Utc>,
) -> Result<Vec<HourlyBucket>, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT (timestamp / $4) * $4 AS hour_start,
               COUNT(*) AS sample_count,
               AVG(cpu_usage) AS cpu_avg,
               AVG(memory_usage) AS memory_avg,
               AVG(gpu_usage) AS gpu_avg,
               AVG(disk_usage) AS disk_avg,
               TOTAL(water_bottles_equivalent) AS water_bottles_total
        FROM performance_samples
        WHERE user_id = $1 AND device_id = $2 AND timestamp >= $3
        GROUP BY hour_start
        ORDER BY hour_start ASC
        "#,
    )
    .bind(user_id)
    .bind(device_id)
    .bind(from.timestamp_millis())
    .bind(MS_PER_HOUR)
    .fetch_all(store.pool())
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let hour_ms: i64 = row.try_get("hour_start")?;
        let hour_start = DateTime::<Utc>::from_timestamp_millis(hour_ms)
            .ok_or_else(|| StoreError::Unavailable(format!("bad hour bucket: {hour_ms}")))?;
        out.push(HourlyBucket {
            hour_start,
            sample_count: row.try_get("sample_count")?,
            cpu_avg: row.try_get("cpu_avg")?,
            memory_avg: row.try_get("memory_avg")?,
            gpu_avg: row.try_get("gpu_avg")?,
            disk_avg: row.try_get("disk_avg")?,
            water_bottles_total: row.try_get("water_bottles_total")?,
        });
    }
    Ok(out)
}
