// SQLite-backed store. Row CHECKs mirror the Sample invariants so bad rows are
// rejected by the store itself.

use super::{RemoteStore, StoreError, aggregation};
use crate::models::{DeviceStats, HistoryFilter, HourlyBucket, Sample};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::path::Path;
use std::str::FromStr;
use tracing::instrument;

const SAMPLE_COLUMNS: &str = "device_id, timestamp, cpu_usage, memory_usage, gpu_usage, disk_usage, \
     disk_read_speed, disk_write_speed, network_download, network_upload, water_bottles_equivalent";

pub struct SqliteStore {
    pool: SqlitePool,
    retention_ms: i64,
}

impl SqliteStore {
    pub async fn connect(
        path: &str,
        max_pool_size: u32,
        retention_days: u32,
    ) -> anyhow::Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}", path))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_pool_size)
            .connect_with(opts)
            .await?;
        let retention_ms = (retention_days as i64) * 24 * 60 * 60 * 1000;
        Ok(Self { pool, retention_ms })
    }

    pub async fn init(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS performance_samples (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                device_id TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                cpu_usage REAL NOT NULL CHECK (cpu_usage BETWEEN 0 AND 100),
                memory_usage REAL NOT NULL CHECK (memory_usage BETWEEN 0 AND 100),
                gpu_usage REAL NOT NULL CHECK (gpu_usage BETWEEN 0 AND 100),
                disk_usage REAL NOT NULL CHECK (disk_usage BETWEEN 0 AND 100),
                disk_read_speed REAL NOT NULL CHECK (disk_read_speed >= 0),
                disk_write_speed REAL NOT NULL CHECK (disk_write_speed >= 0),
                network_download REAL NOT NULL CHECK (network_download >= 0),
                network_upload REAL NOT NULL CHECK (network_upload >= 0),
                water_bottles_equivalent REAL NOT NULL CHECK (water_bottles_equivalent >= 0)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_samples_user_device_ts ON performance_samples(user_id, device_id, timestamp)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_samples_timestamp ON performance_samples(timestamp)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Deletes rows older than the retention window. Returns rows removed.
    #[instrument(skip(self), fields(repo = "store", operation = "prune_old_data"))]
    pub async fn prune_old_data(&self) -> anyhow::Result<u64> {
        let cutoff = Utc::now().timestamp_millis() - self.retention_ms;
        let r = sqlx::query("DELETE FROM performance_samples WHERE timestamp < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(r.rows_affected())
    }

    /// Reclaim space after deletes (run periodically after pruning).
    #[instrument(skip(self), fields(repo = "store", operation = "vacuum"))]
    pub async fn vacuum(&self) -> anyhow::Result<()> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }

    pub(super) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn parse_sample_row(row: &SqliteRow) -> Result<Sample, StoreError> {
        let ts: i64 = row.try_get("timestamp")?;
        let timestamp = DateTime::<Utc>::from_timestamp_millis(ts)
            .ok_or_else(|| StoreError::Unavailable(format!("bad timestamp in row: {ts}")))?;
        Ok(Sample {
            device_id: row.try_get("device_id")?,
            timestamp,
            cpu_usage: row.try_get("cpu_usage")?,
            memory_usage: row.try_get("memory_usage")?,
            gpu_usage: row.try_get("gpu_usage")?,
            disk_usage: row.try_get("disk_usage")?,
            disk_read_speed: row.try_get("disk_read_speed")?,
            disk_write_speed: row.try_get("disk_write_speed")?,
            network_download: row.try_get("network_download")?,
            network_upload: row.try_get("network_upload")?,
            water_bottles_equivalent: row.try_get("water_bottles_equivalent")?,
        })
    }
}

impl RemoteStore for SqliteStore {
    #[instrument(skip(self, samples), fields(repo = "store", operation = "insert_samples", samples_count = samples.len()))]
    async fn insert_samples(&self, user_id: &str, samples: &[Sample]) -> Result<u64, StoreError> {
        if samples.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        for s in samples {
            sqlx::query(
                "INSERT INTO performance_samples (user_id, device_id, timestamp, cpu_usage, memory_usage, gpu_usage, disk_usage, disk_read_speed, disk_write_speed, network_download, network_upload, water_bottles_equivalent) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
            )
            .bind(user_id)
            .bind(&s.device_id)
            .bind(s.timestamp_ms())
            .bind(s.cpu_usage)
            .bind(s.memory_usage)
            .bind(s.gpu_usage)
            .bind(s.disk_usage)
            .bind(s.disk_read_speed)
            .bind(s.disk_write_speed)
            .bind(s.network_download)
            .bind(s.network_upload)
            .bind(s.water_bottles_equivalent)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(samples.len() as u64)
    }

    #[instrument(skip(self), fields(repo = "store", operation = "query_samples"))]
    async fn query_samples(
        &self,
        user_id: &str,
        filter: &HistoryFilter,
    ) -> Result<Vec<Sample>, StoreError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {SAMPLE_COLUMNS} FROM performance_samples WHERE user_id = "
        ));
        qb.push_bind(user_id);
        if let Some(device_id) = &filter.device_id {
            qb.push(" AND device_id = ").push_bind(device_id.clone());
        }
        if let Some(start) = filter.start {
            qb.push(" AND timestamp >= ").push_bind(start.timestamp_millis());
        }
        if let Some(end) = filter.end {
            qb.push(" AND timestamp <= ").push_bind(end.timestamp_millis());
        }
        qb.push(" ORDER BY timestamp DESC, id DESC LIMIT ")
            .push_bind(filter.limit as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::parse_sample_row).collect()
    }

    async fn device_stats(
        &self,
        user_id: &str,
        device_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<DeviceStats>, StoreError> {
        aggregation::device_stats(self, user_id, device_id, from, to).await
    }

    async fn hourly_device_performance(
        &self,
        user_id: &str,
        device_id: &str,
        hours: u32,
    ) -> Result<Vec<HourlyBucket>, StoreError> {
        let from = Utc::now() - chrono::Duration::hours(hours as i64);
        aggregation::hourly_buckets(self, user_id, device_id, from).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
