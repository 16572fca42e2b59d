// Data store boundary. The gateway talks to this trait; SqliteStore is the bundled backend.

pub mod aggregation;
mod sqlite;

pub use sqlite::SqliteStore;

use crate::models::{DeviceStats, HistoryFilter, HourlyBucket, Sample};
use chrono::{DateTime, Utc};
use std::future::Future;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Network/IO/pool trouble; the same request may succeed later.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store refused the rows (constraint/validation); retrying will not help.
    #[error("store rejected request: {0}")]
    Rejected(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        use sqlx::error::ErrorKind;
        match &e {
            sqlx::Error::Database(db) => match db.kind() {
                ErrorKind::CheckViolation
                | ErrorKind::NotNullViolation
                | ErrorKind::UniqueViolation
                | ErrorKind::ForeignKeyViolation => StoreError::Rejected(db.message().to_string()),
                _ => StoreError::Unavailable(e.to_string()),
            },
            _ => StoreError::Unavailable(e.to_string()),
        }
    }
}

/// Insert/query/aggregate surface of the data store. Rows are keyed by user id; samples
/// carry their own device id and timestamp.
pub trait RemoteStore: Send + Sync + 'static {
    /// Inserts all rows or none. Returns rows written.
    fn insert_samples(
        &self,
        user_id: &str,
        samples: &[Sample],
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Newest first, honoring device/time filters and the row limit.
    fn query_samples(
        &self,
        user_id: &str,
        filter: &HistoryFilter,
    ) -> impl Future<Output = Result<Vec<Sample>, StoreError>> + Send;

    /// Summary statistics in [from, to]; `None` when there are no rows.
    fn device_stats(
        &self,
        user_id: &str,
        device_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> impl Future<Output = Result<Option<DeviceStats>, StoreError>> + Send;

    /// Hourly buckets over the trailing `hours`, oldest first.
    fn hourly_device_performance(
        &self,
        user_id: &str,
        device_id: &str,
        hours: u32,
    ) -> impl Future<Output = Result<Vec<HourlyBucket>, StoreError>> + Send;

    /// Cheap reachability check for the connectivity probe.
    fn ping(&self) -> impl Future<Output = Result<(), StoreError>> + Send;
}
