// Persistence gateway: delivers one batch under one identity, plus the read paths.
// Never keeps a batch past a single attempt; on failure the batch goes back to the caller.

use crate::buffer::Batch;
use crate::models::{DeviceStats, HistoryFilter, HourlyBucket, Identity, Sample};
use crate::store::{RemoteStore, StoreError};
use chrono::Utc;
use std::sync::Arc;
use tracing::instrument;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PersistError {
    /// Precondition: empty batches never reach the store.
    #[error("refusing to persist an empty batch")]
    EmptyBatch,
    #[error("no authenticated identity")]
    Unauthenticated,
    #[error("transient store error: {0}")]
    TransientStore(String),
    #[error("batch rejected by store: {0}")]
    RejectedByStore(String),
}

impl From<StoreError> for PersistError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(m) => PersistError::TransientStore(m),
            StoreError::Rejected(m) => PersistError::RejectedByStore(m),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistReceipt {
    pub count: usize,
}

/// Failed attempt; the batch is handed back untouched.
#[derive(Debug)]
pub struct PersistFailure {
    pub batch: Batch,
    pub error: PersistError,
}

pub type PersistOutcome = Result<PersistReceipt, PersistFailure>;

pub struct PersistenceGateway<S> {
    store: Arc<S>,
}

impl<S> Clone for PersistenceGateway<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: RemoteStore> PersistenceGateway<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// At-least-once: the batch counts as consumed only on an acknowledged insert.
    /// A retry after an ambiguous failure may deliver rows twice.
    #[instrument(skip_all, fields(operation = "persist", batch_len = batch.len(), trigger = ?batch.trigger()))]
    pub async fn persist(&self, batch: Batch, identity: Option<&Identity>) -> PersistOutcome {
        if batch.is_empty() {
            return Err(PersistFailure {
                batch,
                error: PersistError::EmptyBatch,
            });
        }
        let Some(identity) = identity else {
            return Err(PersistFailure {
                batch,
                error: PersistError::Unauthenticated,
            });
        };
        match self
            .store
            .insert_samples(&identity.user_id, batch.samples())
            .await
        {
            Ok(_) => Ok(PersistReceipt { count: batch.len() }),
            Err(e) => Err(PersistFailure {
                batch,
                error: e.into(),
            }),
        }
    }

    /// Newest first. Empty when signed out or when the identity has no rows.
    /// The identity's device scopes the query when the filter names none.
    pub async fn fetch_history(
        &self,
        identity: Option<&Identity>,
        filter: &HistoryFilter,
    ) -> Result<Vec<Sample>, PersistError> {
        let Some(identity) = identity else {
            return Ok(Vec::new());
        };
        let mut filter = filter.clone();
        if filter.device_id.is_none() {
            filter.device_id = identity.device_id.clone();
        }
        Ok(self.store.query_samples(&identity.user_id, &filter).await?)
    }

    /// Summary statistics for the trailing window, computed by the store.
    pub async fn fetch_aggregates(
        &self,
        identity: Option<&Identity>,
        device_id: &str,
        window_hours: u32,
    ) -> Result<Option<DeviceStats>, PersistError> {
        let identity = identity.ok_or(PersistError::Unauthenticated)?;
        let to = Utc::now();
        let from = to - chrono::Duration::hours(window_hours as i64);
        Ok(self
            .store
            .device_stats(&identity.user_id, device_id, from, to)
            .await?)
    }

    /// Hourly buckets for the trailing window, computed by the store.
    pub async fn fetch_hourly(
        &self,
        identity: Option<&Identity>,
        device_id: &str,
        hours: u32,
    ) -> Result<Vec<HourlyBucket>, PersistError> {
        let Some(identity) = identity else {
            return Ok(Vec::new());
        };
        Ok(self
            .store
            .hourly_device_performance(&identity.user_id, device_id, hours)
            .await?)
    }
}
