// Domain models

mod identity;
mod sample;
mod stats;

pub use identity::{AuthState, Identity};
pub use sample::{RawMetrics, Sample};
pub use stats::{DEFAULT_HISTORY_LIMIT, DeviceStats, HistoryFilter, HourlyBucket};
