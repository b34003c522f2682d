//! Storage layer for host samples, alert rules and incidents.
//!
//! Samples go to daily time-partitioned SQLite databases in WAL mode
//! ([`engine::SqliteSampleStore`]). Hosts, alert rules and incidents live in
//! the management database ([`store::ManagementStore`], SeaORM), whose schema
//! is maintained by the `migration` crate.

pub mod engine;
pub mod entities;
pub mod error;
pub mod partition;
pub mod store;


use anyhow::Result;
use chrono::{DateTime, Utc};
use hostwatch_common::types::{MetricSample, SampleKind};

pub use engine::SqliteSampleStore;
pub use store::ManagementStore;

/// Parameters for a time-range sample query, scoped to one host and table.
/// `to: None` leaves the range open-ended.
///
/// # Examples
///
/// ```
/// use hostwatch_common::types::SampleKind;
/// use hostwatch_storage::SampleQuery;
/// use chrono::{Duration, Utc};
///
/// let now = Utc::now();
/// let query = SampleQuery {
///     host_uuid: "3f0c2a9e".into(),
///     kind: SampleKind::Disk,
///     from: now - Duration::minutes(10),
///     to: Some(now),
/// };
/// assert_eq!(query.kind.table(), "disks");
/// ```
pub struct SampleQuery {
    pub host_uuid: String,
    pub kind: SampleKind,
    pub from: DateTime<Utc>,
    pub to: Option<DateTime<Utc>>,
}

/// Persistence backend for metric samples.
///
/// Implementations must be safe to share across threads (`Send + Sync`)
/// because one store is read by every per-host evaluation task.
pub trait SampleStorage: Send + Sync {
    /// Appends samples. Rows are written to the partition of their
    /// `created_at` day.
    fn write_samples(&self, samples: &[MetricSample]) -> Result<()>;

    /// Samples matching the query, oldest first.
    fn query(&self, query: &SampleQuery) -> Result<Vec<MetricSample>>;

    /// Capture time of the newest sample of any table for the host.
    fn latest_sample_time(&self, host_uuid: &str) -> Result<Option<DateTime<Utc>>>;

    /// Removes partitions older than `retention_days`. Returns the number of
    /// partitions removed.
    fn cleanup(&self, retention_days: u32) -> Result<u32>;

    /// Returns partition (daily database) information.
    fn list_partitions(&self) -> Result<Vec<PartitionInfo>>;
}

/// Information about a storage partition (daily SQLite database).
#[derive(Debug, Clone, serde::Serialize)]
pub struct PartitionInfo {
    pub date: String,
    pub size_bytes: u64,
    pub path: String,
}
