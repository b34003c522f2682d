use crate::partition::PartitionManager;
use crate::{PartitionInfo, SampleQuery, SampleStorage};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hostwatch_alert::{BoxError, SampleSource};
use hostwatch_common::types::{MetricSample, SampleData, SampleKind};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::StorageError;

pub struct SqliteSampleStore {
    partitions: PartitionManager,
}

impl SqliteSampleStore {
    pub fn new(data_dir: &Path) -> Result<Self> {
        Ok(Self {
            partitions: PartitionManager::new(data_dir)?,
        })
    }
}

fn decode_row(
    host_uuid: String,
    ts_ms: i64,
    payload: &str,
) -> std::result::Result<MetricSample, StorageError> {
    let created_at =
        DateTime::from_timestamp_millis(ts_ms).ok_or_else(|| StorageError::InvalidColumn {
            column: "created_at",
            value: ts_ms.to_string(),
        })?;
    let data: SampleData = serde_json::from_str(payload)?;
    Ok(MetricSample::new(host_uuid, created_at, data))
}

impl SampleStorage for SqliteSampleStore {
    fn write_samples(&self, samples: &[MetricSample]) -> Result<()> {
        let mut by_partition: BTreeMap<String, Vec<&MetricSample>> = BTreeMap::new();
        for sample in samples {
            let key = self.partitions.get_or_create(sample.created_at)?;
            by_partition.entry(key).or_default().push(sample);
        }

        for (key, rows) in by_partition {
            self.partitions.with_partition(&key, |conn| {
                let tx = conn.unchecked_transaction()?;
                {
                    let mut stmt = tx.prepare_cached(
                        "INSERT INTO samples (host_uuid, kind, created_at, payload) VALUES (?1, ?2, ?3, ?4)",
                    )?;
                    for sample in &rows {
                        let payload = serde_json::to_string(&sample.data)?;
                        stmt.execute(rusqlite::params![
                            &sample.host_uuid,
                            sample.kind().table(),
                            sample.created_at.timestamp_millis(),
                            payload,
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })?;
        }
        Ok(())
    }

    fn query(&self, query: &SampleQuery) -> Result<Vec<MetricSample>> {
        let keys = self.partitions.partitions_in_range(query.from, query.to)?;
        let mut results = Vec::new();
        let from_ms = query.from.timestamp_millis();
        let to_ms = query.to.map_or(i64::MAX, |t| t.timestamp_millis());

        for key in keys {
            self.partitions.with_partition(&key, |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT host_uuid, created_at, payload FROM samples
                     WHERE host_uuid = ?1 AND kind = ?2 AND created_at >= ?3 AND created_at <= ?4
                     ORDER BY created_at ASC",
                )?;
                let rows = stmt.query_map(
                    rusqlite::params![&query.host_uuid, query.kind.table(), from_ms, to_ms],
                    |row| {
                        let host_uuid: String = row.get(0)?;
                        let ts_ms: i64 = row.get(1)?;
                        let payload: String = row.get(2)?;
                        Ok((host_uuid, ts_ms, payload))
                    },
                )?;
                for row in rows {
                    let (host_uuid, ts_ms, payload) = row?;
                    match decode_row(host_uuid, ts_ms, &payload) {
                        Ok(sample) => results.push(sample),
                        Err(e) => {
                            tracing::warn!(
                                partition = %key,
                                created_at = ts_ms,
                                error = %e,
                                "Skipping undecodable sample row"
                            );
                        }
                    }
                }
                Ok(())
            })?;
        }

        results.sort_by_key(|s| s.created_at);
        Ok(results)
    }

    fn latest_sample_time(&self, host_uuid: &str) -> Result<Option<DateTime<Utc>>> {
        let infos = self.partitions.list_partition_info()?;
        // Newest partition first; the first one holding a row wins.
        for info in infos.iter().rev() {
            let Ok(date) = chrono::NaiveDate::parse_from_str(&info.date, "%Y-%m-%d") else {
                continue;
            };
            let start = date.and_time(chrono::NaiveTime::MIN).and_utc();
            let keys = self.partitions.partitions_in_range(start, Some(start))?;
            for key in keys {
                let latest: Option<i64> = self.partitions.with_partition(&key, |conn| {
                    let mut stmt = conn.prepare_cached(
                        "SELECT MAX(created_at) FROM samples WHERE host_uuid = ?1",
                    )?;
                    Ok(stmt.query_row(rusqlite::params![host_uuid], |row| row.get(0))?)
                })?;
                if let Some(ms) = latest {
                    return Ok(DateTime::from_timestamp_millis(ms));
                }
            }
        }
        Ok(None)
    }

    fn cleanup(&self, retention_days: u32) -> Result<u32> {
        self.partitions.cleanup_older_than(retention_days)
    }

    fn list_partitions(&self) -> Result<Vec<PartitionInfo>> {
        self.partitions.list_partition_info()
    }
}

#[async_trait]
impl SampleSource for SqliteSampleStore {
    async fn recent_samples(
        &self,
        host_uuid: &str,
        kind: SampleKind,
        since: DateTime<Utc>,
    ) -> std::result::Result<Vec<MetricSample>, BoxError> {
        let query = SampleQuery {
            host_uuid: host_uuid.to_string(),
            kind,
            from: since,
            to: None,
        };
        self.query(&query).map_err(BoxError::from)
    }
}
