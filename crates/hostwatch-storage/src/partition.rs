use crate::PartitionInfo;
use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const SAMPLES_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS samples (
    host_uuid TEXT NOT NULL,
    kind TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    payload TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_samples_host_kind_time
    ON samples(host_uuid, kind, created_at);
CREATE INDEX IF NOT EXISTS idx_samples_host_time
    ON samples(host_uuid, created_at);
";

/// One SQLite file per UTC day, named `YYYY-MM-DD.db`.
pub struct PartitionManager {
    data_dir: PathBuf,
    connections: Mutex<HashMap<String, Connection>>,
}

impl PartitionManager {
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            connections: Mutex::new(HashMap::new()),
        })
    }

    /// Lock the connections map, recovering from a poisoned Mutex if necessary.
    fn lock_connections(&self) -> MutexGuard<'_, HashMap<String, Connection>> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn partition_key(ts: DateTime<Utc>) -> String {
        ts.format("%Y-%m-%d").to_string()
    }

    fn partition_path(&self, key: &str) -> PathBuf {
        self.data_dir.join(format!("{key}.db"))
    }

    fn open(path: &Path) -> Result<Connection> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SAMPLES_SCHEMA)?;
        Ok(conn)
    }

    pub fn get_or_create(&self, ts: DateTime<Utc>) -> Result<String> {
        let key = Self::partition_key(ts);
        let mut conns = self.lock_connections();
        if !conns.contains_key(&key) {
            let conn = Self::open(&self.partition_path(&key))?;
            tracing::info!(partition = %key, "Created new partition");
            conns.insert(key.clone(), conn);
        }
        Ok(key)
    }

    pub fn with_partition<F, R>(&self, key: &str, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R>,
    {
        let conns = self.lock_connections();
        let conn = conns
            .get(key)
            .ok_or_else(|| anyhow::anyhow!("Partition {key} not found"))?;
        f(conn)
    }

    /// Keys of the partitions on disk dated from `from` to `to` (inclusive,
    /// open-ended when `to` is `None`), oldest first. Each is opened on demand.
    pub fn partitions_in_range(
        &self,
        from: DateTime<Utc>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<String>> {
        let from_date = from.date_naive();
        let to_date = to.map(|t| t.date_naive());
        let mut keys: Vec<String> = self
            .partition_dates()?
            .into_iter()
            .filter(|(date, _)| *date >= from_date && to_date.map_or(true, |to| *date <= to))
            .map(|(_, key)| key)
            .collect();
        keys.sort();

        let mut conns = self.lock_connections();
        for key in &keys {
            if !conns.contains_key(key) {
                let conn = Self::open(&self.partition_path(key))?;
                conns.insert(key.clone(), conn);
            }
        }
        Ok(keys)
    }

    fn partition_dates(&self) -> Result<Vec<(NaiveDate, String)>> {
        let mut dates = Vec::new();
        for entry in std::fs::read_dir(&self.data_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(date_str) = name.strip_suffix(".db") {
                if let Ok(date) = NaiveDate::parse_from_str(date_str, "%Y-%m-%d") {
                    dates.push((date, date_str.to_string()));
                }
            }
        }
        Ok(dates)
    }

    pub fn cleanup_older_than(&self, retention_days: u32) -> Result<u32> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
        let cutoff_date = cutoff.date_naive();
        let mut removed = 0u32;

        let expired: Vec<String> = self
            .partition_dates()?
            .into_iter()
            .filter(|(date, _)| *date < cutoff_date)
            .map(|(_, key)| key)
            .collect();

        // Best effort: a file that cannot be removed is logged and skipped.
        for key in &expired {
            // Dropping the connection checkpoints the WAL.
            self.lock_connections().remove(key.as_str());

            if let Err(e) = std::fs::remove_file(self.partition_path(key)) {
                tracing::error!(partition = %key, error = %e, "Failed to remove partition file");
                continue;
            }
            for suffix in ["db-wal", "db-shm"] {
                let path = self.data_dir.join(format!("{key}.{suffix}"));
                if path.exists() {
                    if let Err(e) = std::fs::remove_file(&path) {
                        tracing::warn!(path = %path.display(), error = %e, "Failed to remove WAL file");
                    }
                }
            }

            tracing::info!(partition = %key, "Removed expired partition");
            removed += 1;
        }

        Ok(removed)
    }

    /// Returns information about all existing partitions on disk.
    pub fn list_partition_info(&self) -> Result<Vec<PartitionInfo>> {
        let mut infos = Vec::new();
        for (_, key) in self.partition_dates()? {
            let path = self.partition_path(&key);
            let metadata = std::fs::metadata(&path)?;
            infos.push(PartitionInfo {
                date: key,
                size_bytes: metadata.len(),
                path: path.to_string_lossy().to_string(),
            });
        }
        infos.sort_by(|a, b| a.date.cmp(&b.date));
        Ok(infos)
    }
}
