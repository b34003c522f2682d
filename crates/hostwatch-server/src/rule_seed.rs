use anyhow::{Context, Result};
use hostwatch_alert::AlertUpsert;
use hostwatch_common::alert::{AlertsConfig, HostTargeted};
use std::path::Path;
use walkdir::WalkDir;

use crate::state::AppState;

/// Counts of one seeding run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub created: usize,
    pub updated: usize,
    /// Documents aimed at hosts that are not registered.
    pub skipped: usize,
    /// (document, host) pairs that failed validation.
    pub rejected: usize,
}

fn read_seed(path: &Path, target: HostTargeted) -> Result<AlertsConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read seed file '{}'", path.display()))?;
    let mut config: AlertsConfig = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse seed file '{}'", path.display()))?;
    tracing::debug!(file = %path.display(), target = ?target, "Loaded alert seed");
    config.host_targeted = Some(target);
    Ok(config)
}

/// Reads the seed documents of a rules directory.
///
/// JSON files directly inside `dir` target every host. Files one level down,
/// in a directory named after a host uuid, target only that host. Deeper
/// entries are ignored.
pub fn load_seed_dir(dir: &Path) -> Result<Vec<AlertsConfig>> {
    let mut configs = Vec::new();
    let walker = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(2)
        .sort_by_file_name();

    for entry in walker {
        let entry = entry
            .with_context(|| format!("Failed to read rules directory '{}'", dir.display()))?;
        let path = entry.path();
        if !entry.file_type().is_file() || path.extension().map_or(true, |ext| ext != "json") {
            continue;
        }

        let target = if entry.depth() == 1 {
            HostTargeted::All
        } else {
            let host = path
                .parent()
                .and_then(|p| p.file_name())
                .and_then(|n| n.to_str());
            let Some(host_uuid) = host else {
                tracing::warn!(file = %path.display(), "Skipping seed in a non UTF-8 host directory");
                continue;
            };
            HostTargeted::Specific(host_uuid.to_string())
        };
        configs.push(read_seed(path, target)?);
    }
    Ok(configs)
}

/// Turns seed documents into rules for the known hosts.
///
/// Every document becomes one rule per targeted host. Seeding again updates
/// the matching rules instead of duplicating them.
pub async fn apply_seeds(state: &AppState, configs: &[AlertsConfig]) -> Result<SeedReport> {
    let hosts = state.store.list_hosts().await?;
    let cid = state.config.cluster_id;
    let mut report = SeedReport::default();

    for config in configs {
        let targets: Vec<_> = match &config.host_targeted {
            None | Some(HostTargeted::All) => hosts.iter().collect(),
            Some(HostTargeted::Specific(uuid)) => {
                hosts.iter().filter(|h| &h.uuid == uuid).collect()
            }
        };
        if targets.is_empty() {
            tracing::warn!(name = %config.name, target = ?config.host_targeted, "No registered host for alert seed");
            report.skipped += 1;
            continue;
        }

        for host in targets {
            let request = AlertUpsert {
                id: None,
                changes: config.to_changes(&host.uuid, &host.hostname, cid),
            };
            match state.upsert_alert(request).await {
                Ok(upserted) if upserted.created => report.created += 1,
                Ok(_) => report.updated += 1,
                Err(e) => {
                    tracing::warn!(name = %config.name, host_uuid = %host.uuid, error = %e, "Rejected alert seed");
                    report.rejected += 1;
                }
            }
        }
    }

    tracing::info!(
        created = report.created,
        updated = report.updated,
        skipped = report.skipped,
        rejected = report.rejected,
        "Alert seeds applied"
    );
    Ok(report)
}
