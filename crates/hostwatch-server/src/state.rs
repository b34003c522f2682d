use crate::config::ServerConfig;
use anyhow::Result;
use chrono::Duration;
use hostwatch_alert::{AlertEngine, AlertRegistry, AlertUpsert, Upserted};
use hostwatch_common::alert::Alert;
use hostwatch_common::types::{Host, MetricSample};
use hostwatch_storage::{ManagementStore, SampleStorage, SqliteSampleStore};
use std::path::Path;
use std::sync::Arc;

pub type Engine = AlertEngine<Arc<ManagementStore>>;

/// Everything a running server shares between the scheduler and the
/// command-line tools.
#[derive(Clone)]
pub struct AppState {
    pub samples: Arc<SqliteSampleStore>,
    pub store: Arc<ManagementStore>,
    pub registry: Arc<AlertRegistry>,
    pub engine: Arc<Engine>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    /// Opens both stores and loads the persisted alert rules.
    pub async fn build(config: ServerConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let samples = Arc::new(SqliteSampleStore::new(Path::new(&config.data_dir))?);
        let store = Arc::new(ManagementStore::new(&config.connection_url()).await?);

        let alerts = store.list_alerts().await?;
        let total = alerts.len();
        let (registry, rejected) = AlertRegistry::from_alerts(alerts);
        tracing::info!(
            loaded = total - rejected.len(),
            rejected = rejected.len(),
            "Alert rules loaded"
        );

        let max_lookback = Duration::from_std(std::time::Duration::from_secs(
            config.evaluation.max_lookback_secs,
        ))
        .unwrap_or_else(|_| Duration::days(365));
        let engine = Arc::new(AlertEngine::new(store.clone(), max_lookback));

        Ok(Self {
            samples,
            store,
            registry: Arc::new(registry),
            engine,
            config: Arc::new(config),
        })
    }

    /// Validates and publishes a rule change, then persists it. An invalid
    /// document leaves both the registry and the database untouched, and a
    /// failed write puts the registry back to its previous rule.
    pub async fn upsert_alert(&self, request: AlertUpsert) -> Result<Upserted> {
        let upserted = self.registry.upsert(request)?;
        if let Err(e) = self.store.save_alert(&upserted.alert).await {
            self.undo_rule_change(upserted.alert.id, upserted.previous.clone());
            return Err(e);
        }
        tracing::info!(
            rule_id = upserted.alert.id,
            name = %upserted.alert.name,
            host_uuid = %upserted.alert.host_uuid,
            created = upserted.created,
            "Alert rule saved"
        );
        Ok(upserted)
    }

    pub async fn set_alert_active(&self, id: i64, active: bool) -> Result<Alert> {
        let previous = self.registry.get(id);
        let alert = if active {
            self.registry.activate(id)?
        } else {
            self.registry.deactivate(id)?
        };
        if let Err(e) = self.store.save_alert(&alert).await {
            self.undo_rule_change(id, previous);
            return Err(e);
        }
        Ok(alert)
    }

    fn undo_rule_change(&self, id: i64, previous: Option<Alert>) {
        if let Err(e) = self.registry.restore(id, previous) {
            tracing::error!(rule_id = id, error = %e, "Failed to restore alert rule");
        }
    }

    pub async fn remove_alert(&self, id: i64) -> Result<bool> {
        let in_registry = self.registry.remove(id).is_some();
        let in_store = self.store.delete_alert(id).await?;
        Ok(in_registry || in_store)
    }

    /// Records an agent report: refreshes the host row and appends its
    /// samples.
    pub async fn ingest(&self, host: &Host, samples: &[MetricSample]) -> Result<()> {
        if let Some(foreign) = samples.iter().find(|s| s.host_uuid != host.uuid) {
            anyhow::bail!(
                "sample for host {} in a report from host {}",
                foreign.host_uuid,
                host.uuid
            );
        }
        self.store.upsert_host(host).await?;
        self.samples.write_samples(samples)?;
        tracing::debug!(host_uuid = %host.uuid, count = samples.len(), "Samples stored");
        Ok(())
    }
}
