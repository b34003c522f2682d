//! Incident lifecycle: one open incident per (rule, host), opened on breach,
//! updated when severity moves, closed on recovery.
//!
//! The manager is the only writer of `status` and `resolved_at`. Operations
//! on the same host are serialized by a per-host lock, which also guards a
//! cache of the open incidents of that host.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hostwatch_common::alert::Alert;
use hostwatch_common::incident::{Incident, IncidentStatus, NewIncident};
use hostwatch_common::types::Severity;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::IncidentError;

/// Persistence for incident rows.
#[async_trait]
pub trait IncidentStore: Send + Sync {
    /// The incident of the pair with `resolved_at` unset, if any.
    async fn find_open(&self, alerts_id: i64, host_uuid: &str) -> Result<Option<Incident>, IncidentError>;

    /// Inserts a new open incident. Must fail with [`IncidentError::Conflict`]
    /// when the pair already has one.
    async fn insert(&self, incident: NewIncident) -> Result<Incident, IncidentError>;

    /// Writes back `result`, `severity`, `status`, `updated_at` and
    /// `resolved_at`.
    async fn update(&self, incident: &Incident) -> Result<(), IncidentError>;
}

#[async_trait]
impl<S: IncidentStore + ?Sized> IncidentStore for Arc<S> {
    async fn find_open(&self, alerts_id: i64, host_uuid: &str) -> Result<Option<Incident>, IncidentError> {
        (**self).find_open(alerts_id, host_uuid).await
    }

    async fn insert(&self, incident: NewIncident) -> Result<Incident, IncidentError> {
        (**self).insert(incident).await
    }

    async fn update(&self, incident: &Incident) -> Result<(), IncidentError> {
        (**self).update(incident).await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BreachOutcome {
    Opened(Incident),
    SeverityChanged { incident: Incident, previous: Severity },
    Unchanged(Incident),
}

impl BreachOutcome {
    pub fn incident(&self) -> &Incident {
        match self {
            BreachOutcome::Opened(i) | BreachOutcome::Unchanged(i) => i,
            BreachOutcome::SeverityChanged { incident, .. } => incident,
        }
    }
}

/// Known open incidents of one host, by rule id. `None` records that the
/// store has no open incident for the rule.
type OpenCache = Arc<Mutex<HashMap<i64, Option<Incident>>>>;

pub struct IncidentManager<S> {
    store: S,
    hosts: DashMap<String, OpenCache>,
}

impl<S: IncidentStore> IncidentManager<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            hosts: DashMap::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn host(&self, host_uuid: &str) -> OpenCache {
        if let Some(cache) = self.hosts.get(host_uuid) {
            return Arc::clone(&cache);
        }
        Arc::clone(&self.hosts.entry(host_uuid.to_string()).or_default())
    }

    async fn load_open(
        &self,
        cache: &mut HashMap<i64, Option<Incident>>,
        alerts_id: i64,
        host_uuid: &str,
    ) -> Result<Option<Incident>, IncidentError> {
        if let Some(known) = cache.get(&alerts_id) {
            return Ok(known.clone());
        }
        let open = self.store.find_open(alerts_id, host_uuid).await?;
        cache.insert(alerts_id, open.clone());
        Ok(open)
    }

    /// Currently open incident of the pair.
    pub async fn open_incident(
        &self,
        alerts_id: i64,
        host_uuid: &str,
    ) -> Result<Option<Incident>, IncidentError> {
        let host = self.host(host_uuid);
        let mut cache = host.lock().await;
        self.load_open(&mut cache, alerts_id, host_uuid).await
    }

    /// Opens an incident for the pair or moves the open one to `severity`.
    /// Repeating the same severity changes nothing.
    pub async fn on_breach(
        &self,
        rule: &Alert,
        host_uuid: &str,
        severity: Severity,
        result: String,
        now: DateTime<Utc>,
    ) -> Result<BreachOutcome, IncidentError> {
        let host = self.host(host_uuid);
        let mut cache = host.lock().await;

        if let Some(incident) = self.load_open(&mut cache, rule.id, host_uuid).await? {
            return self
                .change_severity(&mut cache, incident, severity, result, now)
                .await;
        }

        let new = NewIncident {
            result: result.clone(),
            started_at: now,
            host_uuid: host_uuid.to_string(),
            hostname: rule.hostname.clone(),
            severity,
            alerts_id: rule.id,
            cid: rule.cid,
        };
        match self.store.insert(new).await {
            Ok(incident) => {
                cache.insert(rule.id, Some(incident.clone()));
                tracing::info!(
                    rule_id = rule.id,
                    host_uuid,
                    incident_id = incident.id,
                    severity = %severity,
                    "Incident opened"
                );
                Ok(BreachOutcome::Opened(incident))
            }
            Err(conflict @ IncidentError::Conflict { .. }) => {
                // Opened by another writer since the cache was filled.
                match self.store.find_open(rule.id, host_uuid).await? {
                    Some(incident) => {
                        self.change_severity(&mut cache, incident, severity, result, now)
                            .await
                    }
                    None => Err(conflict),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn change_severity(
        &self,
        cache: &mut HashMap<i64, Option<Incident>>,
        mut incident: Incident,
        severity: Severity,
        result: String,
        now: DateTime<Utc>,
    ) -> Result<BreachOutcome, IncidentError> {
        if incident.severity == severity {
            cache.insert(incident.alerts_id, Some(incident.clone()));
            return Ok(BreachOutcome::Unchanged(incident));
        }
        let previous = incident.severity;
        incident.severity = severity;
        incident.result = result;
        incident.updated_at = now;
        self.store.update(&incident).await?;
        cache.insert(incident.alerts_id, Some(incident.clone()));
        tracing::info!(
            rule_id = incident.alerts_id,
            host_uuid = %incident.host_uuid,
            incident_id = incident.id,
            from = %previous,
            to = %severity,
            "Incident severity changed"
        );
        Ok(BreachOutcome::SeverityChanged { incident, previous })
    }

    /// Closes the open incident of the pair. Without one this is a no-op.
    pub async fn on_resolve(
        &self,
        rule: &Alert,
        host_uuid: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Incident>, IncidentError> {
        let host = self.host(host_uuid);
        let mut cache = host.lock().await;

        let Some(mut incident) = self.load_open(&mut cache, rule.id, host_uuid).await? else {
            return Ok(None);
        };
        incident.status = IncidentStatus::Resolved;
        incident.resolved_at = Some(now);
        incident.updated_at = now;
        self.store.update(&incident).await?;
        cache.insert(rule.id, None);
        tracing::info!(
            rule_id = rule.id,
            host_uuid,
            incident_id = incident.id,
            "Incident resolved"
        );
        Ok(Some(incident))
    }

    /// Marks the open incident of the pair acknowledged. It stays open.
    pub async fn acknowledge(
        &self,
        host_uuid: &str,
        alerts_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<Incident>, IncidentError> {
        let host = self.host(host_uuid);
        let mut cache = host.lock().await;

        let Some(mut incident) = self.load_open(&mut cache, alerts_id, host_uuid).await? else {
            return Ok(None);
        };
        if incident.status == IncidentStatus::Acknowledged {
            return Ok(Some(incident));
        }
        incident.status = IncidentStatus::Acknowledged;
        incident.updated_at = now;
        self.store.update(&incident).await?;
        cache.insert(alerts_id, Some(incident.clone()));
        tracing::info!(alerts_id, host_uuid, incident_id = incident.id, "Incident acknowledged");
        Ok(Some(incident))
    }

    /// Drops cached incidents of `alerts_id`, forcing the next operation to
    /// read the store.
    pub async fn forget_rule(&self, alerts_id: i64) {
        let hosts: Vec<OpenCache> = self.hosts.iter().map(|h| Arc::clone(h.value())).collect();
        for host in hosts {
            host.lock().await.remove(&alerts_id);
        }
    }
}
