use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hostwatch_alert::{BoxError, IncidentError, IncidentStore};
use hostwatch_common::incident::{Incident, IncidentStatus, IncidentsJoined, NewIncident};
use hostwatch_common::types::Severity;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DbErr, EntityTrait, Order, QueryFilter,
    QueryOrder, QuerySelect, SqlErr,
};
use std::collections::HashMap;
use uuid::Uuid;

use crate::entities::alert as alert_entity;
use crate::entities::incident::{self, Column, Entity};
use crate::error::StorageError;
use crate::store::alert::to_alert;
use crate::store::ManagementStore;

/// Incident list filter. Results are newest first.
#[derive(Debug, Clone, Default)]
pub struct IncidentFilter {
    pub host_uuid: Option<String>,
    pub alerts_id: Option<i64>,
    /// Only incidents with `resolved_at` unset.
    pub open_only: bool,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

fn to_incident(m: incident::Model) -> std::result::Result<Incident, StorageError> {
    let cid = Uuid::parse_str(&m.cid).map_err(|_| StorageError::InvalidColumn {
        column: "incidents.cid",
        value: m.cid.clone(),
    })?;
    let status = IncidentStatus::from_ordinal(m.status).ok_or_else(|| StorageError::InvalidColumn {
        column: "incidents.status",
        value: m.status.to_string(),
    })?;
    let severity = Severity::from_ordinal(m.severity).ok_or_else(|| StorageError::InvalidColumn {
        column: "incidents.severity",
        value: m.severity.to_string(),
    })?;
    Ok(Incident {
        id: m.id,
        result: m.result,
        started_at: m.started_at.with_timezone(&Utc),
        updated_at: m.updated_at.with_timezone(&Utc),
        resolved_at: m.resolved_at.map(|t| t.with_timezone(&Utc)),
        host_uuid: m.host_uuid,
        hostname: m.hostname,
        status,
        severity,
        alerts_id: m.alerts_id,
        cid,
    })
}

fn store_err(e: impl Into<StorageError>) -> IncidentError {
    IncidentError::Store(BoxError::from(e.into()))
}

fn is_unique_violation(e: &DbErr) -> bool {
    matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
        || e.to_string().contains("UNIQUE constraint failed")
}

fn fixed(ts: DateTime<Utc>) -> sea_orm::prelude::DateTimeWithTimeZone {
    ts.fixed_offset()
}

impl ManagementStore {
    pub async fn get_incident(&self, id: i64) -> Result<Option<Incident>> {
        let model = Entity::find_by_id(id).one(self.db()).await?;
        Ok(model.map(to_incident).transpose()?)
    }

    pub async fn list_incidents(&self, filter: &IncidentFilter) -> Result<Vec<Incident>> {
        let mut q = Entity::find();
        if let Some(host) = &filter.host_uuid {
            q = q.filter(Column::HostUuid.eq(host.as_str()));
        }
        if let Some(alerts_id) = filter.alerts_id {
            q = q.filter(Column::AlertsId.eq(alerts_id));
        }
        if filter.open_only {
            q = q.filter(Column::ResolvedAt.is_null());
        }
        q = q
            .order_by(Column::StartedAt, Order::Desc)
            .order_by(Column::Id, Order::Desc);
        if let Some(limit) = filter.limit {
            q = q.limit(limit);
        }
        if let Some(offset) = filter.offset {
            q = q.offset(offset);
        }
        let rows = q.all(self.db()).await?;
        rows.into_iter()
            .map(|m| to_incident(m).map_err(anyhow::Error::from))
            .collect()
    }

    /// Incidents paired with their rule. The rule side is `None` when the
    /// rule row no longer exists.
    pub async fn list_incidents_joined(
        &self,
        filter: &IncidentFilter,
    ) -> Result<Vec<IncidentsJoined>> {
        let incidents = self.list_incidents(filter).await?;
        let mut ids: Vec<i64> = incidents.iter().map(|i| i.alerts_id).collect();
        ids.sort_unstable();
        ids.dedup();

        let mut alerts = HashMap::new();
        if !ids.is_empty() {
            let rows = alert_entity::Entity::find()
                .filter(alert_entity::Column::Id.is_in(ids))
                .all(self.db())
                .await?;
            for m in rows {
                let alert = to_alert(m)?;
                alerts.insert(alert.id, alert);
            }
        }

        Ok(incidents
            .into_iter()
            .map(|incident| {
                let alert = alerts.get(&incident.alerts_id).cloned();
                IncidentsJoined { incident, alert }
            })
            .collect())
    }
}

#[async_trait]
impl IncidentStore for ManagementStore {
    async fn find_open(
        &self,
        alerts_id: i64,
        host_uuid: &str,
    ) -> std::result::Result<Option<Incident>, IncidentError> {
        let model = Entity::find()
            .filter(Column::AlertsId.eq(alerts_id))
            .filter(Column::HostUuid.eq(host_uuid))
            .filter(Column::ResolvedAt.is_null())
            .one(self.db())
            .await
            .map_err(store_err)?;
        model.map(to_incident).transpose().map_err(store_err)
    }

    async fn insert(&self, new: NewIncident) -> std::result::Result<Incident, IncidentError> {
        let am = incident::ActiveModel {
            result: Set(new.result),
            started_at: Set(fixed(new.started_at)),
            updated_at: Set(fixed(new.started_at)),
            resolved_at: Set(None),
            host_uuid: Set(new.host_uuid.clone()),
            hostname: Set(new.hostname),
            status: Set(IncidentStatus::Open.ordinal()),
            severity: Set(new.severity.ordinal()),
            alerts_id: Set(new.alerts_id),
            cid: Set(new.cid.to_string()),
            ..Default::default()
        };
        match am.insert(self.db()).await {
            Ok(model) => to_incident(model).map_err(store_err),
            Err(e) if is_unique_violation(&e) => Err(IncidentError::Conflict {
                alerts_id: new.alerts_id,
                host_uuid: new.host_uuid,
            }),
            Err(e) => Err(store_err(e)),
        }
    }

    async fn update(&self, incident: &Incident) -> std::result::Result<(), IncidentError> {
        let model = Entity::find_by_id(incident.id)
            .one(self.db())
            .await
            .map_err(store_err)?
            .ok_or_else(|| {
                store_err(StorageError::NotFound {
                    entity: "incident",
                    id: incident.id.to_string(),
                })
            })?;
        let mut am: incident::ActiveModel = model.into();
        am.result = Set(incident.result.clone());
        am.severity = Set(incident.severity.ordinal());
        am.status = Set(incident.status.ordinal());
        am.updated_at = Set(fixed(incident.updated_at));
        am.resolved_at = Set(incident.resolved_at.map(fixed));
        am.update(self.db()).await.map_err(store_err)?;
        Ok(())
    }
}
