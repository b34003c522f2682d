use anyhow::Result;
use chrono::Utc;
use hostwatch_common::alert::{Alert, Direction};
use sea_orm::{ActiveModelTrait, ActiveValue::Set, EntityTrait, Order, QueryOrder};
use uuid::Uuid;

use crate::entities::alert::{self, Column, Entity};
use crate::error::StorageError;
use crate::store::ManagementStore;

pub(crate) fn to_alert(m: alert::Model) -> std::result::Result<Alert, StorageError> {
    let cid = Uuid::parse_str(&m.cid).map_err(|_| StorageError::InvalidColumn {
        column: "alerts.cid",
        value: m.cid.clone(),
    })?;
    let direction: Direction = m.direction.parse().map_err(|_| StorageError::InvalidColumn {
        column: "alerts.direction",
        value: m.direction.clone(),
    })?;
    Ok(Alert {
        id: m.id,
        active: m.active,
        name: m.name,
        table: m.table_name,
        lookup: m.lookup,
        timing: m.timing,
        warn: m.warn,
        crit: m.crit,
        info: m.info,
        host_uuid: m.host_uuid,
        hostname: m.hostname,
        cid,
        where_clause: m.where_clause,
        direction,
    })
}

fn fill(am: &mut alert::ActiveModel, a: &Alert) {
    am.active = Set(a.active);
    am.name = Set(a.name.clone());
    am.table_name = Set(a.table.clone());
    am.lookup = Set(a.lookup.clone());
    am.timing = Set(a.timing);
    am.warn = Set(a.warn.clone());
    am.crit = Set(a.crit.clone());
    am.info = Set(a.info.clone());
    am.host_uuid = Set(a.host_uuid.clone());
    am.hostname = Set(a.hostname.clone());
    am.cid = Set(a.cid.to_string());
    am.where_clause = Set(a.where_clause.clone());
    am.direction = Set(a.direction.to_string());
}

impl ManagementStore {
    /// Inserts or overwrites the rule row with `alert.id`.
    pub async fn save_alert(&self, alert: &Alert) -> Result<Alert> {
        let now = Utc::now().fixed_offset();
        let model = match Entity::find_by_id(alert.id).one(self.db()).await? {
            Some(m) => {
                let mut am: alert::ActiveModel = m.into();
                fill(&mut am, alert);
                am.updated_at = Set(now);
                am.update(self.db()).await?
            }
            None => {
                let mut am = alert::ActiveModel {
                    id: Set(alert.id),
                    created_at: Set(now),
                    updated_at: Set(now),
                    ..Default::default()
                };
                fill(&mut am, alert);
                am.insert(self.db()).await?
            }
        };
        Ok(to_alert(model)?)
    }

    pub async fn get_alert(&self, id: i64) -> Result<Option<Alert>> {
        let model = Entity::find_by_id(id).one(self.db()).await?;
        Ok(model.map(to_alert).transpose()?)
    }

    /// Every stored rule, active or not, by id ascending.
    pub async fn list_alerts(&self) -> Result<Vec<Alert>> {
        let rows = Entity::find()
            .order_by(Column::Id, Order::Asc)
            .all(self.db())
            .await?;
        rows.into_iter()
            .map(|m| to_alert(m).map_err(anyhow::Error::from))
            .collect()
    }

    /// Deletes the rule row. Incidents keep their `alerts_id`.
    pub async fn delete_alert(&self, id: i64) -> Result<bool> {
        let res = Entity::delete_by_id(id).exec(self.db()).await?;
        Ok(res.rows_affected > 0)
    }
}
