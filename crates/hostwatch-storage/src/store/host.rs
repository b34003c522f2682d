use anyhow::Result;
use chrono::Utc;
use hostwatch_common::types::Host;
use sea_orm::{ActiveModelTrait, ActiveValue::Set, EntityTrait, Order, QueryOrder};

use crate::entities::host::{self, Column, Entity};
use crate::store::ManagementStore;

fn to_host(m: host::Model) -> Host {
    Host {
        uuid: m.uuid,
        system: m.system,
        os_version: m.os_version,
        hostname: m.hostname,
        uptime: m.uptime,
        sync_interval: m.sync_interval,
        created_at: m.created_at.with_timezone(&Utc),
        updated_at: m.updated_at.with_timezone(&Utc),
    }
}

impl ManagementStore {
    /// Records a heartbeat. The first contact creates the row; later ones
    /// refresh the descriptive fields and keep `created_at`.
    pub async fn upsert_host(&self, host: &Host) -> Result<Host> {
        let now = Utc::now().fixed_offset();
        let existing = Entity::find_by_id(host.uuid.clone()).one(self.db()).await?;
        let model = match existing {
            Some(m) => {
                let mut am: host::ActiveModel = m.into();
                am.system = Set(host.system.clone());
                am.os_version = Set(host.os_version.clone());
                am.hostname = Set(host.hostname.clone());
                am.uptime = Set(host.uptime);
                am.sync_interval = Set(host.sync_interval);
                am.updated_at = Set(now);
                am.update(self.db()).await?
            }
            None => {
                let am = host::ActiveModel {
                    uuid: Set(host.uuid.clone()),
                    system: Set(host.system.clone()),
                    os_version: Set(host.os_version.clone()),
                    hostname: Set(host.hostname.clone()),
                    uptime: Set(host.uptime),
                    sync_interval: Set(host.sync_interval),
                    created_at: Set(now),
                    updated_at: Set(now),
                };
                tracing::info!(host_uuid = %host.uuid, hostname = %host.hostname, "Registered new host");
                am.insert(self.db()).await?
            }
        };
        Ok(to_host(model))
    }

    pub async fn get_host(&self, uuid: &str) -> Result<Option<Host>> {
        let model = Entity::find_by_id(uuid.to_string()).one(self.db()).await?;
        Ok(model.map(to_host))
    }

    pub async fn list_hosts(&self) -> Result<Vec<Host>> {
        let rows = Entity::find()
            .order_by(Column::Hostname, Order::Asc)
            .all(self.db())
            .await?;
        Ok(rows.into_iter().map(to_host).collect())
    }
}
