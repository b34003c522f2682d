use sea_orm_migration::prelude::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m001_initial_schema"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager.get_connection().execute_unprepared(UP_SQL).await?;
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .get_connection()
            .execute_unprepared(DOWN_SQL)
            .await?;
        Ok(())
    }
}

const UP_SQL: &str = "
CREATE TABLE IF NOT EXISTS hosts (
    uuid TEXT PRIMARY KEY NOT NULL,
    system TEXT NOT NULL,
    os_version TEXT NOT NULL,
    hostname TEXT NOT NULL,
    uptime INTEGER NOT NULL DEFAULT 0,
    sync_interval INTEGER,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS alerts (
    id INTEGER PRIMARY KEY NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    name TEXT NOT NULL,
    table_name TEXT NOT NULL,
    lookup TEXT NOT NULL,
    timing INTEGER NOT NULL DEFAULT 0,
    warn TEXT NOT NULL,
    crit TEXT NOT NULL,
    info TEXT,
    host_uuid TEXT NOT NULL,
    hostname TEXT NOT NULL,
    cid TEXT NOT NULL,
    where_clause TEXT,
    direction TEXT NOT NULL DEFAULT 'above',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_alerts_host ON alerts(host_uuid);
CREATE INDEX IF NOT EXISTS idx_alerts_cid ON alerts(cid);

CREATE TABLE IF NOT EXISTS incidents (
    id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    result TEXT NOT NULL,
    started_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    resolved_at TEXT,
    host_uuid TEXT NOT NULL,
    hostname TEXT NOT NULL,
    status INTEGER NOT NULL DEFAULT 0,
    severity INTEGER NOT NULL,
    alerts_id INTEGER NOT NULL,
    cid TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_incidents_one_open
    ON incidents(alerts_id, host_uuid) WHERE resolved_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_incidents_host ON incidents(host_uuid);
CREATE INDEX IF NOT EXISTS idx_incidents_started ON incidents(started_at);
";

const DOWN_SQL: &str = "
DROP TABLE IF EXISTS incidents;
DROP TABLE IF EXISTS alerts;
DROP TABLE IF EXISTS hosts;
";
