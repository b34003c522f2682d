use anyhow::Result;
use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectionTrait, Database, DatabaseConnection};

pub mod alert;
pub mod host;
pub mod incident;

pub use incident::IncidentFilter;

/// Access layer for the management database (hosts, alert rules, incidents).
///
/// Every method is `async` over SeaORM. Samples are kept apart in the daily
/// partitions of [`crate::SqliteSampleStore`].
pub struct ManagementStore {
    pub(crate) db: DatabaseConnection,
}

impl ManagementStore {
    /// Connects and brings the schema up to date.
    ///
    /// `db_url` is a full connection url such as
    /// `sqlite://data/hostwatch.db?mode=rwc`.
    pub async fn new(db_url: &str) -> Result<Self> {
        let db = Database::connect(db_url).await?;

        if db_url.starts_with("sqlite:") {
            db.execute_unprepared("PRAGMA journal_mode=WAL;").await?;
        }

        Migrator::up(&db, None).await?;

        tracing::info!(db_url = %db_url, "Initialized management store");
        Ok(Self { db })
    }

    /// Closes the connection pool. Every later call on this store, or on a
    /// clone sharing its pool, fails.
    pub async fn close(&self) -> Result<()> {
        self.db.clone().close().await?;
        tracing::info!("Management database closed");
        Ok(())
    }

    pub(crate) fn db(&self) -> &DatabaseConnection {
        &self.db
    }
}
