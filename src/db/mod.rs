//! PostgreSQL connection handling for the durable store.

use crate::config::DatabaseConfig;
use crate::error::Error;
use crate::store::PgStore;
use anyhow::Result;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub mod migrations;
pub mod models;
pub mod repositories;

/// How long a pooled connection may be waited on, also bounding a health ping
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connected pool plus the settings it was opened with
pub struct Database {
    pool: Arc<PgPool>,
    config: DatabaseConfig,
}

impl Database {
    /// Open the pool and apply pending migrations when `auto_migrate` is set
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        info!(
            "Connecting to PostgreSQL with up to {} connections",
            config.max_connections
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(&config.url)
            .await
            .map_err(|e| Error::Database(format!("Failed to connect to database: {}", e)))?;

        let database = Self {
            pool: Arc::new(pool),
            config: config.clone(),
        };

        if config.auto_migrate {
            database.migrate().await?;
        } else {
            info!("Skipping migrations, auto_migrate is off");
        }

        Ok(database)
    }

    pub async fn migrate(&self) -> Result<()> {
        info!("Applying migrations from {}", self.config.migrations_dir.display());

        migrations::run_migrations(&self.pool, &self.config.migrations_dir)
            .await
            .map_err(|e| Error::Database(format!("Failed to run migrations: {}", e)))?;

        Ok(())
    }

    /// Store backed by this pool
    pub fn store(&self) -> PgStore {
        PgStore::new(self.pool.clone())
    }
}

/// One round trip to the server; errors when the pool cannot serve a query
pub async fn ping(pool: &PgPool) -> Result<()> {
    sqlx::query("SELECT 1").execute(pool).await.map_err(|e| {
        warn!("Database ping failed: {}", e);
        Error::Database(format!("Database ping failed: {}", e))
    })?;
    Ok(())
}
