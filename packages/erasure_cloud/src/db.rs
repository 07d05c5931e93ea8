use anyhow::{Context, Result};
use tracing::info;

use crate::config::DatabaseConfig;
use crate::error::CloudError;
use crate::schema::catalog::PRIVATE_CLOUD_DATABASES;
use crate::schema::{EntityKind, SchemaProvisioner, SchemaReport, TableDef};
use crate::store::{Store, StoreKind};

/// The shared multi-tenant store.
#[derive(Clone, Debug)]
pub struct Database {
    pub store: Store,
}

impl Database {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let kind = StoreKind::from_url(&config.url)
            .context("Unsupported shared database URL scheme")?;
        info!("🗄️  Connecting to {} shared database", kind);

        let store = Store::connect(
            kind,
            &config.url,
            config.max_connections,
            std::time::Duration::from_secs(30),
        )
        .await
        .context("Failed to connect to shared database")?;

        if kind == StoreKind::Sqlite {
            sqlx::query("PRAGMA journal_mode = WAL")
                .execute(store.pool())
                .await?;
        }

        info!("Running database migrations...");
        run_migrations(&store).await?;

        info!("✅ Database initialized successfully");

        Ok(Self { store })
    }
}

/// Create the catalogue tables and the private-cloud registry. Safe to repeat.
pub async fn run_migrations(store: &Store) -> Result<SchemaReport, CloudError> {
    let mut tables: Vec<&TableDef> = EntityKind::ALL.iter().map(EntityKind::table).collect();
    tables.push(&PRIVATE_CLOUD_DATABASES);
    SchemaProvisioner::ensure_tables(store, &tables).await
}
