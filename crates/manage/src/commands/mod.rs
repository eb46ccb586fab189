pub mod migrate;
pub mod update_content_metadata;

use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;
use tracing::warn;

use catalog_infra::repository::{CatalogRepository, InMemoryCatalogRepository, PostgresCatalogRepository};
use catalog_infra::schema::{MigrationTarget, PostgresMigrationTarget};

/// Storage the commands operate on.
pub struct Backend {
    pub repository: Arc<dyn CatalogRepository>,
    pub migrations: Arc<dyn MigrationTarget>,
}

impl Backend {
    /// Postgres when `database_url` is set, otherwise a fresh in-memory catalog.
    pub async fn connect(database_url: Option<&str>) -> anyhow::Result<Self> {
        match database_url {
            Some(url) => {
                let pool = PgPool::connect(url).await.context("failed to connect to Postgres")?;
                Ok(Self {
                    repository: Arc::new(PostgresCatalogRepository::new(pool.clone())),
                    migrations: Arc::new(PostgresMigrationTarget::new(pool)),
                })
            }
            None => {
                warn!("DATABASE_URL not set; using an empty in-memory catalog");
                Ok(Self::in_memory(Arc::new(InMemoryCatalogRepository::new())))
            }
        }
    }

    pub fn in_memory(repository: Arc<InMemoryCatalogRepository>) -> Self {
        Self {
            repository: repository.clone(),
            migrations: repository,
        }
    }
}
