//! Postgres migration target with a `schema_migrations` ledger.

use std::collections::BTreeSet;

use sqlx::{PgPool, Row};
use tracing::debug;

use super::{Migration, MigrationError, MigrationKey, MigrationTarget};

#[derive(Debug, Clone)]
pub struct PostgresMigrationTarget {
    pool: PgPool,
}

impl PostgresMigrationTarget {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn ensure_ledger(&self) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                app TEXT NOT NULL,
                name TEXT NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (app, name)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_ledger", e))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl MigrationTarget for PostgresMigrationTarget {
    async fn applied(&self) -> Result<BTreeSet<MigrationKey>, MigrationError> {
        self.ensure_ledger().await?;

        let rows = sqlx::query("SELECT app, name FROM schema_migrations")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("applied", e))?;

        rows.iter()
            .map(|row| -> Result<MigrationKey, MigrationError> {
                let app: String = row.try_get("app").map_err(|e| map_sqlx_error("applied", e))?;
                let name: String = row.try_get("name").map_err(|e| map_sqlx_error("applied", e))?;
                Ok(MigrationKey::new(app, name))
            })
            .collect()
    }

    async fn apply(&self, migration: &Migration) -> Result<(), MigrationError> {
        self.ensure_ledger().await?;

        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error("apply", e))?;

        debug!(migration = %migration.key(), "executing migration sql");
        // no bind arguments, so the multi-statement script runs as one simple query
        sqlx::Executor::execute(&mut *tx, migration.postgres)
            .await
            .map_err(|e| map_sqlx_error("apply", e))?;

        insert_ledger_row(&mut tx, migration).await?;

        tx.commit().await.map_err(|e| map_sqlx_error("apply", e))?;
        Ok(())
    }

    async fn record(&self, migration: &Migration) -> Result<(), MigrationError> {
        self.ensure_ledger().await?;

        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error("record", e))?;
        insert_ledger_row(&mut tx, migration).await?;
        tx.commit().await.map_err(|e| map_sqlx_error("record", e))?;
        Ok(())
    }

    async fn table_exists(&self, table: &str) -> Result<bool, MigrationError> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM information_schema.tables
                WHERE table_schema = current_schema() AND table_name = $1
            ) AS present
            "#,
        )
        .bind(table)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("table_exists", e))?;

        row.try_get("present").map_err(|e| map_sqlx_error("table_exists", e))
    }
}

async fn insert_ledger_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    migration: &Migration,
) -> Result<(), MigrationError> {
    sqlx::query("INSERT INTO schema_migrations (app, name) VALUES ($1, $2) ON CONFLICT DO NOTHING")
        .bind(migration.app)
        .bind(migration.name)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("record", e))?;
    Ok(())
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> MigrationError {
    match err {
        sqlx::Error::Database(db_err) => {
            MigrationError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => MigrationError::Storage(format!("connection pool closed in {}", operation)),
        other => MigrationError::Storage(format!("sqlx error in {}: {}", operation, other)),
    }
}
