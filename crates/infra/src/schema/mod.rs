//! Schema migrations.
//!
//! Each `Migration` is a declarative record (operations plus dependencies)
//! together with the SQL that realizes it on Postgres. A `MigrationTarget`
//! applies migrations and keeps the ledger of what has been applied; the
//! `Migrator` orders migrations by dependency and applies the pending ones.

use std::collections::BTreeSet;
use std::fmt;

use thiserror::Error;
use tracing::info;

mod migrations;
pub mod postgres;

pub use migrations::{ASSOCIATION_TABLE, CATALOG_TABLE, CONTENT_TABLE, JOIN_MODEL_TABLE, MIGRATIONS, QUERY_TABLE};
pub use postgres::PostgresMigrationTarget;

/// `app.name` identifier of a migration.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MigrationKey {
    pub app: String,
    pub name: String,
}

impl MigrationKey {
    pub fn new(app: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for MigrationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.app, self.name)
    }
}

/// Field definitions used by `AddField`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    /// Many-to-many with an implicit link table.
    ManyToMany { to: &'static str },
    /// Many-to-many routed through an explicit model.
    ManyToManyThrough { to: &'static str, through: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    CreateModel { name: &'static str, table: &'static str },
    AddField { model: &'static str, name: &'static str, field: Field },
    RemoveField { model: &'static str, name: &'static str },
    DeleteModel { name: &'static str },
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::CreateModel { name, .. } => write!(f, "Create model {}", name),
            Operation::AddField { model, name, .. } => write!(f, "Add field {} to {}", name, model),
            Operation::RemoveField { model, name } => write!(f, "Remove field {} from {}", name, model),
            Operation::DeleteModel { name } => write!(f, "Delete model {}", name),
        }
    }
}

#[derive(Debug)]
pub struct Migration {
    pub app: &'static str,
    pub name: &'static str,
    pub dependencies: &'static [(&'static str, &'static str)],
    /// Creates tables that may already exist when adopting an existing database.
    pub initial: bool,
    pub operations: &'static [Operation],
    /// Statements applied on Postgres, in one transaction.
    pub postgres: &'static str,
}

impl Migration {
    pub fn key(&self) -> MigrationKey {
        MigrationKey::new(self.app, self.name)
    }

    /// Tables created by this migration's `CreateModel` operations.
    pub fn created_tables(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.operations.iter().filter_map(|op| match op {
            Operation::CreateModel { table, .. } => Some(*table),
            _ => None,
        })
    }
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("migration {migration} depends on unknown migration {dependency}")]
    UnknownDependency { migration: MigrationKey, dependency: MigrationKey },

    #[error("dependency cycle among migrations: {0}")]
    Cycle(String),

    #[error("operation not supported by this target: {0}")]
    Unsupported(String),

    #[error("migration storage error: {0}")]
    Storage(String),
}

/// Storage a migration can be applied to.
#[async_trait::async_trait]
pub trait MigrationTarget: Send + Sync {
    /// Keys of the migrations recorded as applied.
    async fn applied(&self) -> Result<BTreeSet<MigrationKey>, MigrationError>;

    /// Apply `migration` and record it, atomically.
    async fn apply(&self, migration: &Migration) -> Result<(), MigrationError>;

    /// Record `migration` as applied without running it.
    async fn record(&self, migration: &Migration) -> Result<(), MigrationError>;

    async fn table_exists(&self, table: &str) -> Result<bool, MigrationError>;
}

/// Migration with its applied state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    pub key: MigrationKey,
    pub applied: bool,
}

/// How a pending migration was brought up to date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationAction {
    Applied,
    /// Recorded without running because its tables already existed.
    Faked,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MigrateOptions {
    pub fake_initial: bool,
}

pub struct Migrator<'a, T: MigrationTarget + ?Sized> {
    target: &'a T,
    migrations: &'a [Migration],
}

impl<'a, T: MigrationTarget + ?Sized> Migrator<'a, T> {
    pub fn new(target: &'a T, migrations: &'a [Migration]) -> Self {
        Self { target, migrations }
    }

    /// Migrations in an order where every dependency precedes its dependents.
    /// Declaration order is kept wherever dependencies allow it.
    pub fn plan(&self) -> Result<Vec<&'a Migration>, MigrationError> {
        let known: BTreeSet<MigrationKey> = self.migrations.iter().map(Migration::key).collect();
        for migration in self.migrations {
            for (app, name) in migration.dependencies {
                let dependency = MigrationKey::new(*app, *name);
                if !known.contains(&dependency) {
                    return Err(MigrationError::UnknownDependency {
                        migration: migration.key(),
                        dependency,
                    });
                }
            }
        }

        let mut placed: BTreeSet<MigrationKey> = BTreeSet::new();
        let mut plan = Vec::with_capacity(self.migrations.len());

        while plan.len() < self.migrations.len() {
            let next = self.migrations.iter().find(|m| {
                !placed.contains(&m.key())
                    && m
                        .dependencies
                        .iter()
                        .all(|(app, name)| placed.contains(&MigrationKey::new(*app, *name)))
            });

            let Some(next) = next else {
                let stuck: Vec<String> = self
                    .migrations
                    .iter()
                    .map(Migration::key)
                    .filter(|k| !placed.contains(k))
                    .map(|k| k.to_string())
                    .collect();
                return Err(MigrationError::Cycle(stuck.join(", ")));
            };

            placed.insert(next.key());
            plan.push(next);
        }

        Ok(plan)
    }

    pub async fn status(&self) -> Result<Vec<MigrationStatus>, MigrationError> {
        let applied = self.target.applied().await?;
        Ok(self
            .plan()?
            .into_iter()
            .map(|m| MigrationStatus {
                applied: applied.contains(&m.key()),
                key: m.key(),
            })
            .collect())
    }

    pub async fn pending(&self) -> Result<Vec<&'a Migration>, MigrationError> {
        let applied = self.target.applied().await?;
        Ok(self
            .plan()?
            .into_iter()
            .filter(|m| !applied.contains(&m.key()))
            .collect())
    }

    /// Apply every pending migration in plan order.
    pub async fn migrate(
        &self,
        options: MigrateOptions,
    ) -> Result<Vec<(MigrationKey, MigrationAction)>, MigrationError> {
        let mut done = Vec::new();

        for migration in self.pending().await? {
            let key = migration.key();

            if options.fake_initial && migration.initial && self.tables_present(migration).await? {
                self.target.record(migration).await?;
                info!(migration = %key, "migration faked; tables already exist");
                done.push((key, MigrationAction::Faked));
                continue;
            }

            for operation in migration.operations {
                info!(migration = %key, operation = %operation, "applying operation");
            }
            self.target.apply(migration).await?;
            info!(migration = %key, "migration applied");
            done.push((key, MigrationAction::Applied));
        }

        Ok(done)
    }

    async fn tables_present(&self, migration: &Migration) -> Result<bool, MigrationError> {
        for table in migration.created_tables() {
            if !self.target.table_exists(table).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryCatalogRepository;

    const A: Migration = Migration {
        app: "catalog",
        name: "a",
        dependencies: &[],
        initial: true,
        operations: &[],
        postgres: "",
    };
    const B: Migration = Migration {
        app: "catalog",
        name: "b",
        dependencies: &[("catalog", "a")],
        initial: false,
        operations: &[],
        postgres: "",
    };

    #[test]
    fn plan_puts_dependencies_first() {
        let repo = InMemoryCatalogRepository::empty();
        let migrations = [B, A];
        let plan: Vec<String> = Migrator::new(&repo, &migrations)
            .plan()
            .unwrap()
            .iter()
            .map(|m| m.name.to_string())
            .collect();
        assert_eq!(plan, vec!["a", "b"]);
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let repo = InMemoryCatalogRepository::empty();
        let migrations = [B];
        let err = Migrator::new(&repo, &migrations).plan().unwrap_err();
        assert!(matches!(err, MigrationError::UnknownDependency { .. }));
    }

    #[test]
    fn cycles_are_rejected() {
        const X: Migration = Migration {
            app: "catalog",
            name: "x",
            dependencies: &[("catalog", "y")],
            initial: false,
            operations: &[],
            postgres: "",
        };
        const Y: Migration = Migration {
            app: "catalog",
            name: "y",
            dependencies: &[("catalog", "x")],
            initial: false,
            operations: &[],
            postgres: "",
        };
        let repo = InMemoryCatalogRepository::empty();
        let migrations = [X, Y];
        assert!(matches!(
            Migrator::new(&repo, &migrations).plan(),
            Err(MigrationError::Cycle(_))
        ));
    }

    #[test]
    fn registered_migrations_form_a_chain() {
        let repo = InMemoryCatalogRepository::empty();
        let plan = Migrator::new(&repo, MIGRATIONS).plan().unwrap();
        let keys: Vec<String> = plan.iter().map(|m| m.key().to_string()).collect();
        assert_eq!(
            keys,
            vec!["catalog.0030_auto_20220207_1209", "catalog.0031_auto_20220512_1526"]
        );
    }

    #[test]
    fn operations_describe_themselves() {
        let op = Operation::RemoveField {
            model: "contentmetadata",
            name: "catalog_query_mapping",
        };
        assert_eq!(op.to_string(), "Remove field catalog_query_mapping from contentmetadata");
    }

    #[tokio::test]
    async fn migrate_applies_each_migration_once() {
        let repo = InMemoryCatalogRepository::empty();
        let migrator = Migrator::new(&repo, MIGRATIONS);

        let first = migrator.migrate(MigrateOptions::default()).await.unwrap();
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|(_, action)| *action == MigrationAction::Applied));

        let second = migrator.migrate(MigrateOptions::default()).await.unwrap();
        assert!(second.is_empty());
        assert!(migrator.pending().await.unwrap().is_empty());
        assert!(migrator.status().await.unwrap().iter().all(|s| s.applied));
    }

    #[tokio::test]
    async fn fake_initial_records_existing_tables() {
        let repo = InMemoryCatalogRepository::unmigrated();
        repo.forget_migrations();

        let done = Migrator::new(&repo, MIGRATIONS)
            .migrate(MigrateOptions { fake_initial: true })
            .await
            .unwrap();

        assert_eq!(
            done,
            vec![
                (MigrationKey::new("catalog", "0030_auto_20220207_1209"), MigrationAction::Faked),
                (MigrationKey::new("catalog", "0031_auto_20220512_1526"), MigrationAction::Applied),
            ]
        );
    }
}
