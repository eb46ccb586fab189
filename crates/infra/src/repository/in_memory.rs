//! In-memory catalog repository.
//!
//! Besides the catalog data itself this keeps the association storage in one
//! of two layouts, the explicit `ContentMetadataToQueries` join model or the
//! direct `catalog_queries` many-to-many field, so the schema transition can be
//! applied and observed without a database.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::Value;
use tracing::error;

use catalog_core::{CatalogQueryId, ContentKey};
use catalog_domain::{CatalogQuery, ContentMetadata, EnterpriseCatalog, QueryAssociation, catalog_queries_in_use};

use super::{CatalogRepository, RepositoryError};
use crate::schema::{
    ASSOCIATION_TABLE, CATALOG_TABLE, CONTENT_TABLE, Field, JOIN_MODEL_TABLE, MIGRATIONS, Migration, MigrationError,
    MigrationKey, MigrationTarget, Operation, QUERY_TABLE,
};

/// One row of the explicit join model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRow {
    pub id: i64,
    pub content_key: ContentKey,
    pub catalog_query_id: CatalogQueryId,
}

#[derive(Debug, Clone, Default)]
struct AssociationTables {
    /// Base tables (queries, catalogs, content) exist.
    base: bool,
    join_model: Option<Vec<JoinRow>>,
    next_join_id: i64,
    /// `ContentMetadata.catalog_query_mapping` routed through the join model.
    mapping_field: bool,
    many_to_many: Option<BTreeMap<ContentKey, BTreeSet<CatalogQueryId>>>,
}

impl AssociationTables {
    fn pairs(&self) -> BTreeSet<QueryAssociation> {
        if let Some(m2m) = &self.many_to_many {
            return m2m
                .iter()
                .flat_map(|(key, ids)| ids.iter().map(move |id| QueryAssociation::new(key.clone(), *id)))
                .collect();
        }
        self.join_model
            .iter()
            .flatten()
            .map(|row| QueryAssociation::new(row.content_key.clone(), row.catalog_query_id))
            .collect()
    }

    fn queries_for(&self, key: &ContentKey) -> BTreeSet<CatalogQueryId> {
        if let Some(m2m) = &self.many_to_many {
            return m2m.get(key).cloned().unwrap_or_default();
        }
        self.join_model
            .iter()
            .flatten()
            .filter(|row| &row.content_key == key)
            .map(|row| row.catalog_query_id)
            .collect()
    }

    fn replace(&mut self, query: CatalogQueryId, keys: &[ContentKey]) -> Result<(), RepositoryError> {
        if let Some(m2m) = &mut self.many_to_many {
            for ids in m2m.values_mut() {
                ids.remove(&query);
            }
            m2m.retain(|_, ids| !ids.is_empty());
            for key in keys {
                m2m.entry(key.clone()).or_default().insert(query);
            }
            return Ok(());
        }

        let Some(rows) = &mut self.join_model else {
            return Err(RepositoryError::SchemaOutdated("no association storage exists".to_string()));
        };
        rows.retain(|row| row.catalog_query_id != query);
        let unique: BTreeSet<&ContentKey> = keys.iter().collect();
        for key in unique {
            self.next_join_id += 1;
            rows.push(JoinRow {
                id: self.next_join_id,
                content_key: key.clone(),
                catalog_query_id: query,
            });
        }
        Ok(())
    }

    fn table_exists(&self, table: &str) -> bool {
        match table {
            t if t == JOIN_MODEL_TABLE => self.join_model.is_some(),
            t if t == ASSOCIATION_TABLE => self.many_to_many.is_some(),
            t if t == QUERY_TABLE || t == CATALOG_TABLE || t == CONTENT_TABLE => self.base,
            _ => false,
        }
    }

    /// The tables as they are after `migration`; `self` is left untouched on error.
    fn migrated(&self, migration: &Migration) -> Result<Self, MigrationError> {
        let mut tables = self.clone();
        for operation in migration.operations {
            tables.apply(operation)?;
        }
        Ok(tables)
    }

    fn apply(&mut self, operation: &Operation) -> Result<(), MigrationError> {
        match *operation {
            Operation::CreateModel { table, .. } if table == JOIN_MODEL_TABLE => {
                self.join_model = Some(Vec::new());
            }
            Operation::CreateModel { table, .. } if table == QUERY_TABLE || table == CATALOG_TABLE || table == CONTENT_TABLE => {
                self.base = true;
            }
            Operation::AddField {
                name: "catalog_query_mapping",
                field: Field::ManyToManyThrough { .. },
                ..
            } => {
                if self.join_model.is_none() {
                    return Err(MigrationError::Unsupported(
                        "catalog_query_mapping needs the join model".to_string(),
                    ));
                }
                self.mapping_field = true;
            }
            Operation::RemoveField { name: "catalog_query_mapping", .. } => {
                self.mapping_field = false;
            }
            Operation::AddField {
                name: "catalog_queries",
                field: Field::ManyToMany { .. },
                ..
            } => {
                let mut m2m: BTreeMap<ContentKey, BTreeSet<CatalogQueryId>> = BTreeMap::new();
                for row in self.join_model.iter().flatten() {
                    m2m.entry(row.content_key.clone()).or_default().insert(row.catalog_query_id);
                }
                self.many_to_many = Some(m2m);
            }
            Operation::DeleteModel { name: "ContentMetadataToQueries" } => {
                self.join_model = None;
            }
            other => return Err(MigrationError::Unsupported(other.to_string())),
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct State {
    queries: BTreeMap<CatalogQueryId, CatalogQuery>,
    catalogs: Vec<EnterpriseCatalog>,
    content: BTreeMap<ContentKey, ContentMetadata>,
    tables: AssociationTables,
    ledger: BTreeSet<MigrationKey>,
}

/// In-memory `CatalogRepository`.
#[derive(Debug, Default)]
pub struct InMemoryCatalogRepository {
    state: RwLock<State>,
}

impl InMemoryCatalogRepository {
    /// Fully migrated storage: associations live in the many-to-many field.
    pub fn new() -> Self {
        let repo = Self::empty();
        repo.apply_all(MIGRATIONS.len());
        repo
    }

    /// Storage as it was before the join model was removed.
    pub fn unmigrated() -> Self {
        let repo = Self::empty();
        repo.apply_all(1);
        repo
    }

    /// No tables and an empty ledger.
    pub fn empty() -> Self {
        Self::default()
    }

    fn apply_all(&self, count: usize) {
        let mut state = self.write();
        for migration in MIGRATIONS.iter().take(count) {
            let tables = state.tables.migrated(migration);
            debug_assert!(tables.is_ok(), "{} does not apply in memory: {:?}", migration.key(), tables);
            match tables {
                Ok(tables) => {
                    state.tables = tables;
                    state.ledger.insert(migration.key());
                }
                Err(e) => {
                    // the ledger stays honest: this and later migrations remain pending
                    error!(migration = %migration.key(), error = %e, "migration does not apply to in-memory storage");
                    break;
                }
            }
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert_query(&self, query: CatalogQuery) {
        self.write().queries.insert(query.id, query);
    }

    pub fn insert_catalog(&self, catalog: EnterpriseCatalog) {
        self.write().catalogs.push(catalog);
    }

    /// Store an association through the join model, as pre-transition code did.
    pub fn insert_legacy_association(&self, key: ContentKey, query: CatalogQueryId) -> Result<(), RepositoryError> {
        let mut state = self.write();
        let tables = &mut state.tables;
        let Some(rows) = &mut tables.join_model else {
            return Err(RepositoryError::SchemaOutdated(format!("{} no longer exists", JOIN_MODEL_TABLE)));
        };
        tables.next_join_id += 1;
        rows.push(JoinRow {
            id: tables.next_join_id,
            content_key: key,
            catalog_query_id: query,
        });
        Ok(())
    }

    pub fn has_join_model(&self) -> bool {
        self.read().tables.join_model.is_some()
    }

    pub fn has_mapping_field(&self) -> bool {
        self.read().tables.mapping_field
    }

    pub fn has_many_to_many(&self) -> bool {
        self.read().tables.many_to_many.is_some()
    }

    /// Drop the ledger but keep the tables, like a database adopted from elsewhere.
    pub fn forget_migrations(&self) {
        self.write().ledger.clear();
    }
}

#[async_trait::async_trait]
impl CatalogRepository for InMemoryCatalogRepository {
    async fn catalog_queries_in_use(&self) -> Result<Vec<CatalogQuery>, RepositoryError> {
        let state = self.read();
        let queries: Vec<CatalogQuery> = state.queries.values().cloned().collect();
        Ok(catalog_queries_in_use(&queries, &state.catalogs))
    }

    async fn catalog_query(&self, id: CatalogQueryId) -> Result<Option<CatalogQuery>, RepositoryError> {
        Ok(self.read().queries.get(&id).cloned())
    }

    async fn all_content_keys(&self) -> Result<Vec<ContentKey>, RepositoryError> {
        Ok(self.read().content.keys().cloned().collect())
    }

    async fn content_metadata(&self, keys: &[ContentKey]) -> Result<Vec<ContentMetadata>, RepositoryError> {
        let state = self.read();
        Ok(keys
            .iter()
            .filter_map(|key| state.content.get(key))
            .map(|record| {
                let mut record = record.clone();
                record.catalog_queries = state.tables.queries_for(&record.content_key);
                record
            })
            .collect())
    }

    async fn upsert_content_metadata(&self, records: &[ContentMetadata]) -> Result<(), RepositoryError> {
        let mut state = self.write();
        for record in records {
            let mut record = record.clone();
            record.catalog_queries.clear();
            state.content.insert(record.content_key.clone(), record);
        }
        Ok(())
    }

    async fn replace_query_associations(
        &self,
        query: CatalogQueryId,
        keys: &[ContentKey],
    ) -> Result<(), RepositoryError> {
        let mut state = self.write();
        if !state.queries.contains_key(&query) {
            return Err(RepositoryError::NotFound(format!("catalog query {}", query)));
        }
        if let Some(missing) = keys.iter().find(|k| !state.content.contains_key(*k)) {
            return Err(RepositoryError::NotFound(format!("content metadata {}", missing)));
        }
        state.tables.replace(query, keys)
    }

    async fn update_json_metadata(&self, key: &ContentKey, json_metadata: Value) -> Result<(), RepositoryError> {
        let mut state = self.write();
        let record = state
            .content
            .get_mut(key)
            .ok_or_else(|| RepositoryError::NotFound(format!("content metadata {}", key)))?;
        record.json_metadata = json_metadata;
        Ok(())
    }

    async fn associations(&self) -> Result<Vec<QueryAssociation>, RepositoryError> {
        Ok(self.read().tables.pairs().into_iter().collect())
    }
}

#[async_trait::async_trait]
impl MigrationTarget for InMemoryCatalogRepository {
    async fn applied(&self) -> Result<BTreeSet<MigrationKey>, MigrationError> {
        Ok(self.read().ledger.clone())
    }

    async fn apply(&self, migration: &Migration) -> Result<(), MigrationError> {
        let mut state = self.write();

        // all-or-nothing, like a transaction
        state.tables = state.tables.migrated(migration)?;
        state.ledger.insert(migration.key());
        Ok(())
    }

    async fn record(&self, migration: &Migration) -> Result<(), MigrationError> {
        self.write().ledger.insert(migration.key());
        Ok(())
    }

    async fn table_exists(&self, table: &str) -> Result<bool, MigrationError> {
        Ok(self.read().tables.table_exists(table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{MigrateOptions, Migrator};
    use catalog_core::{CatalogUuid, EnterpriseUuid};
    use catalog_domain::ContentType;
    use serde_json::json;

    fn key(k: &str) -> ContentKey {
        ContentKey::parse(k).unwrap()
    }

    fn seed(repo: &InMemoryCatalogRepository, query_ids: &[i64]) {
        for id in query_ids {
            repo.insert_query(CatalogQuery::new(CatalogQueryId::new(*id), json!({"content_type": "course"})).unwrap());
        }
    }

    fn course(k: &str) -> ContentMetadata {
        ContentMetadata::new(key(k), ContentType::Course, json!({"key": k}))
    }

    #[tokio::test]
    async fn queries_in_use_skip_orphans() {
        let repo = InMemoryCatalogRepository::new();
        seed(&repo, &[1, 2]);
        repo.insert_catalog(EnterpriseCatalog {
            uuid: CatalogUuid::new(),
            title: "A".into(),
            enterprise_uuid: EnterpriseUuid::new(),
            catalog_query: Some(CatalogQueryId::new(2)),
        });

        let in_use = repo.catalog_queries_in_use().await.unwrap();
        assert_eq!(in_use.len(), 1);
        assert_eq!(in_use[0].id, CatalogQueryId::new(2));
    }

    #[tokio::test]
    async fn replace_associations_is_exact() {
        let repo = InMemoryCatalogRepository::new();
        seed(&repo, &[1, 2]);
        repo.upsert_content_metadata(&[course("a"), course("b"), course("c")]).await.unwrap();

        let q1 = CatalogQueryId::new(1);
        let q2 = CatalogQueryId::new(2);
        repo.replace_query_associations(q1, &[key("a"), key("b")]).await.unwrap();
        repo.replace_query_associations(q2, &[key("b")]).await.unwrap();
        repo.replace_query_associations(q1, &[key("c")]).await.unwrap();

        let pairs = repo.associations().await.unwrap();
        assert_eq!(
            pairs,
            vec![QueryAssociation::new(key("b"), q2), QueryAssociation::new(key("c"), q1)]
        );

        let records = repo.content_metadata(&[key("b"), key("missing")]).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].catalog_queries, BTreeSet::from([q2]));
    }

    #[tokio::test]
    async fn associations_require_known_content() {
        let repo = InMemoryCatalogRepository::new();
        seed(&repo, &[1]);
        let err = repo
            .replace_query_associations(CatalogQueryId::new(1), &[key("ghost")])
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound(_)));
    }

    #[tokio::test]
    async fn transition_keeps_every_pair() {
        let repo = InMemoryCatalogRepository::unmigrated();
        seed(&repo, &[1, 2]);
        repo.upsert_content_metadata(&[course("a"), course("b")]).await.unwrap();
        repo.insert_legacy_association(key("a"), CatalogQueryId::new(1)).unwrap();
        repo.insert_legacy_association(key("a"), CatalogQueryId::new(2)).unwrap();
        repo.insert_legacy_association(key("b"), CatalogQueryId::new(2)).unwrap();

        let before = repo.associations().await.unwrap();
        assert!(repo.has_join_model());
        assert!(repo.has_mapping_field());

        let done = Migrator::new(&repo, MIGRATIONS)
            .migrate(MigrateOptions::default())
            .await
            .unwrap();
        assert_eq!(done.len(), 1);

        assert!(!repo.has_join_model());
        assert!(!repo.has_mapping_field());
        assert!(repo.has_many_to_many());
        assert_eq!(repo.associations().await.unwrap(), before);
        assert!(repo.insert_legacy_association(key("b"), CatalogQueryId::new(1)).is_err());
    }

    #[tokio::test]
    async fn fresh_storage_ledger_matches_its_tables() {
        let mut tables = AssociationTables::default();
        for migration in MIGRATIONS.iter() {
            tables = tables.migrated(migration).unwrap();
        }
        assert!(tables.many_to_many.is_some());

        let repo = InMemoryCatalogRepository::new();
        assert!(Migrator::new(&repo, MIGRATIONS).pending().await.unwrap().is_empty());
        assert!(repo.has_many_to_many());
        assert!(!repo.has_join_model());
    }

    #[tokio::test]
    async fn failed_migration_leaves_storage_untouched() {
        static BROKEN: Migration = Migration {
            app: "catalog",
            name: "broken",
            dependencies: &[],
            initial: false,
            operations: &[
                Operation::DeleteModel { name: "ContentMetadataToQueries" },
                Operation::DeleteModel { name: "Unknown" },
            ],
            postgres: "",
        };

        let repo = InMemoryCatalogRepository::unmigrated();
        assert!(repo.apply(&BROKEN).await.is_err());
        assert!(repo.has_join_model());
        assert!(!repo.applied().await.unwrap().contains(&BROKEN.key()));
    }

    #[tokio::test]
    async fn update_json_metadata_replaces_document() {
        let repo = InMemoryCatalogRepository::new();
        repo.upsert_content_metadata(&[course("a")]).await.unwrap();
        repo.update_json_metadata(&key("a"), json!({"full": true})).await.unwrap();

        let records = repo.content_metadata(&[key("a")]).await.unwrap();
        assert_eq!(records[0].json_metadata, json!({"full": true}));
        assert!(repo.update_json_metadata(&key("zzz"), json!({})).await.is_err());
    }
}
