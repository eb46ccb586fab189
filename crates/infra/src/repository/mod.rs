//! Catalog persistence.
//!
//! `CatalogRepository` is the read/write surface the refresh command and the
//! task handlers need. Associations between content and catalog queries are
//! exposed as logical `(content_key, catalog_query_id)` pairs regardless of the
//! storage layout behind them.

use serde_json::Value;
use thiserror::Error;

use catalog_core::{CatalogQueryId, ContentKey, DomainError};
use catalog_domain::{CatalogQuery, ContentMetadata, QueryAssociation};

pub mod in_memory;
pub mod postgres;

pub use in_memory::{InMemoryCatalogRepository, JoinRow};
pub use postgres::PostgresCatalogRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Storage has not been migrated to the layout this operation needs.
    #[error("schema outdated: {0}")]
    SchemaOutdated(String),
}

#[async_trait::async_trait]
pub trait CatalogRepository: Send + Sync {
    /// Distinct catalog queries referenced by at least one enterprise catalog, ordered by id.
    async fn catalog_queries_in_use(&self) -> Result<Vec<CatalogQuery>, RepositoryError>;

    async fn catalog_query(&self, id: CatalogQueryId) -> Result<Option<CatalogQuery>, RepositoryError>;

    /// Every content key currently stored, ordered.
    async fn all_content_keys(&self) -> Result<Vec<ContentKey>, RepositoryError>;

    /// Records for the given keys that exist; unknown keys are skipped.
    async fn content_metadata(&self, keys: &[ContentKey]) -> Result<Vec<ContentMetadata>, RepositoryError>;

    /// Insert or update records by content key. Associations on the records are ignored.
    async fn upsert_content_metadata(&self, records: &[ContentMetadata]) -> Result<(), RepositoryError>;

    /// Make the set of content associated with `query` exactly `keys`.
    async fn replace_query_associations(
        &self,
        query: CatalogQueryId,
        keys: &[ContentKey],
    ) -> Result<(), RepositoryError>;

    async fn update_json_metadata(&self, key: &ContentKey, json_metadata: Value) -> Result<(), RepositoryError>;

    /// All logical associations, ordered by content key then query id.
    async fn associations(&self) -> Result<Vec<QueryAssociation>, RepositoryError>;
}

#[async_trait::async_trait]
impl<R> CatalogRepository for std::sync::Arc<R>
where
    R: CatalogRepository + ?Sized,
{
    async fn catalog_queries_in_use(&self) -> Result<Vec<CatalogQuery>, RepositoryError> {
        (**self).catalog_queries_in_use().await
    }

    async fn catalog_query(&self, id: CatalogQueryId) -> Result<Option<CatalogQuery>, RepositoryError> {
        (**self).catalog_query(id).await
    }

    async fn all_content_keys(&self) -> Result<Vec<ContentKey>, RepositoryError> {
        (**self).all_content_keys().await
    }

    async fn content_metadata(&self, keys: &[ContentKey]) -> Result<Vec<ContentMetadata>, RepositoryError> {
        (**self).content_metadata(keys).await
    }

    async fn upsert_content_metadata(&self, records: &[ContentMetadata]) -> Result<(), RepositoryError> {
        (**self).upsert_content_metadata(records).await
    }

    async fn replace_query_associations(
        &self,
        query: CatalogQueryId,
        keys: &[ContentKey],
    ) -> Result<(), RepositoryError> {
        (**self).replace_query_associations(query, keys).await
    }

    async fn update_json_metadata(&self, key: &ContentKey, json_metadata: Value) -> Result<(), RepositoryError> {
        (**self).update_json_metadata(key, json_metadata).await
    }

    async fn associations(&self) -> Result<Vec<QueryAssociation>, RepositoryError> {
        (**self).associations().await
    }
}
