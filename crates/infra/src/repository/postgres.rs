//! Postgres-backed catalog repository.
//!
//! Works against the post-transition layout: associations live in
//! `catalog_contentmetadata_catalog_queries`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | RepositoryError |
//! |------------|-----------------|
//! | Database, undefined table (`42P01`) | `SchemaOutdated` |
//! | Database, foreign key violation (`23503`) | `NotFound` |
//! | Database (other), PoolClosed, Other | `Storage` |

use std::sync::Arc;

use serde_json::Value;
use sqlx::{PgPool, Row};
use tracing::{Span, instrument};

use catalog_core::{CatalogQueryId, ContentKey};
use catalog_domain::{CatalogQuery, ContentMetadata, QueryAssociation};

use super::{CatalogRepository, RepositoryError};

#[derive(Debug, Clone)]
pub struct PostgresCatalogRepository {
    pool: Arc<PgPool>,
}

impl PostgresCatalogRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }
}

fn query_from_row(row: &sqlx::postgres::PgRow) -> Result<CatalogQuery, RepositoryError> {
    let id: i64 = row.try_get("id").map_err(|e| map_sqlx_error("read catalog query", e))?;
    let content_filter: Value = row
        .try_get("content_filter")
        .map_err(|e| map_sqlx_error("read catalog query", e))?;
    let mut query = CatalogQuery::new(CatalogQueryId::new(id), content_filter)?;
    query.uuid = row.try_get("uuid").map_err(|e| map_sqlx_error("read catalog query", e))?;
    query.title = row.try_get("title").map_err(|e| map_sqlx_error("read catalog query", e))?;
    Ok(query)
}

#[async_trait::async_trait]
impl CatalogRepository for PostgresCatalogRepository {
    #[instrument(skip(self), fields(query_count = tracing::field::Empty), err)]
    async fn catalog_queries_in_use(&self) -> Result<Vec<CatalogQuery>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT q.id, q.uuid, q.content_filter, q.title
            FROM catalog_catalogquery q
            INNER JOIN catalog_enterprisecatalog c ON c.catalog_query_id = q.id
            ORDER BY q.id ASC
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("catalog_queries_in_use", e))?;

        let queries = rows.iter().map(query_from_row).collect::<Result<Vec<_>, _>>()?;
        Span::current().record("query_count", queries.len());
        Ok(queries)
    }

    async fn catalog_query(&self, id: CatalogQueryId) -> Result<Option<CatalogQuery>, RepositoryError> {
        let row = sqlx::query("SELECT id, uuid, content_filter, title FROM catalog_catalogquery WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("catalog_query", e))?;

        row.as_ref().map(query_from_row).transpose()
    }

    async fn all_content_keys(&self) -> Result<Vec<ContentKey>, RepositoryError> {
        let rows = sqlx::query("SELECT content_key FROM catalog_contentmetadata ORDER BY content_key ASC")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("all_content_keys", e))?;

        rows.iter()
            .map(|row| -> Result<ContentKey, RepositoryError> {
                let key: String = row.try_get("content_key").map_err(|e| map_sqlx_error("all_content_keys", e))?;
                Ok(ContentKey::parse(key)?)
            })
            .collect()
    }

    async fn content_metadata(&self, keys: &[ContentKey]) -> Result<Vec<ContentMetadata>, RepositoryError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<&str> = keys.iter().map(ContentKey::as_str).collect();

        let rows = sqlx::query(
            r#"
            SELECT
                m.content_key,
                m.content_type,
                m.parent_content_key,
                m.json_metadata,
                COALESCE(
                    ARRAY_AGG(a.catalogquery_id) FILTER (WHERE a.catalogquery_id IS NOT NULL),
                    '{}'
                ) AS catalog_query_ids
            FROM catalog_contentmetadata m
            LEFT JOIN catalog_contentmetadata_catalog_queries a ON a.contentmetadata_id = m.id
            WHERE m.content_key = ANY($1)
            GROUP BY m.id
            ORDER BY m.content_key ASC
            "#,
        )
        .bind(&keys)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("content_metadata", e))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let read = |e| map_sqlx_error("content_metadata", e);
            let content_key: String = row.try_get("content_key").map_err(read)?;
            let content_type: String = row.try_get("content_type").map_err(read)?;
            let parent: Option<String> = row.try_get("parent_content_key").map_err(read)?;
            let json_metadata: Option<Value> = row.try_get("json_metadata").map_err(read)?;
            let query_ids: Vec<i64> = row.try_get("catalog_query_ids").map_err(read)?;

            let mut record = ContentMetadata::new(
                ContentKey::parse(content_key)?,
                content_type.parse()?,
                json_metadata.unwrap_or(Value::Null),
            );
            record.parent_content_key = parent.map(ContentKey::parse).transpose()?;
            record.catalog_queries = query_ids.into_iter().map(CatalogQueryId::new).collect();
            records.push(record);
        }
        Ok(records)
    }

    #[instrument(skip(self, records), fields(record_count = records.len()), err)]
    async fn upsert_content_metadata(&self, records: &[ContentMetadata]) -> Result<(), RepositoryError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("upsert_content_metadata", e))?;

        for record in records {
            sqlx::query(
                r#"
                INSERT INTO catalog_contentmetadata (content_key, content_type, parent_content_key, json_metadata)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (content_key)
                DO UPDATE SET
                    content_type = EXCLUDED.content_type,
                    parent_content_key = EXCLUDED.parent_content_key,
                    json_metadata = EXCLUDED.json_metadata,
                    modified = NOW()
                "#,
            )
            .bind(record.content_key.as_str())
            .bind(record.content_type.as_str())
            .bind(record.parent_content_key.as_ref().map(ContentKey::as_str))
            .bind(&record.json_metadata)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("upsert_content_metadata", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("upsert_content_metadata", e))?;
        Ok(())
    }

    #[instrument(skip(self, keys), fields(catalog_query_id = %query, key_count = keys.len()), err)]
    async fn replace_query_associations(
        &self,
        query: CatalogQueryId,
        keys: &[ContentKey],
    ) -> Result<(), RepositoryError> {
        let keys: Vec<&str> = keys.iter().map(ContentKey::as_str).collect();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("replace_query_associations", e))?;

        let known: i64 = sqlx::query("SELECT COUNT(*) AS n FROM catalog_contentmetadata WHERE content_key = ANY($1)")
            .bind(&keys)
            .fetch_one(&mut *tx)
            .await
            .and_then(|row| row.try_get("n"))
            .map_err(|e| map_sqlx_error("replace_query_associations", e))?;
        let distinct = keys.iter().collect::<std::collections::BTreeSet<_>>().len();
        if known as usize != distinct {
            return Err(RepositoryError::NotFound(format!(
                "{} of {} content keys for catalog query {}",
                distinct - known as usize,
                distinct,
                query
            )));
        }

        sqlx::query("DELETE FROM catalog_contentmetadata_catalog_queries WHERE catalogquery_id = $1")
            .bind(query.get())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("replace_query_associations", e))?;

        sqlx::query(
            r#"
            INSERT INTO catalog_contentmetadata_catalog_queries (contentmetadata_id, catalogquery_id)
            SELECT m.id, $1
            FROM catalog_contentmetadata m
            WHERE m.content_key = ANY($2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(query.get())
        .bind(&keys)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("replace_query_associations", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("replace_query_associations", e))?;
        Ok(())
    }

    async fn update_json_metadata(&self, key: &ContentKey, json_metadata: Value) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE catalog_contentmetadata SET json_metadata = $2, modified = NOW() WHERE content_key = $1",
        )
        .bind(key.as_str())
        .bind(&json_metadata)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_json_metadata", e))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("content metadata {}", key)));
        }
        Ok(())
    }

    async fn associations(&self) -> Result<Vec<QueryAssociation>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT m.content_key, a.catalogquery_id
            FROM catalog_contentmetadata_catalog_queries a
            INNER JOIN catalog_contentmetadata m ON m.id = a.contentmetadata_id
            ORDER BY m.content_key ASC, a.catalogquery_id ASC
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("associations", e))?;

        rows.iter()
            .map(|row| -> Result<QueryAssociation, RepositoryError> {
                let key: String = row.try_get("content_key").map_err(|e| map_sqlx_error("associations", e))?;
                let id: i64 = row.try_get("catalogquery_id").map_err(|e| map_sqlx_error("associations", e))?;
                Ok(QueryAssociation::new(ContentKey::parse(key)?, CatalogQueryId::new(id)))
            })
            .collect()
    }
}

/// Map SQLx errors to RepositoryError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("42P01") => RepositoryError::SchemaOutdated(msg),
                Some("23503") => RepositoryError::NotFound(msg),
                _ => RepositoryError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => RepositoryError::Storage(format!("connection pool closed in {}", operation)),
        sqlx::Error::RowNotFound => RepositoryError::NotFound(format!("unexpected row not found in {}", operation)),
        other => RepositoryError::Storage(format!("sqlx error in {}: {}", operation, other)),
    }
}
