use std::collections::BTreeMap;

use tracing::{info, instrument, warn};

use catalog_core::{CatalogQueryId, ContentKey};
use catalog_domain::ContentMetadata;

use super::{TaskContext, TaskError};

/// What one catalog query refresh did.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshReport {
    pub catalog_query_id: CatalogQueryId,
    pub content_keys: Vec<ContentKey>,
    /// Search results that could not be turned into records.
    pub skipped: usize,
}

/// Pull everything matching the query's content filter from discovery, store
/// it, and make the query's associations exactly the returned content.
#[instrument(skip(ctx))]
pub async fn update_catalog_metadata(
    ctx: &TaskContext,
    catalog_query_id: CatalogQueryId,
) -> Result<RefreshReport, TaskError> {
    let query = ctx
        .repository
        .catalog_query(catalog_query_id)
        .await?
        .ok_or(TaskError::QueryNotFound(catalog_query_id))?;

    let results = ctx.source.search_all(&query.content_filter).await?;

    let mut skipped = 0;
    let mut records: BTreeMap<ContentKey, ContentMetadata> = BTreeMap::new();
    for item in results {
        match ContentMetadata::from_search_result(item) {
            Ok(record) => {
                records.insert(record.content_key.clone(), record);
            }
            Err(e) => {
                warn!(error = %e, "skipping unusable search result");
                skipped += 1;
            }
        }
    }

    let records: Vec<ContentMetadata> = records.into_values().collect();
    ctx.repository.upsert_content_metadata(&records).await?;

    let content_keys: Vec<ContentKey> = records.into_iter().map(|r| r.content_key).collect();
    ctx.repository
        .replace_query_associations(catalog_query_id, &content_keys)
        .await?;

    info!(
        catalog_query_id = %catalog_query_id,
        content_count = content_keys.len(),
        skipped,
        "catalog query metadata refreshed"
    );

    Ok(RefreshReport {
        catalog_query_id,
        content_keys,
        skipped,
    })
}
