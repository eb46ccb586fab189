use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;
use tracing::{info, instrument, warn};

use catalog_core::ContentKey;
use catalog_domain::ContentMetadata;

use super::{TaskContext, TaskError};

/// Courses requested from discovery per call.
pub const BATCH_SIZE: usize = 10;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackfillReport {
    pub requested: usize,
    pub courses: usize,
    pub updated: usize,
    pub missing: Vec<ContentKey>,
}

/// Merge full course documents from discovery into the stored course records
/// among `content_keys`. Other content types and unknown keys are ignored.
#[instrument(skip(ctx, content_keys), fields(requested = content_keys.len()))]
pub async fn update_full_content_metadata(
    ctx: &TaskContext,
    content_keys: &[ContentKey],
) -> Result<BackfillReport, TaskError> {
    let mut courses: BTreeMap<ContentKey, ContentMetadata> = ctx
        .repository
        .content_metadata(content_keys)
        .await?
        .into_iter()
        .filter(ContentMetadata::is_course)
        .map(|r| (r.content_key.clone(), r))
        .collect();

    let mut report = BackfillReport {
        requested: content_keys.len(),
        courses: courses.len(),
        ..Default::default()
    };

    let keys: Vec<ContentKey> = courses.keys().cloned().collect();
    for batch in keys.chunks(BATCH_SIZE) {
        let documents = ctx.source.courses(batch).await?;

        let mut returned = BTreeSet::new();
        for document in documents {
            let Some(key) = document.get("key").and_then(Value::as_str).and_then(|k| ContentKey::parse(k).ok()) else {
                warn!("discovery course without a key");
                continue;
            };
            let Some(record) = courses.get_mut(&key) else {
                continue;
            };
            record.merge_full_metadata(document);
            ctx.repository
                .update_json_metadata(&key, record.json_metadata.clone())
                .await?;
            returned.insert(key);
            report.updated += 1;
        }

        for key in batch.iter().filter(|k| !returned.contains(*k)) {
            warn!(content_key = %key, "course not returned by discovery; skipped");
            report.missing.push(key.clone());
        }
    }

    info!(
        courses = report.courses,
        updated = report.updated,
        missing = report.missing.len(),
        "full course metadata updated"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_source::{ContentSource, ContentSourceError, StaticContentSource};
    use crate::repository::{CatalogRepository, InMemoryCatalogRepository};
    use catalog_domain::ContentType;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn key(k: &str) -> ContentKey {
        ContentKey::parse(k).unwrap()
    }

    /// Records every batch it is asked for.
    struct BatchRecorder {
        inner: StaticContentSource,
        batches: Mutex<Vec<usize>>,
    }

    #[async_trait::async_trait]
    impl ContentSource for BatchRecorder {
        async fn search_all(&self, filter: &Value) -> Result<Vec<Value>, ContentSourceError> {
            self.inner.search_all(filter).await
        }

        async fn courses(&self, keys: &[ContentKey]) -> Result<Vec<Value>, ContentSourceError> {
            self.batches.lock().unwrap().push(keys.len());
            self.inner.courses(keys).await
        }
    }

    #[tokio::test]
    async fn only_courses_are_backfilled_in_batches() {
        let repo = Arc::new(InMemoryCatalogRepository::new());
        let mut records = Vec::new();
        let mut source = StaticContentSource::new();
        for i in 0..23 {
            let k = format!("edX+C{:02}", i);
            records.push(ContentMetadata::new(key(&k), ContentType::Course, json!({"key": k, "title": "short"})));
            if i != 7 {
                source = source.with_course(key(&k), json!({"key": k, "title": "Full", "full_description": "..."}));
            }
        }
        records.push(ContentMetadata::new(key("run-1"), ContentType::CourseRun, json!({"key": "run-1"})));
        repo.upsert_content_metadata(&records).await.unwrap();

        let recorder = Arc::new(BatchRecorder {
            inner: source,
            batches: Mutex::new(Vec::new()),
        });
        let ctx = TaskContext::new(repo.clone(), recorder.clone(), tokio::runtime::Handle::current());

        let all_keys = repo.all_content_keys().await.unwrap();
        let report = update_full_content_metadata(&ctx, &all_keys).await.unwrap();

        assert_eq!(report.requested, 24);
        assert_eq!(report.courses, 23);
        assert_eq!(report.updated, 22);
        assert_eq!(report.missing, vec![key("edX+C07")]);
        assert_eq!(*recorder.batches.lock().unwrap(), vec![10, 10, 3]);

        let stored = repo.content_metadata(&[key("edX+C00"), key("run-1")]).await.unwrap();
        assert_eq!(stored[0].json_metadata["title"], "Full");
        assert_eq!(stored[0].json_metadata["key"], "edX+C00");
        assert_eq!(stored[1].json_metadata, json!({"key": "run-1"}));
    }

    #[tokio::test]
    async fn no_courses_means_no_discovery_calls() {
        let repo = Arc::new(InMemoryCatalogRepository::new());
        let recorder = Arc::new(BatchRecorder {
            inner: StaticContentSource::new(),
            batches: Mutex::new(Vec::new()),
        });
        let ctx = TaskContext::new(repo, recorder.clone(), tokio::runtime::Handle::current());

        let report = update_full_content_metadata(&ctx, &[key("ghost")]).await.unwrap();
        assert_eq!(report, BackfillReport { requested: 1, ..Default::default() });
        assert!(recorder.batches.lock().unwrap().is_empty());
    }
}
