//! Fixed, in-process content source for development and tests.

use std::collections::BTreeMap;

use serde_json::Value;

use catalog_core::ContentKey;

use super::{ContentSource, ContentSourceError};

#[derive(Debug, Clone, Default)]
pub struct StaticContentSource {
    /// Keyed by the serialized content filter.
    searches: BTreeMap<String, Vec<Value>>,
    courses: BTreeMap<ContentKey, Value>,
    failing: Vec<String>,
}

impl StaticContentSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_search_results(mut self, content_filter: &Value, results: Vec<Value>) -> Self {
        self.searches.insert(content_filter.to_string(), results);
        self
    }

    pub fn with_course(mut self, key: ContentKey, course: Value) -> Self {
        self.courses.insert(key, course);
        self
    }

    /// Searches for `content_filter` fail with an API error.
    pub fn failing_on(mut self, content_filter: &Value) -> Self {
        self.failing.push(content_filter.to_string());
        self
    }
}

#[async_trait::async_trait]
impl ContentSource for StaticContentSource {
    async fn search_all(&self, content_filter: &Value) -> Result<Vec<Value>, ContentSourceError> {
        let filter = content_filter.to_string();
        if self.failing.contains(&filter) {
            return Err(ContentSourceError::Api {
                status: 503,
                body: format!("search unavailable for {}", filter),
            });
        }
        Ok(self.searches.get(&filter).cloned().unwrap_or_default())
    }

    async fn courses(&self, keys: &[ContentKey]) -> Result<Vec<Value>, ContentSourceError> {
        Ok(keys.iter().filter_map(|k| self.courses.get(k).cloned()).collect())
    }
}
