use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use catalog_core::{CatalogQueryId, ContentKey, DomainError, DomainResult};

/// Content type string used by discovery for courses.
pub const COURSE: &str = "course";

/// Kind of a content metadata record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Course,
    #[serde(rename = "courserun")]
    CourseRun,
    Program,
    #[serde(rename = "learnerpathway")]
    LearnerPathway,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Course => COURSE,
            ContentType::CourseRun => "courserun",
            ContentType::Program => "program",
            ContentType::LearnerPathway => "learnerpathway",
        }
    }

    /// Name of the discovery field holding the record's natural key.
    fn key_field(&self) -> &'static str {
        match self {
            ContentType::Course | ContentType::CourseRun => "key",
            ContentType::Program | ContentType::LearnerPathway => "uuid",
        }
    }
}

impl core::fmt::Display for ContentType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for ContentType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "course" => Ok(ContentType::Course),
            "courserun" => Ok(ContentType::CourseRun),
            "program" => Ok(ContentType::Program),
            "learnerpathway" => Ok(ContentType::LearnerPathway),
            other => Err(DomainError::validation(format!("unknown content type: {}", other))),
        }
    }
}

/// A persisted record describing one piece of content and the catalog queries
/// that currently select it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentMetadata {
    pub content_key: ContentKey,
    pub content_type: ContentType,
    pub parent_content_key: Option<ContentKey>,
    pub json_metadata: Value,
    #[serde(default)]
    pub catalog_queries: BTreeSet<CatalogQueryId>,
}

impl ContentMetadata {
    pub fn new(content_key: ContentKey, content_type: ContentType, json_metadata: Value) -> Self {
        Self {
            content_key,
            content_type,
            parent_content_key: None,
            json_metadata,
            catalog_queries: BTreeSet::new(),
        }
    }

    /// Build a record from one `/search/all/` result.
    pub fn from_search_result(item: Value) -> DomainResult<Self> {
        let content_type: ContentType = item
            .get("content_type")
            .and_then(Value::as_str)
            .ok_or_else(|| DomainError::validation("search result without content_type"))?
            .parse()?;

        let key = item
            .get(content_type.key_field())
            .and_then(Value::as_str)
            .ok_or_else(|| {
                DomainError::validation(format!(
                    "{} search result without `{}`",
                    content_type,
                    content_type.key_field()
                ))
            })?;
        let content_key = ContentKey::parse(key)?;

        let parent_content_key = match content_type {
            ContentType::CourseRun => item
                .get("course")
                .and_then(Value::as_str)
                .map(ContentKey::parse)
                .transpose()?,
            _ => None,
        };

        Ok(Self {
            content_key,
            content_type,
            parent_content_key,
            json_metadata: item,
            catalog_queries: BTreeSet::new(),
        })
    }

    pub fn is_course(&self) -> bool {
        self.content_type == ContentType::Course
    }

    /// Overlay full metadata on top of the minimal search metadata.
    ///
    /// Top-level keys from `full` win; keys only present in the current
    /// metadata are kept.
    pub fn merge_full_metadata(&mut self, full: Value) {
        match (&mut self.json_metadata, full) {
            (Value::Object(current), Value::Object(full)) => {
                for (k, v) in full {
                    current.insert(k, v);
                }
            }
            (_, full) => self.json_metadata = full,
        }
    }
}

/// One logical `ContentMetadata` ↔ `CatalogQuery` association.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QueryAssociation {
    pub content_key: ContentKey,
    pub catalog_query_id: CatalogQueryId,
}

impl QueryAssociation {
    pub fn new(content_key: ContentKey, catalog_query_id: CatalogQueryId) -> Self {
        Self {
            content_key,
            catalog_query_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn course_search_result_uses_key_field() {
        let record = ContentMetadata::from_search_result(json!({
            "content_type": "course",
            "key": "edX+DemoX",
            "title": "Demo"
        }))
        .unwrap();

        assert_eq!(record.content_key.as_str(), "edX+DemoX");
        assert!(record.is_course());
        assert!(record.parent_content_key.is_none());
    }

    #[test]
    fn course_run_records_its_parent() {
        let record = ContentMetadata::from_search_result(json!({
            "content_type": "courserun",
            "key": "course-v1:edX+DemoX+2024",
            "course": "edX+DemoX"
        }))
        .unwrap();

        assert_eq!(record.content_type, ContentType::CourseRun);
        assert_eq!(record.parent_content_key.unwrap().as_str(), "edX+DemoX");
    }

    #[test]
    fn program_search_result_uses_uuid_field() {
        let record = ContentMetadata::from_search_result(json!({
            "content_type": "program",
            "uuid": "2f6c9ad4-5f0a-4b4e-9d7e-3d1cf0b5a8a1"
        }))
        .unwrap();
        assert_eq!(record.content_type, ContentType::Program);
    }

    #[test]
    fn search_result_without_type_is_rejected() {
        assert!(ContentMetadata::from_search_result(json!({"key": "x"})).is_err());
        assert!(ContentMetadata::from_search_result(json!({"content_type": "video", "key": "x"})).is_err());
    }

    #[test]
    fn full_metadata_overrides_minimal_fields() {
        let mut record = ContentMetadata::new(
            ContentKey::parse("edX+DemoX").unwrap(),
            ContentType::Course,
            json!({"key": "edX+DemoX", "title": "short", "aggregation_key": "course:edX+DemoX"}),
        );
        record.merge_full_metadata(json!({"title": "Full title", "course_runs": []}));

        assert_eq!(record.json_metadata["title"], "Full title");
        assert_eq!(record.json_metadata["aggregation_key"], "course:edX+DemoX");
        assert_eq!(record.json_metadata["course_runs"], json!([]));
    }

    #[test]
    fn content_type_serde_matches_discovery_names() {
        assert_eq!(serde_json::to_value(ContentType::CourseRun).unwrap(), json!("courserun"));
        assert_eq!(serde_json::to_value(ContentType::LearnerPathway).unwrap(), json!("learnerpathway"));
        assert_eq!("COURSE".parse::<ContentType>().unwrap(), ContentType::Course);
    }
}
