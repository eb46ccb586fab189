use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use catalog_core::{CatalogQueryId, CatalogUuid, DomainError, DomainResult, EnterpriseUuid};

/// A saved search definition used to select content for one or more catalogs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogQuery {
    pub id: CatalogQueryId,
    pub uuid: Uuid,
    /// Discovery search filter, always a JSON object.
    pub content_filter: Value,
    pub title: Option<String>,
}

impl CatalogQuery {
    pub fn new(id: CatalogQueryId, content_filter: Value) -> DomainResult<Self> {
        if !content_filter.is_object() {
            return Err(DomainError::validation(format!(
                "content_filter of catalog query {} must be a JSON object",
                id
            )));
        }
        Ok(Self {
            id,
            uuid: Uuid::new_v4(),
            content_filter,
            title: None,
        })
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

impl core::fmt::Display for CatalogQuery {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match &self.title {
            Some(title) => write!(f, "CatalogQuery({}, {})", self.id, title),
            None => write!(f, "CatalogQuery({})", self.id),
        }
    }
}

/// An enterprise customer's catalog. Points at (at most) one catalog query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnterpriseCatalog {
    pub uuid: CatalogUuid,
    pub title: String,
    pub enterprise_uuid: EnterpriseUuid,
    pub catalog_query: Option<CatalogQueryId>,
}

/// Catalog queries referenced by at least one catalog, each exactly once,
/// ordered by id.
///
/// Queries nobody consumes are dropped so the refresh never spends discovery
/// calls on them.
pub fn catalog_queries_in_use(
    queries: &[CatalogQuery],
    catalogs: &[EnterpriseCatalog],
) -> Vec<CatalogQuery> {
    let by_id: BTreeMap<CatalogQueryId, &CatalogQuery> =
        queries.iter().map(|q| (q.id, q)).collect();

    let mut in_use: BTreeMap<CatalogQueryId, CatalogQuery> = BTreeMap::new();
    for catalog in catalogs {
        let Some(query_id) = catalog.catalog_query else {
            continue;
        };
        if let Some(query) = by_id.get(&query_id) {
            in_use.entry(query_id).or_insert_with(|| (*query).clone());
        }
    }

    in_use.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn query(id: i64) -> CatalogQuery {
        CatalogQuery::new(CatalogQueryId::new(id), json!({"content_type": "course"})).unwrap()
    }

    fn catalog(query_id: Option<i64>) -> EnterpriseCatalog {
        EnterpriseCatalog {
            uuid: CatalogUuid::new(),
            title: "catalog".to_string(),
            enterprise_uuid: EnterpriseUuid::new(),
            catalog_query: query_id.map(CatalogQueryId::new),
        }
    }

    #[test]
    fn content_filter_must_be_an_object() {
        let err = CatalogQuery::new(CatalogQueryId::new(1), json!(["course"])).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn unreferenced_queries_are_skipped() {
        let queries = vec![query(1), query(2), query(3)];
        let catalogs = vec![catalog(Some(3)), catalog(None), catalog(Some(1))];

        let ids: Vec<i64> = catalog_queries_in_use(&queries, &catalogs)
            .iter()
            .map(|q| q.id.get())
            .collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn shared_query_is_returned_once() {
        let queries = vec![query(7)];
        let catalogs = vec![catalog(Some(7)), catalog(Some(7)), catalog(Some(7))];
        assert_eq!(catalog_queries_in_use(&queries, &catalogs).len(), 1);
    }

    proptest! {
        #[test]
        fn selection_is_exactly_the_referenced_queries(
            query_ids in proptest::collection::btree_set(1i64..50, 0..20),
            refs in proptest::collection::vec(proptest::option::of(1i64..60), 0..30),
        ) {
            let queries: Vec<CatalogQuery> = query_ids.iter().map(|id| query(*id)).collect();
            let catalogs: Vec<EnterpriseCatalog> = refs.iter().map(|r| catalog(*r)).collect();

            let selected: Vec<i64> = catalog_queries_in_use(&queries, &catalogs)
                .iter()
                .map(|q| q.id.get())
                .collect();

            let expected: BTreeSet<i64> = refs
                .iter()
                .flatten()
                .copied()
                .filter(|id| query_ids.contains(id))
                .collect();

            prop_assert_eq!(selected, expected.into_iter().collect::<Vec<_>>());
        }
    }
}
