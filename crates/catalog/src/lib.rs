//! Catalog domain module.
//!
//! This crate contains the catalog records and the selection rules the refresh
//! command relies on, implemented as deterministic domain logic (no IO, no
//! storage, no scheduling).

pub mod content;
pub mod query;

pub use content::{COURSE, ContentMetadata, ContentType, QueryAssociation};
pub use query::{CatalogQuery, EnterpriseCatalog, catalog_queries_in_use};
