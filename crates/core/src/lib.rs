//! Identifiers and errors shared by every catalog crate.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{CatalogQueryId, CatalogUuid, ContentKey, EnterpriseUuid};
