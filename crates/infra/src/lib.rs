//! Infrastructure layer: jobs, persistence, schema migrations, external services.

pub mod content_source;
pub mod jobs;
pub mod repository;
pub mod schema;
pub mod tasks;
