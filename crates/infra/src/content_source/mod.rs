//! Where content metadata comes from.

use serde_json::Value;
use thiserror::Error;

use catalog_core::ContentKey;

pub mod discovery;
pub mod fixture;

pub use discovery::DiscoveryClient;
pub use fixture::StaticContentSource;

#[derive(Debug, Error)]
pub enum ContentSourceError {
    #[error("network error: {0}")]
    Network(String),

    #[error("discovery API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

#[async_trait::async_trait]
pub trait ContentSource: Send + Sync {
    /// Every search result matching `content_filter`, across all pages.
    async fn search_all(&self, content_filter: &Value) -> Result<Vec<Value>, ContentSourceError>;

    /// Full course documents for `keys`. Keys discovery does not know are absent from the result.
    async fn courses(&self, keys: &[ContentKey]) -> Result<Vec<Value>, ContentSourceError>;
}
