//! HTTP client for the course discovery service.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use catalog_core::ContentKey;

use super::{ContentSource, ContentSourceError};

const SEARCH_ALL_PATH: &str = "/api/v1/search/all/";
const COURSES_PATH: &str = "/api/v1/courses/";
const PAGE_SIZE: usize = 100;

/// One page of a paginated discovery listing.
#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default)]
    results: Vec<Value>,
    next: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DiscoveryClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl DiscoveryClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ContentSourceError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ContentSourceError::Config(format!(
                "discovery API URL must be http(s): {}",
                base_url
            )));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("catalog-manage/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ContentSourceError::Config(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            token: None,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn read_page(&self, request: reqwest::RequestBuilder) -> Result<Page, ContentSourceError> {
        let resp = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| ContentSourceError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(ContentSourceError::Api {
                status: resp.status().as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }

        resp.json().await.map_err(|e| ContentSourceError::Parse(e.to_string()))
    }

    /// Follow `next` links until the listing is exhausted.
    async fn collect_pages(
        &self,
        first: reqwest::RequestBuilder,
        follow: impl Fn(&str) -> reqwest::RequestBuilder + Send + Sync,
    ) -> Result<Vec<Value>, ContentSourceError> {
        let mut results = Vec::new();
        let mut page = self.read_page(first).await?;
        let mut pages = 1;

        loop {
            results.append(&mut page.results);
            let Some(next) = page.next.take() else {
                break;
            };
            page = self.read_page(follow(&next)).await?;
            pages += 1;
        }

        debug!(pages, results = results.len(), "discovery listing read");
        Ok(results)
    }
}

#[async_trait::async_trait]
impl ContentSource for DiscoveryClient {
    async fn search_all(&self, content_filter: &Value) -> Result<Vec<Value>, ContentSourceError> {
        let url = format!("{}{}", self.base_url, SEARCH_ALL_PATH);
        let first = self
            .client
            .post(&url)
            .query(&[("page_size", PAGE_SIZE)])
            .json(content_filter);

        // the filter travels in the body of every page request
        self.collect_pages(first, |next| self.client.post(next).json(content_filter))
            .await
    }

    async fn courses(&self, keys: &[ContentKey]) -> Result<Vec<Value>, ContentSourceError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}{}", self.base_url, COURSES_PATH);
        let joined = keys.iter().map(ContentKey::as_str).collect::<Vec<_>>().join(",");
        let page_size = keys.len().to_string();
        let first = self
            .client
            .get(&url)
            .query(&[("keys", joined.as_str()), ("page_size", page_size.as_str())]);

        self.collect_pages(first, |next| self.client.get(next)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one JSON body per connection, recording each request line.
    /// `bodies` receives the server's base URL so pages can link to each other.
    async fn serve(bodies: impl FnOnce(&str) -> Vec<Value>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let bodies = bodies(&base);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorded = seen.clone();

        tokio::spawn(async move {
            for body in bodies {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = vec![0u8; 16 * 1024];
                let n = socket.read(&mut buf).await.unwrap();
                let request = String::from_utf8_lossy(&buf[..n]).to_string();
                recorded.lock().unwrap().push(request);

                let body = body.to_string();
                let resp = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                socket.write_all(resp.as_bytes()).await.unwrap();
                let _ = socket.shutdown().await;
            }
        });

        (base, seen)
    }

    #[test]
    fn rejects_non_http_base_url() {
        assert!(matches!(
            DiscoveryClient::new("ftp://discovery"),
            Err(ContentSourceError::Config(_))
        ));
    }

    #[tokio::test]
    async fn search_all_follows_next_links() {
        let (base, seen) = serve(|base| {
            vec![
                json!({"results": [{"key": "a"}], "next": format!("{}{}?page=2", base, SEARCH_ALL_PATH)}),
                json!({"results": [{"key": "b"}, {"key": "c"}], "next": null}),
            ]
        })
        .await;

        let client = DiscoveryClient::new(format!("{}/", base)).unwrap().with_token("secret");
        let results = client.search_all(&json!({"content_type": "course"})).await.unwrap();

        let keys: Vec<&str> = results.iter().filter_map(|r| r["key"].as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);

        let seen = seen.lock().unwrap();
        assert!(seen[0].starts_with("POST /api/v1/search/all/?page_size=100 "));
        assert!(seen[0].to_lowercase().contains("authorization: bearer secret"));
        assert!(seen[1].starts_with("POST /api/v1/search/all/?page=2 "));
    }

    #[tokio::test]
    async fn courses_requests_keys_in_one_call() {
        let (base, seen) = serve(|_| vec![json!({"results": [{"key": "edX+A"}], "next": null})]).await;

        let client = DiscoveryClient::new(base).unwrap();
        let keys = vec![ContentKey::parse("edX+A").unwrap(), ContentKey::parse("edX+B").unwrap()];
        let results = client.courses(&keys).await.unwrap();

        assert_eq!(results.len(), 1);
        let request = &seen.lock().unwrap()[0];
        assert!(request.starts_with("GET /api/v1/courses/?keys=edX%2BA%2CedX%2BB&page_size=2 "));
    }

    #[tokio::test]
    async fn courses_without_keys_skips_the_network() {
        let client = DiscoveryClient::new("http://127.0.0.1:9").unwrap();
        assert!(client.courses(&[]).await.unwrap().is_empty());
    }
}
