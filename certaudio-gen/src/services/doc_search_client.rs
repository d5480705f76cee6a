//! Documentation search (last fallback of coverage reconciliation)

use super::http::{base_url, build_client, get_json, rate_limiter, DirectRateLimiter};
use crate::error::ExternalError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub snippet: String,
}

/// Ranked documentation search
#[async_trait]
pub trait DocumentationSearch: Send + Sync {
    async fn search(&self, query: &str, top: usize) -> Result<Vec<SearchHit>, ExternalError>;
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchHit>,
}

pub struct HttpDocumentationSearch {
    client: reqwest::Client,
    base_url: String,
    rate_limiter: DirectRateLimiter,
}

impl HttpDocumentationSearch {
    pub fn new(
        base: &str,
        requests_per_second: u32,
        timeout: Duration,
    ) -> Result<Self, ExternalError> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url(base),
            rate_limiter: rate_limiter(requests_per_second),
        })
    }
}

#[async_trait]
impl DocumentationSearch for HttpDocumentationSearch {
    async fn search(&self, query: &str, top: usize) -> Result<Vec<SearchHit>, ExternalError> {
        let url = format!("{}/search", self.base_url);
        let response: SearchResponse = get_json(
            &self.client,
            &self.rate_limiter,
            &url,
            &[("q", query.to_string()), ("top", top.to_string())],
        )
        .await?;

        let mut hits = response.results;
        hits.truncate(top);
        Ok(hits)
    }
}
