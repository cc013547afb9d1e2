//! External search collaborator.
//!
//! Used as the last resort when the local appliance table cannot estimate
//! a device's consumption, and to show related snippets on the device
//! detail page. The service is slow and unreliable; callers always bound
//! it with a timeout and treat failure as "no results".

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;

pub const GOOGLE_SEARCH_URL: &str = "https://www.googleapis.com/customsearch/v1";

/// Transport-level cap on a single search request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("search API returned HTTP {0}")]
    Status(u16),

    #[error("malformed search response: {0}")]
    Format(String),
}

/// One ranked search result.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SearchHit {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub snippet: String,
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Run a free-text query. Results keep the provider's ranking.
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, SearchError>;
}

#[derive(Debug, Deserialize)]
struct CustomSearchResponse {
    #[serde(default)]
    items: Vec<SearchHit>,
}

/// Google Custom Search JSON API client.
#[derive(Clone)]
pub struct GoogleSearchClient {
    base_url: String,
    api_key: String,
    engine_id: String,
    http: Client,
}

impl GoogleSearchClient {
    pub fn new(api_key: String, engine_id: String) -> Self {
        Self::with_base_url(GOOGLE_SEARCH_URL.to_string(), api_key, engine_id)
    }

    pub fn with_base_url(base_url: String, api_key: String, engine_id: String) -> Self {
        Self {
            base_url,
            api_key,
            engine_id,
            http: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl SearchProvider for GoogleSearchClient {
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, SearchError> {
        let response = self
            .http
            .get(&self.base_url)
            .query(&[
                ("key", self.api_key.as_str()),
                ("cx", self.engine_id.as_str()),
                ("q", query),
            ])
            .send()
            .await
            .map_err(|err| SearchError::Network(err.to_string()))?;

        if !response.status().is_success() {
            return Err(SearchError::Status(response.status().as_u16()));
        }

        let body = response
            .json::<CustomSearchResponse>()
            .await
            .map_err(|err| SearchError::Format(err.to_string()))?;

        Ok(body.items)
    }
}

/// Provider used when no API credentials are configured.
pub struct DisabledSearch;

#[async_trait]
impl SearchProvider for DisabledSearch {
    async fn search(&self, _query: &str) -> Result<Vec<SearchHit>, SearchError> {
        Ok(Vec::new())
    }
}
