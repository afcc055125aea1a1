// Injected adapters: the search provider and the page fetcher are external
// collaborators; the kernel only defines their ports and ships inert stubs
// for deployments without a configured provider.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

#[async_trait]
pub trait SearchClient: Send + Sync {
    async fn search(&self, query: &str) -> anyhow::Result<Vec<SearchResult>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchedPage {
    pub final_url: String,
    pub extracted_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> anyhow::Result<FetchedPage>;
}

/// No-provider stub: research rounds come back empty and the chat loop keeps
/// the model answer instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct StubSearchClient;

#[async_trait]
impl SearchClient for StubSearchClient {
    async fn search(&self, _query: &str) -> anyhow::Result<Vec<SearchResult>> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StubFetcher;

#[async_trait]
impl PageFetcher for StubFetcher {
    async fn fetch(&self, url: &str) -> anyhow::Result<FetchedPage> {
        Ok(FetchedPage {
            final_url: url.to_string(),
            extracted_text: String::new(),
            error: Some("fetcher_not_configured".to_string()),
        })
    }
}
