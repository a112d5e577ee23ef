// Web search over a Tavily-compatible `POST /search` endpoint.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::collaborators::WebSearch;
use crate::config::SearchConfig;
use crate::conversation::{SearchImage, SearchResults, SearchSource};

#[derive(Clone)]
pub struct SearchClient {
    api_url: String,
    api_key: Option<String>,
    max_results: u32,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct SearchRequestBody<'a> {
    query: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_key: Option<&'a str>,
    max_results: u32,
    include_answer: bool,
    include_images: bool,
    include_image_descriptions: bool,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    results: Vec<SearchHit>,
    #[serde(default)]
    images: Vec<ImageHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(default)]
    title: String,
    url: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    score: f64,
    #[serde(default)]
    published_date: Option<String>,
}

/// Images come back as bare URLs or, with descriptions enabled, as objects.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ImageHit {
    Url(String),
    Described {
        url: String,
        #[serde(default)]
        description: Option<String>,
    },
}

impl From<ImageHit> for SearchImage {
    fn from(hit: ImageHit) -> Self {
        match hit {
            ImageHit::Url(url) => SearchImage {
                url,
                title: None,
                alt: None,
            },
            ImageHit::Described { url, description } => SearchImage {
                url,
                title: None,
                alt: description,
            },
        }
    }
}

impl SearchResponse {
    fn into_results(self, fallback_query: &str) -> SearchResults {
        SearchResults {
            answer: self.answer.unwrap_or_default(),
            sources: self
                .results
                .into_iter()
                .map(|hit| SearchSource {
                    title: if hit.title.trim().is_empty() {
                        hit.url.clone()
                    } else {
                        hit.title
                    },
                    url: hit.url,
                    content: hit.content,
                    score: hit.score,
                    published_date: hit.published_date,
                })
                .collect(),
            images: self.images.into_iter().map(SearchImage::from).collect(),
            query: self
                .query
                .filter(|q| !q.trim().is_empty())
                .unwrap_or_else(|| fallback_query.to_string()),
        }
    }
}

impl SearchClient {
    pub fn new(config: &SearchConfig, client: reqwest::Client) -> Self {
        Self {
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|key| !key.trim().is_empty()),
            max_results: config.max_results.max(1),
            client,
        }
    }
}

#[async_trait]
impl WebSearch for SearchClient {
    async fn search_web(&self, query: &str) -> Result<SearchResults> {
        let query = query.trim();
        if query.is_empty() {
            anyhow::bail!("Search query is empty");
        }

        let url = format!("{}/search", self.api_url);
        let body = SearchRequestBody {
            query,
            api_key: self.api_key.as_deref(),
            max_results: self.max_results,
            include_answer: true,
            include_images: true,
            include_image_descriptions: true,
        };

        let mut req = self.client.post(&url).json(&body);
        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let response = req.send().await.context("Failed to send search request")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("Search API returned error {}: {}", status, body);
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .context("Failed to parse search response")?;

        tracing::debug!(
            "Search '{}' returned {} sources, {} images",
            query,
            parsed.results.len(),
            parsed.images.len()
        );
        Ok(parsed.into_results(query))
    }
}
