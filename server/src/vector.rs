//! Vector Store and Embedding Seams
//!
//! The FAQ and policy nodes query ranked documents from named collections;
//! the semantic cache keys on query embeddings. Both wire protocols stay
//! behind these traits.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Errors from the vector store or embedder.
#[derive(Debug, Error)]
pub enum VectorError {
    /// Transport-level failure.
    #[error("vector transport error: {0}")]
    Transport(String),

    /// Endpoint returned a non-success status or malformed body.
    #[error("vector endpoint error: {0}")]
    Endpoint(String),

    /// No endpoint configured.
    #[error("vector store not configured")]
    NotConfigured,
}

/// One ranked document from a collection search.
#[derive(Debug, Clone, Deserialize)]
pub struct ScoredDocument {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub score: f32,
}

/// Ranked search over named collections.
#[async_trait]
pub trait VectorStore: Send + Sync + 'static {
    /// Top-`k` documents for `query` in `collection`.
    async fn search(
        &self,
        collection: &str,
        query: &str,
        k: usize,
    ) -> Result<Vec<ScoredDocument>, VectorError>;
}

/// Text → embedding.
#[async_trait]
pub trait Embedder: Send + Sync + 'static {
    /// Embed one query string.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, VectorError>;
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    results: Vec<ScoredDocument>,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

/// HTTP vector search adapter (`POST {endpoint}/search`).
pub struct HttpVectorStore {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpVectorStore {
    /// Build an adapter for a search endpoint.
    pub fn new(endpoint: String) -> Result<Self, VectorError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| VectorError::Transport(e.to_string()))?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl VectorStore for HttpVectorStore {
    async fn search(
        &self,
        collection: &str,
        query: &str,
        k: usize,
    ) -> Result<Vec<ScoredDocument>, VectorError> {
        let body = serde_json::json!({
            "collection": collection,
            "query": query,
            "limit": k,
        });

        let response = self
            .client
            .post(format!("{}/search", self.endpoint))
            .json(&body)
            .send()
            .await
            .map_err(|e| VectorError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(VectorError::Endpoint(format!(
                "status {}",
                response.status()
            )));
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| VectorError::Endpoint(e.to_string()))?;
        Ok(parsed.results)
    }
}

/// HTTP embedding adapter (`POST {endpoint}/embed`).
pub struct HttpEmbedder {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpEmbedder {
    /// Build an adapter for an embedding endpoint.
    pub fn new(endpoint: String) -> Result<Self, VectorError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| VectorError::Transport(e.to_string()))?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, VectorError> {
        let response = self
            .client
            .post(format!("{}/embed", self.endpoint))
            .json(&serde_json::json!({"input": text}))
            .send()
            .await
            .map_err(|e| VectorError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(VectorError::Endpoint(format!(
                "status {}",
                response.status()
            )));
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| VectorError::Endpoint(e.to_string()))?;
        Ok(parsed.embedding)
    }
}

/// Stand-ins when no endpoints are configured. Search yields nothing and
/// embeddings are empty, which the cache treats as always-miss.
pub struct UnconfiguredVectorStore;

#[async_trait]
impl VectorStore for UnconfiguredVectorStore {
    async fn search(
        &self,
        _collection: &str,
        _query: &str,
        _k: usize,
    ) -> Result<Vec<ScoredDocument>, VectorError> {
        Err(VectorError::NotConfigured)
    }
}

/// See [`UnconfiguredVectorStore`].
pub struct UnconfiguredEmbedder;

#[async_trait]
impl Embedder for UnconfiguredEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, VectorError> {
        Err(VectorError::NotConfigured)
    }
}
