//! FAQ Semantic Cache
//!
//! Queries are embedded and matched against stored entries by cosine
//! similarity. A hit at or above the threshold returns the cached payload
//! and bumps its hit count; misses are inserted after the vector search.

use std::sync::Arc;

use tracing::debug;

use crate::persistence::Persistence;
use crate::vector::Embedder;

/// Embedding-keyed cache over the persistence gateway.
pub struct SemanticCache {
    persistence: Arc<dyn Persistence>,
    embedder: Arc<dyn Embedder>,
    threshold: f32,
}

impl SemanticCache {
    /// Cache with the configured similarity threshold.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        embedder: Arc<dyn Embedder>,
        threshold: f32,
    ) -> Self {
        Self {
            persistence,
            embedder,
            threshold,
        }
    }

    /// Look up a query. Returns the cached payload on a hit, and the query
    /// embedding (when available) for a later insert on a miss.
    pub async fn lookup(&self, query: &str) -> (Option<serde_json::Value>, Option<Vec<f32>>) {
        let embedding = match self.embedder.embed(query).await {
            Ok(embedding) if !embedding.is_empty() => embedding,
            Ok(_) => return (None, None),
            Err(e) => {
                debug!(error = %e, "Embedding unavailable, cache bypassed");
                return (None, None);
            }
        };

        match self
            .persistence
            .faq_cache_lookup(&embedding, self.threshold)
            .await
        {
            Ok(Some(entry)) => (Some(entry.result_payload), Some(embedding)),
            Ok(None) => (None, Some(embedding)),
            Err(e) => {
                debug!(error = %e, "Cache lookup failed, treating as miss");
                (None, Some(embedding))
            }
        }
    }

    /// Store a fresh result under its query embedding.
    pub async fn insert(&self, embedding: &[f32], payload: serde_json::Value) {
        if let Err(e) = self.persistence.faq_cache_insert(embedding, payload).await {
            debug!(error = %e, "Cache insert failed");
        }
    }
}
