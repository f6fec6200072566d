//! Persistence Gateway
//!
//! Write-through interface to the durable stores: consultation sessions,
//! transcripts, per-node analysis results and the FAQ semantic cache.
//! Live fan-out never waits on these writes and is never rolled back when
//! they fail.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Errors from the durable stores.
#[derive(Debug, Error)]
pub enum PersistError {
    /// Database error after retries were exhausted.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Unknown session id.
    #[error("session not found: {0}")]
    SessionNotFound(Uuid),
}

/// One transcript row to append, keyed by `(session_id, turn_index)`.
#[derive(Debug, Clone)]
pub struct TranscriptRow {
    pub turn_index: i64,
    pub speaker_type: String,
    pub speaker_name: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub confidence: f32,
    pub is_final: bool,
    pub source: String,
}

/// One analysis result to append, keyed by `(session_id, turn_id, result_type)`.
#[derive(Debug, Clone)]
pub struct AgentResultRow {
    pub turn_id: String,
    pub result_type: String,
    pub result_data: serde_json::Value,
    pub processing_time_ms: i64,
    pub model_version: String,
}

/// FAQ semantic cache entry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub id: Uuid,
    pub query_embedding: Vec<f32>,
    pub result_payload: serde_json::Value,
    pub hit_count: i64,
    pub created_at: DateTime<Utc>,
}

/// Write-through persistence interface.
///
/// All writes are idempotent under replay; a replayed transcript or result
/// row with an already-seen key is a no-op.
#[async_trait]
pub trait Persistence: Send + Sync + 'static {
    /// Open a durable session record for a room. Returns the session id.
    async fn session_begin(&self, room_name: &str) -> Result<Uuid, PersistError>;

    /// Append one transcript turn.
    async fn transcript_append(
        &self,
        session_id: Uuid,
        row: TranscriptRow,
    ) -> Result<(), PersistError>;

    /// Append one analysis node result.
    async fn agent_result_write(
        &self,
        session_id: Uuid,
        row: AgentResultRow,
    ) -> Result<(), PersistError>;

    /// Finalize the session record. Returns false if the session was
    /// already ended.
    async fn session_end(
        &self,
        session_id: Uuid,
        final_summary: &str,
        consultation_type: &str,
    ) -> Result<bool, PersistError>;

    /// Best cosine match at or above `threshold`, with `hit_count`
    /// incremented on a hit.
    async fn faq_cache_lookup(
        &self,
        embedding: &[f32],
        threshold: f32,
    ) -> Result<Option<CacheEntry>, PersistError>;

    /// Insert a fresh cache entry.
    async fn faq_cache_insert(
        &self,
        embedding: &[f32],
        payload: serde_json::Value,
    ) -> Result<(), PersistError>;
}

/// Cosine similarity of two embeddings; 0.0 when either is degenerate.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// `PostgreSQL`-backed gateway.
pub struct PgPersistence {
    pool: PgPool,
}

impl PgPersistence {
    /// Wrap a connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run a write with bounded exponential backoff (3 attempts:
    /// 100ms, 200ms, 400ms). The caller decides whether a final failure
    /// is dropped or surfaced.
    async fn with_retry<F, Fut, T>(op_name: &str, mut op: F) -> Result<T, PersistError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, sqlx::Error>>,
    {
        const MAX_RETRIES: u32 = 3;
        let mut delay = Duration::from_millis(100);

        for attempt in 1..=MAX_RETRIES {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(op = op_name, attempt, "Write succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if attempt < MAX_RETRIES => {
                    warn!(
                        op = op_name,
                        attempt,
                        error = %e,
                        "Write failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(PersistError::Database(e)),
            }
        }
        unreachable!("retry loop always returns")
    }

    fn embedding_to_json(embedding: &[f32]) -> serde_json::Value {
        serde_json::Value::Array(
            embedding
                .iter()
                .map(|v| {
                    serde_json::Number::from_f64(f64::from(*v))
                        .map_or(serde_json::Value::Null, serde_json::Value::Number)
                })
                .collect(),
        )
    }

    fn embedding_from_json(value: &serde_json::Value) -> Vec<f32> {
        value
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(serde_json::Value::as_f64)
                    .map(|v| v as f32)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl Persistence for PgPersistence {
    async fn session_begin(&self, room_name: &str) -> Result<Uuid, PersistError> {
        let session_id = Uuid::new_v4();
        let pool = self.pool.clone();
        let room = room_name.to_string();

        Self::with_retry("session_begin", || {
            let pool = pool.clone();
            let room = room.clone();
            async move {
                sqlx::query(
                    "INSERT INTO consultation_sessions (id, room_name, started_at)
                     VALUES ($1, $2, NOW())",
                )
                .bind(session_id)
                .bind(room)
                .execute(&pool)
                .await
                .map(|_| ())
            }
        })
        .await?;

        Ok(session_id)
    }

    async fn transcript_append(
        &self,
        session_id: Uuid,
        row: TranscriptRow,
    ) -> Result<(), PersistError> {
        let pool = self.pool.clone();

        Self::with_retry("transcript_append", || {
            let pool = pool.clone();
            let row = row.clone();
            async move {
                sqlx::query(
                    "INSERT INTO consultation_transcripts
                         (session_id, turn_index, speaker_type, speaker_name, text,
                          spoken_at, confidence, is_final, source)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                     ON CONFLICT (session_id, turn_index) DO NOTHING",
                )
                .bind(session_id)
                .bind(row.turn_index)
                .bind(row.speaker_type)
                .bind(row.speaker_name)
                .bind(row.text)
                .bind(row.timestamp)
                .bind(row.confidence)
                .bind(row.is_final)
                .bind(row.source)
                .execute(&pool)
                .await
                .map(|_| ())
            }
        })
        .await
    }

    async fn agent_result_write(
        &self,
        session_id: Uuid,
        row: AgentResultRow,
    ) -> Result<(), PersistError> {
        let pool = self.pool.clone();

        Self::with_retry("agent_result_write", || {
            let pool = pool.clone();
            let row = row.clone();
            async move {
                sqlx::query(
                    "INSERT INTO consultation_agent_results
                         (session_id, turn_id, result_type, result_data,
                          processing_time_ms, model_version, created_at)
                     VALUES ($1, $2, $3, $4, $5, $6, NOW())
                     ON CONFLICT (session_id, turn_id, result_type) DO NOTHING",
                )
                .bind(session_id)
                .bind(row.turn_id)
                .bind(row.result_type)
                .bind(row.result_data)
                .bind(row.processing_time_ms)
                .bind(row.model_version)
                .execute(&pool)
                .await
                .map(|_| ())
            }
        })
        .await
    }

    async fn session_end(
        &self,
        session_id: Uuid,
        final_summary: &str,
        consultation_type: &str,
    ) -> Result<bool, PersistError> {
        let pool = self.pool.clone();
        let summary = final_summary.to_string();
        let kind = consultation_type.to_string();

        let rows = Self::with_retry("session_end", || {
            let pool = pool.clone();
            let summary = summary.clone();
            let kind = kind.clone();
            async move {
                sqlx::query(
                    "UPDATE consultation_sessions
                     SET ended_at = NOW(),
                         duration_seconds = EXTRACT(EPOCH FROM NOW() - started_at)::INT,
                         final_summary = $2,
                         consultation_type = $3
                     WHERE id = $1 AND ended_at IS NULL",
                )
                .bind(session_id)
                .bind(summary)
                .bind(kind)
                .execute(&pool)
                .await
                .map(|done| done.rows_affected())
            }
        })
        .await?;

        Ok(rows > 0)
    }

    async fn faq_cache_lookup(
        &self,
        embedding: &[f32],
        threshold: f32,
    ) -> Result<Option<CacheEntry>, PersistError> {
        // Bounded scan of the most recent entries; similarity is computed
        // in-process, the embeddings are stored as JSONB.
        let rows: Vec<(Uuid, serde_json::Value, serde_json::Value, i64, DateTime<Utc>)> =
            sqlx::query_as(
                "SELECT id, query_embedding, result_payload, hit_count, created_at
                 FROM faq_cache
                 ORDER BY created_at DESC
                 LIMIT 256",
            )
            .fetch_all(&self.pool)
            .await?;

        let mut best: Option<(CacheEntry, f32)> = None;
        for (id, stored, payload, hit_count, created_at) in rows {
            let stored_embedding = Self::embedding_from_json(&stored);
            let similarity = cosine_similarity(embedding, &stored_embedding);
            if similarity >= threshold
                && best.as_ref().is_none_or(|(_, s)| similarity > *s)
            {
                best = Some((
                    CacheEntry {
                        id,
                        query_embedding: stored_embedding,
                        result_payload: payload,
                        hit_count,
                        created_at,
                    },
                    similarity,
                ));
            }
        }

        if let Some((entry, _)) = best {
            sqlx::query("UPDATE faq_cache SET hit_count = hit_count + 1 WHERE id = $1")
                .bind(entry.id)
                .execute(&self.pool)
                .await?;
            return Ok(Some(entry));
        }
        Ok(None)
    }

    async fn faq_cache_insert(
        &self,
        embedding: &[f32],
        payload: serde_json::Value,
    ) -> Result<(), PersistError> {
        sqlx::query(
            "INSERT INTO faq_cache (id, query_embedding, result_payload, hit_count, created_at)
             VALUES ($1, $2, $3, 0, NOW())",
        )
        .bind(Uuid::new_v4())
        .bind(Self::embedding_to_json(embedding))
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// In-memory gateway for tests and STT/agent development without a database.
#[derive(Default)]
pub struct MemoryPersistence {
    inner: std::sync::Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    sessions: std::collections::HashMap<Uuid, MemorySession>,
    cache: Vec<CacheEntry>,
}

struct MemorySession {
    #[allow(dead_code)]
    room_name: String,
    ended: bool,
    transcripts: std::collections::BTreeMap<i64, TranscriptRow>,
    results: std::collections::HashMap<(String, String), AgentResultRow>,
}

impl MemoryPersistence {
    /// Fresh empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored transcript rows for a session.
    #[must_use]
    pub fn transcript_count(&self, session_id: Uuid) -> usize {
        self.inner
            .lock()
            .unwrap()
            .sessions
            .get(&session_id)
            .map_or(0, |s| s.transcripts.len())
    }

    /// Stored result payload for `(turn_id, result_type)`.
    #[must_use]
    pub fn result(&self, session_id: Uuid, turn_id: &str, result_type: &str) -> Option<serde_json::Value> {
        self.inner
            .lock()
            .unwrap()
            .sessions
            .get(&session_id)
            .and_then(|s| s.results.get(&(turn_id.to_string(), result_type.to_string())))
            .map(|r| r.result_data.clone())
    }

    /// Number of stored analysis results for a session.
    #[must_use]
    pub fn result_count(&self, session_id: Uuid) -> usize {
        self.inner
            .lock()
            .unwrap()
            .sessions
            .get(&session_id)
            .map_or(0, |s| s.results.len())
    }

    /// Whether the session has been ended.
    #[must_use]
    pub fn session_ended(&self, session_id: Uuid) -> bool {
        self.inner
            .lock()
            .unwrap()
            .sessions
            .get(&session_id)
            .is_some_and(|s| s.ended)
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn session_begin(&self, room_name: &str) -> Result<Uuid, PersistError> {
        let session_id = Uuid::new_v4();
        self.inner.lock().unwrap().sessions.insert(
            session_id,
            MemorySession {
                room_name: room_name.to_string(),
                ended: false,
                transcripts: std::collections::BTreeMap::new(),
                results: std::collections::HashMap::new(),
            },
        );
        Ok(session_id)
    }

    async fn transcript_append(
        &self,
        session_id: Uuid,
        row: TranscriptRow,
    ) -> Result<(), PersistError> {
        let mut inner = self.inner.lock().unwrap();
        let session = inner
            .sessions
            .get_mut(&session_id)
            .ok_or(PersistError::SessionNotFound(session_id))?;
        session.transcripts.entry(row.turn_index).or_insert(row);
        Ok(())
    }

    async fn agent_result_write(
        &self,
        session_id: Uuid,
        row: AgentResultRow,
    ) -> Result<(), PersistError> {
        let mut inner = self.inner.lock().unwrap();
        let session = inner
            .sessions
            .get_mut(&session_id)
            .ok_or(PersistError::SessionNotFound(session_id))?;
        session
            .results
            .entry((row.turn_id.clone(), row.result_type.clone()))
            .or_insert(row);
        Ok(())
    }

    async fn session_end(
        &self,
        session_id: Uuid,
        _final_summary: &str,
        _consultation_type: &str,
    ) -> Result<bool, PersistError> {
        let mut inner = self.inner.lock().unwrap();
        let session = inner
            .sessions
            .get_mut(&session_id)
            .ok_or(PersistError::SessionNotFound(session_id))?;
        if session.ended {
            return Ok(false);
        }
        session.ended = true;
        Ok(true)
    }

    async fn faq_cache_lookup(
        &self,
        embedding: &[f32],
        threshold: f32,
    ) -> Result<Option<CacheEntry>, PersistError> {
        let mut inner = self.inner.lock().unwrap();
        let mut best: Option<(usize, f32)> = None;
        for (idx, entry) in inner.cache.iter().enumerate() {
            let similarity = cosine_similarity(embedding, &entry.query_embedding);
            if similarity >= threshold && best.is_none_or(|(_, s)| similarity > s) {
                best = Some((idx, similarity));
            }
        }
        if let Some((idx, _)) = best {
            inner.cache[idx].hit_count += 1;
            return Ok(Some(inner.cache[idx].clone()));
        }
        Ok(None)
    }

    async fn faq_cache_insert(
        &self,
        embedding: &[f32],
        payload: serde_json::Value,
    ) -> Result<(), PersistError> {
        self.inner.lock().unwrap().cache.push(CacheEntry {
            id: Uuid::new_v4(),
            query_embedding: embedding.to_vec(),
            result_payload: payload,
            hit_count: 0,
            created_at: Utc::now(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(turn_index: i64) -> TranscriptRow {
        TranscriptRow {
            turn_index,
            speaker_type: "customer".into(),
            speaker_name: "kim".into(),
            text: "요금제 변경하고 싶어요".into(),
            timestamp: Utc::now(),
            confidence: 0.9,
            is_final: true,
            source: "stt".into(),
        }
    }

    #[test]
    fn cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn transcript_append_is_idempotent() {
        let store = MemoryPersistence::new();
        let session_id = store.session_begin("room-a").await.unwrap();

        store.transcript_append(session_id, row(0)).await.unwrap();
        store.transcript_append(session_id, row(0)).await.unwrap();
        store.transcript_append(session_id, row(1)).await.unwrap();

        assert_eq!(store.transcript_count(session_id), 2);
    }

    #[tokio::test]
    async fn session_end_is_idempotent() {
        let store = MemoryPersistence::new();
        let session_id = store.session_begin("room-a").await.unwrap();

        assert!(store.session_end(session_id, "summary", "call").await.unwrap());
        assert!(!store.session_end(session_id, "summary", "call").await.unwrap());
    }

    #[tokio::test]
    async fn faq_cache_hit_increments_hit_count() {
        let store = MemoryPersistence::new();
        let embedding = vec![0.6, 0.8, 0.0];
        store
            .faq_cache_insert(&embedding, serde_json::json!({"faqs": ["a"]}))
            .await
            .unwrap();

        let miss = store
            .faq_cache_lookup(&[0.0, 0.0, 1.0], 0.85)
            .await
            .unwrap();
        assert!(miss.is_none());

        let hit = store
            .faq_cache_lookup(&embedding, 0.85)
            .await
            .unwrap()
            .expect("exact embedding should hit");
        assert_eq!(hit.hit_count, 1);
    }
}
