//! Shared fixtures for agent tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use super::cache::SemanticCache;
use super::graph::NodeDeps;
use super::room_agent::AgentDeps;
use crate::llm::{LlmClient, LlmError};
use crate::persistence::{MemoryPersistence, Persistence};
use crate::room::{Room, TranscriptTurn};
use crate::signal::messages::Role;
use crate::vector::{Embedder, ScoredDocument, VectorError, VectorStore};

/// LLM returning canned JSON keyed on the system prompt's task.
pub(crate) struct CannedLlm;

#[async_trait]
impl LlmClient for CannedLlm {
    async fn complete(&self, system: &str, _user: &str) -> Result<String, LlmError> {
        let payload = if system.contains("분류기") {
            r#"{"intent_label": "요금제변경", "confidence": 0.91, "explanation": "plan change"}"#
        } else if system.contains("감정") {
            r#"{"sentiment_label": "neutral", "sentiment_score": 0.55, "explanation": "calm"}"#
        } else if system.contains("리스크") {
            r#"{"risk_flags": ["churn"], "explanation": "mentions leaving"}"#
        } else if system.contains("초안") {
            r#"{"short_reply": "네, 도와드리겠습니다.", "keywords": ["요금제"]}"#
        } else if system.contains("가이드") {
            r#"{"guide": ["1단계 의도 확인", "2단계 정책 안내", "3단계 마무리"]}"#
        } else {
            r#"{"summary": "요금제 상담", "customer_issue": "요금제 변경 문의", "agent_action": "안내"}"#
        };
        Ok(payload.to_string())
    }

    async fn is_available(&self) -> bool {
        true
    }

    fn model_version(&self) -> &str {
        "canned"
    }
}

/// Vector store recording which collections were searched.
pub(crate) struct RecordingVector {
    pub searched: Mutex<Vec<String>>,
}

impl RecordingVector {
    pub(crate) fn new() -> Self {
        Self {
            searched: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl VectorStore for RecordingVector {
    async fn search(
        &self,
        collection: &str,
        _query: &str,
        _k: usize,
    ) -> Result<Vec<ScoredDocument>, VectorError> {
        self.searched.lock().unwrap().push(collection.to_string());
        Ok(vec![ScoredDocument {
            title: format!("{collection} 문서"),
            content: "정책 본문".into(),
            metadata: serde_json::json!({}),
            score: 0.8,
        }])
    }
}

/// Deterministic toy embedder: character histogram.
pub(crate) struct ToyEmbedder;

#[async_trait]
impl Embedder for ToyEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, VectorError> {
        let mut embedding = vec![0.0f32; 16];
        for ch in text.chars() {
            embedding[(ch as usize) % 16] += 1.0;
        }
        Ok(embedding)
    }
}

/// Synthetic transcript turn.
pub(crate) fn turn(index: i64, role: Role, text: &str) -> TranscriptTurn {
    TranscriptTurn {
        turn_index: index,
        peer_id: Uuid::new_v4(),
        nickname: if role == Role::Customer { "고객" } else { "상담사" }.into(),
        speaker_role: role,
        text: text.into(),
        timestamp: Utc::now(),
        is_final: true,
        confidence: 0.92,
        source: "stt".into(),
    }
}

/// Append one synthetic turn through the room's own appender.
pub(crate) async fn turn_into_room(room: &Room, role: Role, text: &str) -> TranscriptTurn {
    room.append_turn(
        Uuid::new_v4(),
        if role == Role::Customer { "고객" } else { "상담사" },
        role,
        text.to_string(),
        0.92,
    )
    .await
}

/// Node-level deps over canned collaborators.
pub(crate) fn test_node_deps() -> (NodeDeps, Arc<RecordingVector>) {
    let vector = Arc::new(RecordingVector::new());
    let persistence = Arc::new(MemoryPersistence::new());
    let cache = Arc::new(SemanticCache::new(
        persistence,
        Arc::new(ToyEmbedder),
        0.85,
    ));
    let deps = NodeDeps {
        llm: Arc::new(CannedLlm),
        vector: Arc::clone(&vector) as Arc<dyn VectorStore>,
        cache,
        llm_available: true,
        deadline: Duration::from_secs(10),
        model_version: "canned".into(),
    };
    (deps, vector)
}

/// Agent-level deps over canned collaborators and a shared memory store.
pub(crate) fn test_agent_deps(persistence: Arc<dyn Persistence>) -> AgentDeps {
    AgentDeps {
        persistence,
        llm: Arc::new(CannedLlm),
        vector: Arc::new(RecordingVector::new()),
        embedder: Arc::new(ToyEmbedder),
        cache_threshold: 0.85,
        node_deadline: Duration::from_secs(10),
        end_session_deadline: Duration::from_secs(30),
        llm_available: true,
        writes: TaskTracker::new(),
    }
}
