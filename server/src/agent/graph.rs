//! Analysis Graph
//!
//! The fixed dependency graph of analysis nodes and its tick executor.
//! Six root nodes start together at tick entry; policy retrieval starts
//! once intent lands. Every node runs over the same transcript snapshot,
//! enforces its own deadline, and reports its result the moment it
//! finishes.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::cache::SemanticCache;
use super::customer::CustomerContext;
use super::nodes;
use super::state::AgentState;
use crate::llm::LlmClient;
use crate::room::TranscriptTurn;
use crate::vector::VectorStore;

/// The analysis node kinds. The graph shape is compile-time: every kind is
/// a root except policy retrieval, which depends on intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Summarize,
    Intent,
    Sentiment,
    DraftReply,
    Risk,
    FaqSearch,
    RagPolicy,
}

impl NodeKind {
    /// All nodes, roots first.
    pub const ALL: [Self; 7] = [
        Self::Summarize,
        Self::Intent,
        Self::Sentiment,
        Self::DraftReply,
        Self::Risk,
        Self::FaqSearch,
        Self::RagPolicy,
    ];

    /// Nodes that start at tick entry.
    pub const ROOTS: [Self; 6] = [
        Self::Summarize,
        Self::Intent,
        Self::Sentiment,
        Self::DraftReply,
        Self::Risk,
        Self::FaqSearch,
    ];

    /// Wire/storage name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Summarize => "summarize",
            Self::Intent => "intent",
            Self::Sentiment => "sentiment",
            Self::DraftReply => "draft_reply",
            Self::Risk => "risk",
            Self::FaqSearch => "faq_search",
            Self::RagPolicy => "rag_policy",
        }
    }

    /// Upstream dependencies.
    #[must_use]
    pub const fn dependencies(self) -> &'static [Self] {
        match self {
            Self::RagPolicy => &[Self::Intent],
            _ => &[],
        }
    }
}

/// Shared collaborators handed to every node.
#[derive(Clone)]
pub struct NodeDeps {
    pub llm: Arc<dyn LlmClient>,
    pub vector: Arc<dyn VectorStore>,
    pub cache: Arc<SemanticCache>,
    /// Startup probe outcome; false degrades LLM nodes to skipped results.
    pub llm_available: bool,
    /// Per-node deadline.
    pub deadline: Duration,
    /// Recorded with persisted results.
    pub model_version: String,
}

/// Per-node view of one tick.
#[derive(Clone)]
pub struct NodeContext {
    /// Transcript snapshot shared by every node in the tick.
    pub snapshot: Arc<Vec<TranscriptTurn>>,
    /// This node's cursor at tick entry; only turns at or past it are new.
    pub cursor: usize,
    /// This node's previous result, for incremental context.
    pub previous: Option<serde_json::Value>,
    /// Customer snapshot for prompt enrichment.
    pub customer: Option<CustomerContext>,
    /// Intent result, present only for policy retrieval.
    pub intent: Option<serde_json::Value>,
}

/// One node's finished result within a tick.
#[derive(Debug, Clone)]
pub struct NodeOutcome {
    pub kind: NodeKind,
    pub payload: serde_json::Value,
    pub elapsed_ms: i64,
    /// Deadline expiry or missing collaborator/input.
    pub skipped: bool,
}

/// What a tick did.
#[derive(Debug, Default)]
pub struct TickOutcome {
    /// Nodes that completed (including skipped results).
    pub completed: Vec<NodeKind>,
    /// True when the tick was cancelled; unfinished nodes emitted nothing.
    pub cancelled: bool,
}

async fn run_node(kind: NodeKind, ctx: NodeContext, deps: NodeDeps) -> NodeOutcome {
    let started = tokio::time::Instant::now();
    let payload = match tokio::time::timeout(deps.deadline, nodes::execute(kind, &ctx, &deps)).await
    {
        Ok(payload) => payload,
        Err(_) => {
            warn!(node = kind.as_str(), "Node deadline exceeded, recording skipped result");
            nodes::skipped_payload(kind)
        }
    };
    let skipped = payload
        .get("skipped")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);
    NodeOutcome {
        kind,
        payload,
        elapsed_ms: started.elapsed().as_millis() as i64,
        skipped,
    }
}

/// Run one tick over a snapshot.
///
/// `on_result` fires as each node finishes; results are never held until
/// the whole tick completes. Cancellation aborts unfinished nodes at their
/// next await point; they emit nothing and their cursors stay put.
pub async fn run_tick(
    snapshot: Arc<Vec<TranscriptTurn>>,
    state: &AgentState,
    customer: Option<CustomerContext>,
    deps: &NodeDeps,
    cancel: &CancellationToken,
    mut on_result: impl FnMut(&NodeOutcome),
) -> TickOutcome {
    let mut outcome = TickOutcome::default();
    let mut join_set: JoinSet<NodeOutcome> = JoinSet::new();

    let ctx_for = |kind: NodeKind| NodeContext {
        snapshot: Arc::clone(&snapshot),
        cursor: state.cursor(kind),
        previous: state.latest(kind).cloned(),
        customer: customer.clone(),
        intent: None,
    };

    for kind in NodeKind::ROOTS {
        join_set.spawn(run_node(kind, ctx_for(kind), deps.clone()));
    }

    let mut rag_spawned = false;
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!("Tick cancelled, aborting unfinished nodes");
                join_set.abort_all();
                while join_set.join_next().await.is_some() {}
                outcome.cancelled = true;
                break;
            }
            joined = join_set.join_next() => match joined {
                None => break,
                Some(Ok(node_outcome)) => {
                    if node_outcome.kind == NodeKind::Intent && !rag_spawned {
                        rag_spawned = true;
                        let mut ctx = ctx_for(NodeKind::RagPolicy);
                        ctx.intent = Some(node_outcome.payload.clone());
                        join_set.spawn(run_node(NodeKind::RagPolicy, ctx, deps.clone()));
                    }
                    outcome.completed.push(node_outcome.kind);
                    on_result(&node_outcome);
                }
                Some(Err(e)) => {
                    if !e.is_cancelled() {
                        warn!(error = %e, "Node task failed");
                    }
                }
            }
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testutil::{test_node_deps, turn};
    use crate::llm::LlmError;
    use crate::signal::messages::Role;
    use async_trait::async_trait;

    #[tokio::test]
    async fn tick_runs_all_seven_nodes_and_rag_follows_intent() {
        let (deps, vector) = test_node_deps();
        let snapshot = Arc::new(vec![turn(0, Role::Customer, "요금제 변경하고 싶어요")]);
        let state = AgentState::new();
        let cancel = CancellationToken::new();

        let mut seen = Vec::new();
        let outcome = run_tick(snapshot, &state, None, &deps, &cancel, |node| {
            seen.push(node.kind);
        })
        .await;

        assert!(!outcome.cancelled);
        assert_eq!(outcome.completed.len(), 7);
        for kind in NodeKind::ALL {
            assert!(seen.contains(&kind), "{kind:?} missing");
        }
        // Policy retrieval never precedes intent.
        let intent_pos = seen.iter().position(|k| *k == NodeKind::Intent).unwrap();
        let rag_pos = seen.iter().position(|k| *k == NodeKind::RagPolicy).unwrap();
        assert!(intent_pos < rag_pos);
        // Plan-change intent searches the plan collection.
        assert!(vector
            .searched
            .lock()
            .unwrap()
            .contains(&"mobile_plans".to_string()));
    }

    #[tokio::test]
    async fn pre_cancelled_tick_emits_nothing() {
        let (deps, _vector) = test_node_deps();
        let snapshot = Arc::new(vec![turn(0, Role::Customer, "해지하고 싶어요")]);
        let state = AgentState::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut emitted = 0;
        let outcome = run_tick(snapshot, &state, None, &deps, &cancel, |_| emitted += 1).await;

        assert!(outcome.cancelled);
        assert_eq!(emitted, 0);
    }

    struct StalledLlm;

    #[async_trait]
    impl LlmClient for StalledLlm {
        async fn complete(&self, _system: &str, _user: &str) -> Result<String, LlmError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unreachable!()
        }

        async fn is_available(&self) -> bool {
            true
        }

        fn model_version(&self) -> &str {
            "stalled"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expiry_records_skipped_result() {
        let (mut deps, _vector) = test_node_deps();
        deps.llm = Arc::new(StalledLlm);
        deps.deadline = Duration::from_millis(50);

        let snapshot = Arc::new(vec![turn(0, Role::Customer, "요금제 문의")]);
        let state = AgentState::new();
        let cancel = CancellationToken::new();

        let mut skipped_summarize = false;
        let outcome = run_tick(snapshot, &state, None, &deps, &cancel, |node| {
            if node.kind == NodeKind::Summarize {
                skipped_summarize = node.skipped;
            }
        })
        .await;

        assert!(!outcome.cancelled);
        assert_eq!(outcome.completed.len(), 7);
        assert!(skipped_summarize, "stalled summarize must record a skipped result");
    }

    #[tokio::test]
    async fn faq_second_identical_query_hits_cache() {
        let (deps, vector) = test_node_deps();
        let snapshot = Arc::new(vec![turn(0, Role::Customer, "해지 위약금이 얼마인가요?")]);
        let state = AgentState::new();
        let cancel = CancellationToken::new();

        let mut hits = Vec::new();
        for _ in 0..2 {
            run_tick(
                Arc::clone(&snapshot),
                &state,
                None,
                &deps,
                &cancel,
                |node| {
                    if node.kind == NodeKind::FaqSearch {
                        hits.push(node.payload["cache_hit"].as_bool().unwrap_or(false));
                    }
                },
            )
            .await;
        }

        assert_eq!(hits, vec![false, true]);
        // The vector store served the FAQ query at most once.
        let faq_searches = vector
            .searched
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.as_str() == "faq")
            .count();
        assert_eq!(faq_searches, 1);
    }
}
