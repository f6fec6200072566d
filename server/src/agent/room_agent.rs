//! Room Agent
//!
//! Per-room orchestrator of the analysis pipeline. Ticks are serialised on
//! one worker task: at most one tick is in flight, a transcript arriving
//! mid-tick sets a dirty flag, and the successor tick starts the moment the
//! running one completes. Direct tasks (consultation, end-session) queue on
//! the same loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::cache::SemanticCache;
use super::customer::CustomerContext;
use super::graph::{run_tick, NodeDeps, NodeKind, NodeOutcome};
use super::nodes;
use super::state::AgentState;
use crate::llm::LlmClient;
use crate::persistence::{AgentResultRow, Persistence};
use crate::room::Room;
use crate::signal::messages::{Envelope, ServerEvent, TaskStatus};
use crate::signal::ClientHandle;
use crate::vector::{Embedder, VectorStore};

/// Collaborators and policy handed to each room's agent.
#[derive(Clone)]
pub struct AgentDeps {
    pub persistence: Arc<dyn Persistence>,
    pub llm: Arc<dyn LlmClient>,
    pub vector: Arc<dyn VectorStore>,
    pub embedder: Arc<dyn Embedder>,
    pub cache_threshold: f32,
    pub node_deadline: Duration,
    pub end_session_deadline: Duration,
    pub llm_available: bool,
    /// Tracks spawned write-through tasks so shutdown can drain them.
    pub writes: TaskTracker,
}

enum AgentCommand {
    Consultation {
        requester: ClientHandle,
        options: Option<Value>,
    },
    EndSession {
        requester: ClientHandle,
        done: oneshot::Sender<()>,
    },
    Shutdown {
        drain: bool,
        done: oneshot::Sender<()>,
    },
}

/// Handle to a room's agent worker. The worker task is strongly referenced
/// here for its whole lifetime.
pub struct RoomAgentHandle {
    notify: Arc<Notify>,
    dirty: Arc<AtomicBool>,
    cmd_tx: mpsc::Sender<AgentCommand>,
    cancel: CancellationToken,
    customer: Arc<std::sync::RwLock<Option<CustomerContext>>>,
    llm_available: bool,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RoomAgentHandle {
    /// Start the worker for a room.
    pub fn spawn(room: Weak<Room>, session_id: Uuid, deps: AgentDeps) -> Self {
        let notify = Arc::new(Notify::new());
        let dirty = Arc::new(AtomicBool::new(false));
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let customer = Arc::new(std::sync::RwLock::new(None));

        let cache = Arc::new(SemanticCache::new(
            Arc::clone(&deps.persistence),
            Arc::clone(&deps.embedder),
            deps.cache_threshold,
        ));
        let node_deps = NodeDeps {
            llm: Arc::clone(&deps.llm),
            vector: Arc::clone(&deps.vector),
            cache,
            llm_available: deps.llm_available,
            deadline: deps.node_deadline,
            model_version: deps.llm.model_version().to_string(),
        };

        let worker = AgentWorker {
            room,
            session_id,
            state: AgentState::new(),
            node_deps,
            persistence: Arc::clone(&deps.persistence),
            end_session_deadline: deps.end_session_deadline,
            writes: deps.writes.clone(),
            customer: Arc::clone(&customer),
            cancel: cancel.clone(),
            notify: Arc::clone(&notify),
            dirty: Arc::clone(&dirty),
        };
        let task = tokio::spawn(worker.run(cmd_rx));

        Self {
            notify,
            dirty,
            cmd_tx,
            cancel,
            customer,
            llm_available: deps.llm_available,
            task: std::sync::Mutex::new(Some(task)),
        }
    }

    /// Schedule a tick. Called on every final transcript append; coalesces
    /// while a tick is in flight.
    pub fn notify_tick(&self) {
        self.dirty.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    /// Record the resolved customer context for prompts and join payloads.
    pub fn set_customer(&self, context: Option<CustomerContext>) {
        *self.customer.write().unwrap() = context;
    }

    /// Latest resolved customer context.
    pub fn customer_context(&self) -> Option<CustomerContext> {
        self.customer.read().unwrap().clone()
    }

    /// Startup LLM probe outcome, reported as `agent_ready`.
    #[must_use]
    pub const fn llm_available(&self) -> bool {
        self.llm_available
    }

    /// Queue a one-shot consultation guide for a requester. Serialises
    /// behind any in-flight tick.
    pub async fn consultation(&self, requester: ClientHandle, options: Option<Value>) {
        if self
            .cmd_tx
            .send(AgentCommand::Consultation { requester: requester.clone(), options })
            .await
            .is_err()
        {
            requester.send(ServerEvent::AgentStatus {
                task: "consultation".into(),
                status: TaskStatus::Error,
                message: Some("agent unavailable".into()),
            });
        }
    }

    /// Queue the end-of-session flush. The worker answers the requester
    /// directly, within the configured deadline; the returned receiver
    /// resolves once the reply has been sent, so callers can sequence room
    /// destruction after the flush.
    pub async fn end_session(&self, requester: ClientHandle) -> oneshot::Receiver<()> {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(AgentCommand::EndSession {
                requester: requester.clone(),
                done: done_tx,
            })
            .await
            .is_err()
        {
            requester.send(ServerEvent::SessionEnded {
                success: false,
                session_id: None,
                message: Some("agent unavailable".into()),
            });
        }
        done_rx
    }

    /// Stop the worker. With `drain`, the current tick and one dirty
    /// successor finish first; without it, the current tick is cancelled
    /// cooperatively.
    pub async fn shutdown(&self, drain: bool) {
        if drain {
            let (done_tx, done_rx) = oneshot::channel();
            if self
                .cmd_tx
                .send(AgentCommand::Shutdown { drain: true, done: done_tx })
                .await
                .is_ok()
            {
                let _ = tokio::time::timeout(Duration::from_secs(30), done_rx).await;
            }
        }
        self.cancel.cancel();
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }
}

struct AgentWorker {
    room: Weak<Room>,
    session_id: Uuid,
    state: AgentState,
    node_deps: NodeDeps,
    persistence: Arc<dyn Persistence>,
    end_session_deadline: Duration,
    writes: TaskTracker,
    customer: Arc<std::sync::RwLock<Option<CustomerContext>>>,
    cancel: CancellationToken,
    notify: Arc<Notify>,
    dirty: Arc<AtomicBool>,
}

impl AgentWorker {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<AgentCommand>) {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = self.notify.notified() => {
                    // Successor ticks start immediately while appends kept
                    // arriving mid-tick.
                    while self.dirty.swap(false, Ordering::AcqRel) {
                        self.tick(false).await;
                        if self.cancel.is_cancelled() {
                            return;
                        }
                    }
                }
                cmd = cmd_rx.recv() => match cmd {
                    Some(AgentCommand::Consultation { requester, options }) => {
                        self.consultation(requester, options).await;
                    }
                    Some(AgentCommand::EndSession { requester, done }) => {
                        self.end_session(requester).await;
                        let _ = done.send(());
                    }
                    Some(AgentCommand::Shutdown { drain, done }) => {
                        if drain && self.dirty.swap(false, Ordering::AcqRel) {
                            self.tick(false).await;
                        }
                        let _ = done.send(());
                        return;
                    }
                    None => break,
                }
            }
        }
    }

    /// Run one tick over the current snapshot. `force` runs every node even
    /// when no cursor has pending input (end-of-session flush).
    async fn tick(&mut self, force: bool) {
        let Some(room) = self.room.upgrade() else {
            self.cancel.cancel();
            return;
        };

        let snapshot = room.transcript_snapshot().await;
        if snapshot.is_empty() {
            return;
        }
        if !force && !self.state.has_pending_input(snapshot.len()) {
            return;
        }

        self.state.pipeline_tick_id += 1;
        let tick_id = self.state.pipeline_tick_id;
        let turn_id = format!("turn_{}", snapshot.len() - 1);
        let customer = self.customer.read().unwrap().clone();

        debug!(
            room = %room.name,
            tick_id,
            turn_id = %turn_id,
            turns = snapshot.len(),
            "Pipeline tick starting"
        );

        // One ordered forwarder per tick: every client sees node results in
        // the same order they were posted, while persistence writes fan out
        // behind it.
        let (emit_tx, mut emit_rx) = mpsc::unbounded_channel::<NodeOutcome>();
        let fanout = {
            let room = Arc::clone(&room);
            let persistence = Arc::clone(&self.persistence);
            let writes = self.writes.clone();
            let session_id = self.session_id;
            let model_version = self.node_deps.model_version.clone();
            let turn_id = turn_id.clone();
            tokio::spawn(async move {
                while let Some(node) = emit_rx.recv().await {
                    let envelope = Envelope::agent_update(
                        node.kind.as_str(),
                        &turn_id,
                        node.payload.clone(),
                    );
                    room.broadcast(&envelope, None).await;

                    let row = AgentResultRow {
                        turn_id: turn_id.clone(),
                        result_type: node.kind.as_str().to_string(),
                        result_data: node.payload,
                        processing_time_ms: node.elapsed_ms,
                        model_version: model_version.clone(),
                    };
                    let persistence = Arc::clone(&persistence);
                    writes.spawn(async move {
                        if let Err(e) = persistence.agent_result_write(session_id, row).await {
                            warn!(error = %e, "Dropping analysis result write");
                        }
                    });
                }
            })
        };

        let mut finished: Vec<NodeOutcome> = Vec::with_capacity(NodeKind::ALL.len());
        let outcome = run_tick(
            Arc::clone(&snapshot),
            &self.state,
            customer,
            &self.node_deps,
            &self.cancel,
            |node| {
                // Results stream out the moment the node lands; they are
                // never held for the rest of the tick.
                let _ = emit_tx.send(node.clone());
                finished.push(node.clone());
            },
        )
        .await;
        drop(emit_tx);
        let _ = fanout.await;

        // Completed nodes advance to the snapshot they consumed; cancelled
        // nodes leave their cursors untouched.
        for node in finished {
            self.state.record(node.kind, node.payload);
            self.state.advance(node.kind, snapshot.len());
        }
        if outcome.cancelled {
            info!(room = %room.name, tick_id, "Pipeline tick cancelled");
        }
    }

    async fn consultation(&mut self, requester: ClientHandle, options: Option<Value>) {
        let Some(room) = self.room.upgrade() else {
            return;
        };
        requester.send(ServerEvent::AgentStatus {
            task: "consultation".into(),
            status: TaskStatus::Processing,
            message: None,
        });

        let snapshot = room.transcript_snapshot().await;
        let customer = self.customer.read().unwrap().clone();
        let (guide, recommendations, citations) = nodes::consultation_guide(
            &snapshot,
            customer.as_ref(),
            options.as_ref(),
            &self.node_deps,
        )
        .await;

        requester.send(ServerEvent::AgentConsultation {
            guide,
            recommendations,
            citations,
            generated_at: Utc::now(),
        });
        requester.send(ServerEvent::AgentStatus {
            task: "consultation".into(),
            status: TaskStatus::Done,
            message: None,
        });
    }

    async fn end_session(&mut self, requester: ClientHandle) {
        let deadline = self.end_session_deadline;
        let session_id = self.session_id;

        let flush = tokio::time::timeout(deadline, async {
            // Final tick consumes anything pending and refreshes every node.
            self.tick(true).await;

            let final_summary = self
                .state
                .latest(NodeKind::Summarize)
                .and_then(|payload| payload.get("summary"))
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();

            self.persistence
                .session_end(session_id, &final_summary, "voice")
                .await
        })
        .await;

        match flush {
            Ok(Ok(_)) => {
                info!(session_id = %session_id, "Session flushed and ended");
                requester.send(ServerEvent::SessionEnded {
                    success: true,
                    session_id: Some(session_id),
                    message: None,
                });
            }
            Ok(Err(e)) => {
                warn!(session_id = %session_id, error = %e, "Session end write failed");
                requester.send(ServerEvent::SessionEnded {
                    success: false,
                    session_id: Some(session_id),
                    message: Some(e.to_string()),
                });
            }
            Err(_) => {
                warn!(session_id = %session_id, "Session end flush timed out");
                requester.send(ServerEvent::SessionEnded {
                    success: false,
                    session_id: Some(session_id),
                    message: Some("timeout".into()),
                });
            }
        }
    }
}
