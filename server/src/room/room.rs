//! Room
//!
//! A named group of peer sessions sharing one consultation: membership,
//! the append-only transcript, and event fan-out. The room is the only
//! writer of its transcript; indices are dense and never reused.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::error::RoomError;
use super::peer::PeerSession;
use crate::agent::RoomAgentHandle;
use crate::signal::messages::{Envelope, PeerSummary};

/// Transcript source recorded for STT-derived turns.
pub const TRANSCRIPT_SOURCE_STT: &str = "stt";

/// Room lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomStatus {
    /// Accepting joins and audio.
    Active,
    /// Explicitly ended; joins are rejected.
    Ended,
}

/// One committed utterance. Appended only for final STT results, never
/// mutated, never reordered.
#[derive(Debug, Clone)]
pub struct TranscriptTurn {
    /// Dense, strictly increasing index within the room.
    pub turn_index: i64,
    /// Speaking peer.
    pub peer_id: Uuid,
    /// Speaker nickname.
    pub nickname: String,
    /// Speaker role.
    pub speaker_role: crate::signal::messages::Role,
    /// Recognized text.
    pub text: String,
    /// Commit time.
    pub timestamp: DateTime<Utc>,
    /// Always true for appended turns.
    pub is_final: bool,
    /// STT confidence.
    pub confidence: f32,
    /// Producing pipeline.
    pub source: String,
}

/// A voice room and its conversation state.
pub struct Room {
    /// Caller-supplied case-sensitive name.
    pub name: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Durable consultation session id.
    pub session_id: Uuid,

    status: RwLock<RoomStatus>,
    peers: RwLock<HashMap<Uuid, Arc<PeerSession>>>,
    transcript: RwLock<Vec<TranscriptTurn>>,
    agent: std::sync::OnceLock<RoomAgentHandle>,
}

impl Room {
    /// Create an empty active room.
    #[must_use]
    pub fn new(name: String, session_id: Uuid) -> Arc<Self> {
        Arc::new(Self {
            name,
            created_at: Utc::now(),
            session_id,
            status: RwLock::new(RoomStatus::Active),
            peers: RwLock::new(HashMap::new()),
            transcript: RwLock::new(Vec::new()),
            agent: std::sync::OnceLock::new(),
        })
    }

    /// Attach the analysis agent. Called exactly once at creation.
    pub fn set_agent(&self, agent: RoomAgentHandle) {
        let _ = self.agent.set(agent);
    }

    /// The room's analysis agent.
    pub fn agent(&self) -> &RoomAgentHandle {
        self.agent.get().expect("agent attached at room creation")
    }

    /// Current status.
    pub async fn status(&self) -> RoomStatus {
        *self.status.read().await
    }

    /// Promote to ended; no further joins are accepted.
    pub async fn end(&self) {
        *self.status.write().await = RoomStatus::Ended;
    }

    /// Add a peer.
    pub async fn add_peer(&self, peer: Arc<PeerSession>) -> Result<(), RoomError> {
        let mut peers = self.peers.write().await;
        if peers.contains_key(&peer.peer_id) {
            return Err(RoomError::DuplicateJoin);
        }
        peers.insert(peer.peer_id, peer);
        Ok(())
    }

    /// Remove a peer. Membership update and session teardown are atomic
    /// from the caller's perspective: the peer is gone from the roster
    /// before this returns.
    pub async fn remove_peer(&self, peer_id: Uuid) -> Option<Arc<PeerSession>> {
        self.peers.write().await.remove(&peer_id)
    }

    /// Get a peer by id.
    pub async fn get_peer(&self, peer_id: Uuid) -> Option<Arc<PeerSession>> {
        self.peers.read().await.get(&peer_id).cloned()
    }

    /// All peers except one.
    pub async fn other_peers(&self, exclude: Uuid) -> Vec<Arc<PeerSession>> {
        self.peers
            .read()
            .await
            .iter()
            .filter(|(id, _)| **id != exclude)
            .map(|(_, peer)| Arc::clone(peer))
            .collect()
    }

    /// All peers.
    pub async fn all_peers(&self) -> Vec<Arc<PeerSession>> {
        self.peers.read().await.values().cloned().collect()
    }

    /// Participant count.
    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Whether the room is empty.
    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    /// Roster summaries, excluding one peer.
    pub async fn roster(&self, exclude: Uuid) -> Vec<PeerSummary> {
        self.peers
            .read()
            .await
            .values()
            .filter(|peer| peer.peer_id != exclude)
            .map(|peer| PeerSummary {
                peer_id: peer.peer_id,
                nickname: peer.nickname.clone(),
                role: peer.role,
            })
            .collect()
    }

    /// Send an envelope to every member except `exclude`.
    ///
    /// Handles are cloned before sending so the roster lock is never held
    /// during fan-out.
    pub async fn broadcast(&self, envelope: &Envelope, exclude: Option<Uuid>) {
        let handles: Vec<crate::signal::ClientHandle> = {
            let peers = self.peers.read().await;
            peers
                .values()
                .filter(|peer| Some(peer.peer_id) != exclude)
                .map(|peer| peer.signal.clone())
                .collect()
        };
        for handle in handles {
            handle.send_envelope(envelope.clone());
        }
    }

    /// Append one final turn, assigning the next dense index.
    pub async fn append_turn(
        &self,
        peer_id: Uuid,
        nickname: &str,
        speaker_role: crate::signal::messages::Role,
        text: String,
        confidence: f32,
    ) -> TranscriptTurn {
        let mut transcript = self.transcript.write().await;
        let turn = TranscriptTurn {
            turn_index: transcript.len() as i64,
            peer_id,
            nickname: nickname.to_string(),
            speaker_role,
            text,
            timestamp: Utc::now(),
            is_final: true,
            confidence,
            source: TRANSCRIPT_SOURCE_STT.to_string(),
        };
        transcript.push(turn.clone());
        turn
    }

    /// Immutable snapshot of the transcript for one pipeline tick.
    pub async fn transcript_snapshot(&self) -> Arc<Vec<TranscriptTurn>> {
        Arc::new(self.transcript.read().await.clone())
    }

    /// Number of committed turns.
    pub async fn transcript_len(&self) -> usize {
        self.transcript.read().await.len()
    }

    /// Whether every member's transport is established.
    pub async fn all_connected(&self) -> bool {
        self.peers.read().await.values().all(|peer| peer.is_connected())
    }

    /// Emit deferred renegotiation requests once every current peer is
    /// connected. Renegotiating while any transport is still establishing
    /// closes it prematurely.
    pub async fn flush_deferred_renegotiations(&self) {
        if !self.all_connected().await {
            return;
        }
        let peers = self.all_peers().await;
        for peer in peers {
            if peer.flush_renegotiation() {
                debug!(peer_id = %peer.peer_id, room = %self.name, "Deferred renegotiation flushed");
            }
        }
    }
}
