//! Room Manager
//!
//! Process-wide registry of rooms and peers: membership, signaling routing,
//! SFU fan-out wiring, per-peer transcription and analysis agent lifecycle.
//! Membership mutations are serialised per room; routing of media and ICE
//! is lock-free once the peer session is resolved.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecParameters, RTPCodecType};

use super::error::RoomError;
use super::peer::{opus_capability, PeerSession, PeerState};
use super::relay::AudioRelayTrack;
use super::room::Room;
use crate::agent::{AgentDeps, CustomerDirectory, RoomAgentHandle};
use crate::config::{Config, IceTransportPolicy};
use crate::llm::LlmClient;
use crate::persistence::{Persistence, TranscriptRow};
use crate::rtc::turn_rest_credentials;
use crate::signal::messages::{
    CandidateInit, ClientEvent, Envelope, Role, ServerEvent,
};
use crate::signal::ClientHandle;
use crate::stt::{SttProvider, SttSessionConfig, SttStream, SttStreamEvent, DOMAIN_PHRASES};
use crate::vector::{Embedder, VectorStore};

/// How long a join waits for the customer directory before proceeding
/// without enrichment.
const CUSTOMER_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

/// Consultation records loaded for a resolved customer.
const CONSULTATION_HISTORY_LIMIT: usize = 5;

/// External collaborators shared by every room.
#[derive(Clone)]
pub struct Collaborators {
    pub persistence: Arc<dyn Persistence>,
    pub llm: Arc<dyn LlmClient>,
    pub vector: Arc<dyn VectorStore>,
    pub embedder: Arc<dyn Embedder>,
    pub customers: Arc<dyn CustomerDirectory>,
    pub stt: Option<Arc<dyn SttProvider>>,
}

/// Process-wide room registry and signaling router.
pub struct RoomManager {
    config: Arc<Config>,
    api: API,
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    /// Connected signaling clients, joined or not.
    clients: DashMap<Uuid, ClientHandle>,
    /// Peer membership index; a peer belongs to at most one room.
    peer_rooms: DashMap<Uuid, String>,
    collaborators: Collaborators,
    llm_available: AtomicBool,
    /// Write-through tasks drained on shutdown.
    writes: TaskTracker,
}

impl RoomManager {
    /// Build the WebRTC API (Opus only) and an empty registry.
    pub fn new(config: Arc<Config>, collaborators: Collaborators) -> Result<Self, RoomError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: opus_capability(),
                    payload_type: 111,
                    ..Default::default()
                },
                RTPCodecType::Audio,
            )
            .map_err(|e| RoomError::WebRtc(e.to_string()))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| RoomError::WebRtc(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        info!("Room manager initialized");

        Ok(Self {
            config,
            api,
            rooms: RwLock::new(HashMap::new()),
            clients: DashMap::new(),
            peer_rooms: DashMap::new(),
            collaborators,
            llm_available: AtomicBool::new(false),
            writes: TaskTracker::new(),
        })
    }

    /// Probe the LLM once at startup; the outcome feeds `agent_ready`.
    pub async fn probe_llm(&self) {
        let available = self.collaborators.llm.is_available().await;
        self.llm_available.store(available, Ordering::Release);
        info!(llm_available = available, "LLM probe completed");
    }

    /// `RTCConfiguration` honoring the transport policy. Relay-only is the
    /// default: symmetric NAT and tunnelled dev environments break direct
    /// paths.
    #[must_use]
    pub fn rtc_config(&self) -> RTCConfiguration {
        let mut ice_servers = vec![RTCIceServer {
            urls: vec![self.config.stun_server.clone()],
            ..Default::default()
        }];

        if let Some(turn) = &self.config.turn_server {
            let (username, credential) = self.config.turn_secret.as_ref().map_or_else(
                || (String::new(), String::new()),
                |secret| {
                    turn_rest_credentials(secret, self.config.turn_credentials_ttl_seconds)
                },
            );
            ice_servers.push(RTCIceServer {
                urls: vec![turn.clone()],
                username,
                credential,
                ..Default::default()
            });
        }

        RTCConfiguration {
            ice_servers,
            ice_transport_policy: match self.config.ice_transport_policy {
                IceTransportPolicy::All => RTCIceTransportPolicy::All,
                IceTransportPolicy::Relay => RTCIceTransportPolicy::Relay,
            },
            ..Default::default()
        }
    }

    /// Register a freshly connected signaling client.
    pub fn register_client(&self, handle: ClientHandle) {
        self.clients.insert(handle.peer_id, handle);
    }

    /// Tear down everything a disconnecting client owned.
    pub async fn disconnect(&self, peer_id: Uuid) {
        if let Err(e) = self.leave(peer_id).await {
            debug!(peer_id = %peer_id, error = %e, "Disconnect without membership");
        }
        self.clients.remove(&peer_id);
    }

    /// Dispatch one inbound signaling event.
    pub async fn route(self: &Arc<Self>, peer_id: Uuid, event: ClientEvent) {
        let Some(handle) = self.clients.get(&peer_id).map(|entry| entry.value().clone()) else {
            warn!(peer_id = %peer_id, "Event from unregistered client");
            return;
        };

        let result = match event {
            ClientEvent::JoinRoom {
                room_name,
                nickname,
                phone_number,
                agent_code,
            } => {
                self.join(&handle, room_name, nickname, phone_number, agent_code)
                    .await
            }
            ClientEvent::Offer { sdp, kind } => self.handle_offer(peer_id, &handle, sdp, &kind).await,
            ClientEvent::IceCandidate(data) => {
                self.handle_ice_candidate(peer_id, data.into_inner()).await
            }
            ClientEvent::LeaveRoom {} => self.leave(peer_id).await,
            ClientEvent::AgentTask {
                task,
                user_options,
                ..
            } => self.handle_agent_task(peer_id, &handle, &task, user_options).await,
            ClientEvent::EndSession {} => self.handle_end_session(peer_id, &handle).await,
        };

        if let Err(e) = result {
            debug!(peer_id = %peer_id, error = %e, "Signaling event rejected");
            handle.send(ServerEvent::Error {
                message: e.to_string(),
            });
        }
    }

    /// Place a peer into a room, creating the room (and its durable session
    /// and agent) when absent.
    async fn join(
        self: &Arc<Self>,
        handle: &ClientHandle,
        room_name: String,
        nickname: String,
        phone_number: Option<String>,
        agent_code: Option<String>,
    ) -> Result<(), RoomError> {
        let peer_id = handle.peer_id;
        if self.peer_rooms.contains_key(&peer_id) {
            return Err(RoomError::DuplicateJoin);
        }
        let role = if agent_code.is_some() {
            Role::Agent
        } else {
            Role::Customer
        };

        let room = {
            let mut rooms = self.rooms.write().await;
            if let Some(room) = rooms.get(&room_name) {
                if room.status().await == super::room::RoomStatus::Ended {
                    return Err(RoomError::RoomClosed(room_name));
                }
                Arc::clone(room)
            } else {
                if rooms.len() >= self.config.max_concurrent_rooms {
                    return Err(RoomError::RoomLimitReached {
                        max_rooms: self.config.max_concurrent_rooms,
                    });
                }
                let session_id = match self
                    .collaborators
                    .persistence
                    .session_begin(&room_name)
                    .await
                {
                    Ok(session_id) => session_id,
                    Err(e) => {
                        error!(room = %room_name, error = %e, "Session begin failed, using local id");
                        Uuid::new_v4()
                    }
                };
                let room = Room::new(room_name.clone(), session_id);
                room.set_agent(RoomAgentHandle::spawn(
                    Arc::downgrade(&room),
                    session_id,
                    self.agent_deps(),
                ));
                rooms.insert(room_name.clone(), Arc::clone(&room));
                info!(room = %room_name, session_id = %session_id, "Room created");
                room
            }
        };

        // Resolve customer context before join events so counselors see it
        // in the join payloads themselves.
        let mut customer_info = None;
        let mut consultation_history = None;
        if role == Role::Customer {
            if let Some(phone) = &phone_number {
                match tokio::time::timeout(
                    CUSTOMER_LOOKUP_TIMEOUT,
                    self.collaborators
                        .customers
                        .lookup_by_phone(phone, CONSULTATION_HISTORY_LIMIT),
                )
                .await
                {
                    Ok(Ok(Some(context))) => {
                        customer_info = Some(context.profile.clone());
                        consultation_history = Some(context.history.clone());
                        room.agent().set_customer(Some(context));
                    }
                    Ok(Ok(None)) => {}
                    Ok(Err(e)) => warn!(error = %e, "Customer lookup failed"),
                    Err(_) => warn!("Customer lookup timed out"),
                }
            }
        } else if let Some(context) = room.agent().customer_context() {
            customer_info = Some(context.profile);
            consultation_history = Some(context.history);
        }

        let peer = Arc::new(
            PeerSession::new(
                &self.api,
                self.rtc_config(),
                peer_id,
                room_name.clone(),
                nickname.clone(),
                role,
                phone_number,
                handle.clone(),
            )
            .await?,
        );
        self.setup_peer_callbacks(&room, &peer);

        if let Err(e) = room.add_peer(Arc::clone(&peer)).await {
            peer.close("join rejected").await;
            return Err(e);
        }
        self.peer_rooms.insert(peer_id, room_name.clone());

        // Subscribe the newcomer to every upstream already in the room.
        for other in room.other_peers(peer_id).await {
            if let Some(relay) = other.relay() {
                if let Err(e) = peer.add_downstream(other.peer_id, relay.subscribe()).await {
                    warn!(
                        source = %other.peer_id,
                        subscriber = %peer_id,
                        error = %e,
                        "Failed to attach existing upstream"
                    );
                }
            }
        }

        let peer_count = room.peer_count().await;
        handle.send(ServerEvent::RoomJoined {
            room_name: room.name.clone(),
            peer_count,
            other_peers: room.roster(peer_id).await,
            customer_info: customer_info.clone(),
            consultation_history: consultation_history.clone(),
        });
        handle.send(ServerEvent::AgentReady {
            llm_available: room.agent().llm_available(),
        });
        room.broadcast(
            &Envelope::from(ServerEvent::UserJoined {
                peer_id,
                nickname: nickname.clone(),
                peer_count,
                customer_info,
                consultation_history,
            }),
            Some(peer_id),
        )
        .await;

        info!(peer_id = %peer_id, room = %room.name, role = role.as_str(), "Peer joined room");
        Ok(())
    }

    /// Remove a peer; an emptied room is destroyed once its agent drains.
    pub async fn leave(&self, peer_id: Uuid) -> Result<(), RoomError> {
        let Some((_, room_name)) = self.peer_rooms.remove(&peer_id) else {
            return Err(RoomError::NotInRoom(peer_id));
        };
        let room = {
            let rooms = self.rooms.read().await;
            rooms
                .get(&room_name)
                .cloned()
                .ok_or_else(|| RoomError::RoomNotFound(room_name.clone()))?
        };

        if let Some(peer) = room.remove_peer(peer_id).await {
            peer.close("leave").await;
            for other in room.all_peers().await {
                other.remove_downstream(peer_id).await;
            }
            room.broadcast(
                &Envelope::from(ServerEvent::UserLeft {
                    peer_id,
                    nickname: peer.nickname.clone(),
                    peer_count: room.peer_count().await,
                }),
                None,
            )
            .await;
            info!(peer_id = %peer_id, room = %room_name, "Peer left room");
        }

        if room.is_empty().await {
            // In-flight analysis drains before the room goes away.
            self.destroy_room(&room_name, true).await;
        }
        Ok(())
    }

    async fn handle_offer(
        &self,
        peer_id: Uuid,
        handle: &ClientHandle,
        sdp: String,
        kind: &str,
    ) -> Result<(), RoomError> {
        if kind != "offer" {
            return Err(RoomError::Signaling(format!("unexpected sdp type {kind}")));
        }
        let peer = self.resolve_peer(peer_id).await?;
        let answer_sdp = peer.handle_offer(sdp).await?;
        handle.send(ServerEvent::Answer {
            sdp: answer_sdp,
            kind: "answer".to_string(),
        });
        Ok(())
    }

    async fn handle_ice_candidate(
        &self,
        peer_id: Uuid,
        candidate: CandidateInit,
    ) -> Result<(), RoomError> {
        let peer = self.resolve_peer(peer_id).await?;
        peer.add_remote_candidate(candidate).await
    }

    async fn handle_agent_task(
        &self,
        peer_id: Uuid,
        handle: &ClientHandle,
        task: &str,
        options: Option<serde_json::Value>,
    ) -> Result<(), RoomError> {
        if task != "consultation" {
            return Err(RoomError::Signaling(format!("unknown agent task {task}")));
        }
        let room = self.resolve_room(peer_id).await?;
        room.agent().consultation(handle.clone(), options).await;
        Ok(())
    }

    async fn handle_end_session(
        self: &Arc<Self>,
        peer_id: Uuid,
        handle: &ClientHandle,
    ) -> Result<(), RoomError> {
        let room = self.resolve_room(peer_id).await?;
        room.end().await;

        let flushed = room.agent().end_session(handle.clone()).await;
        let manager = Arc::clone(self);
        let room_name = room.name.clone();
        let grace = Duration::from_millis(self.config.end_session_deadline_ms + 5_000);
        tokio::spawn(async move {
            let _ = tokio::time::timeout(grace, flushed).await;
            // Flush already ran; nothing left to drain.
            manager.destroy_room(&room_name, false).await;
        });
        Ok(())
    }

    async fn resolve_room(&self, peer_id: Uuid) -> Result<Arc<Room>, RoomError> {
        let room_name = self
            .peer_rooms
            .get(&peer_id)
            .map(|entry| entry.value().clone())
            .ok_or(RoomError::NotInRoom(peer_id))?;
        let rooms = self.rooms.read().await;
        rooms
            .get(&room_name)
            .cloned()
            .ok_or(RoomError::RoomNotFound(room_name))
    }

    async fn resolve_peer(&self, peer_id: Uuid) -> Result<Arc<PeerSession>, RoomError> {
        let room = self.resolve_room(peer_id).await?;
        room.get_peer(peer_id)
            .await
            .ok_or(RoomError::NotInRoom(peer_id))
    }

    fn agent_deps(&self) -> AgentDeps {
        AgentDeps {
            persistence: Arc::clone(&self.collaborators.persistence),
            llm: Arc::clone(&self.collaborators.llm),
            vector: Arc::clone(&self.collaborators.vector),
            embedder: Arc::clone(&self.collaborators.embedder),
            cache_threshold: self.config.semantic_cache_threshold,
            node_deadline: Duration::from_millis(self.config.pipeline_node_deadline_ms),
            end_session_deadline: Duration::from_millis(self.config.end_session_deadline_ms),
            llm_available: self.llm_available.load(Ordering::Acquire),
            writes: self.writes.clone(),
        }
    }

    fn stt_session_config(&self) -> SttSessionConfig {
        SttSessionConfig {
            language_code: self.config.stt_language_code.clone(),
            model: self.config.stt_model.clone(),
            enable_automatic_punctuation: self.config.stt_enable_automatic_punctuation,
            phrase_hints: DOMAIN_PHRASES.iter().map(ToString::to_string).collect(),
            sample_rate: crate::stt::pcm::SAMPLE_RATE,
        }
    }

    /// Wire ICE, connection-state and track handlers for a new session.
    fn setup_peer_callbacks(&self, room: &Arc<Room>, peer: &Arc<PeerSession>) {
        // Locally gathered candidates trickle to the browser.
        let signal = peer.signal.clone();
        peer.peer_connection
            .on_ice_candidate(Box::new(move |candidate| {
                let signal = signal.clone();
                Box::pin(async move {
                    if let Some(candidate) = candidate {
                        match candidate.to_json() {
                            Ok(json) => signal.send(ServerEvent::IceCandidate {
                                candidate: CandidateInit {
                                    candidate: json.candidate,
                                    sdp_mid: json.sdp_mid,
                                    sdp_mline_index: json.sdp_mline_index,
                                },
                            }),
                            Err(e) => warn!(error = %e, "Failed to serialize ICE candidate"),
                        }
                    }
                })
            }));

        let peer_weak = Arc::downgrade(peer);
        let room_weak = Arc::downgrade(room);
        peer.peer_connection
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let peer_weak = peer_weak.clone();
                let room_weak = room_weak.clone();
                Box::pin(async move {
                    let (Some(peer), Some(room)) = (peer_weak.upgrade(), room_weak.upgrade())
                    else {
                        return;
                    };
                    debug!(peer_id = %peer.peer_id, state = ?state, "Peer connection state changed");
                    match state {
                        RTCPeerConnectionState::Connected => {
                            peer.set_state(PeerState::Connected);
                            // A newly established call may have queued
                            // renegotiations waiting on it.
                            room.flush_deferred_renegotiations().await;
                        }
                        RTCPeerConnectionState::Failed => {
                            peer.set_state(PeerState::Failed);
                            warn!(peer_id = %peer.peer_id, "Peer connection failed");
                            peer.signal.send(ServerEvent::Error {
                                message: "connection_failed".to_string(),
                            });
                        }
                        RTCPeerConnectionState::Disconnected => {
                            warn!(peer_id = %peer.peer_id, "Peer connection disconnected");
                        }
                        _ => {}
                    }
                })
            }));

        let peer_weak = Arc::downgrade(peer);
        let room_weak = Arc::downgrade(room);
        let stt_provider = self.collaborators.stt.clone();
        let stt_config = self.stt_session_config();
        let persistence = Arc::clone(&self.collaborators.persistence);
        let writes = self.writes.clone();
        peer.peer_connection
            .on_track(Box::new(move |track, _receiver, _transceiver| {
                let peer_weak = peer_weak.clone();
                let room_weak = room_weak.clone();
                let stt_provider = stt_provider.clone();
                let stt_config = stt_config.clone();
                let persistence = Arc::clone(&persistence);
                let writes = writes.clone();
                Box::pin(async move {
                    let (Some(peer), Some(room)) = (peer_weak.upgrade(), room_weak.upgrade())
                    else {
                        return;
                    };
                    if track.kind() != RTPCodecType::Audio {
                        debug!(peer_id = %peer.peer_id, kind = ?track.kind(), "Ignoring non-audio track");
                        return;
                    }
                    info!(
                        peer_id = %peer.peer_id,
                        room = %room.name,
                        track_id = %track.id(),
                        "Upstream audio track arrived"
                    );

                    let relay = AudioRelayTrack::new();
                    peer.hold_task(relay.spawn_reader(track));
                    peer.set_relay(Arc::clone(&relay));

                    // One independent downstream per existing member; their
                    // browsers re-offer once the room is fully connected.
                    for other in room.other_peers(peer.peer_id).await {
                        if other.has_downstream(peer.peer_id).await {
                            continue;
                        }
                        match other.add_downstream(peer.peer_id, relay.subscribe()).await {
                            Ok(()) => other.request_renegotiation("track_added"),
                            Err(e) => warn!(
                                source = %peer.peer_id,
                                subscriber = %other.peer_id,
                                error = %e,
                                "Failed to fan out new track"
                            ),
                        }
                    }
                    room.flush_deferred_renegotiations().await;

                    // Second independent subscription: the transcription tap.
                    if let Some(provider) = stt_provider {
                        spawn_stt_pipeline(
                            &peer,
                            Arc::downgrade(&room),
                            provider,
                            stt_config,
                            persistence,
                            writes,
                        );
                    }
                })
            }));
    }

    /// Remove a room from the registry and release everything it owns.
    async fn destroy_room(&self, room_name: &str, drain: bool) {
        let Some(room) = self.rooms.write().await.remove(room_name) else {
            return;
        };
        room.agent().shutdown(drain).await;
        for peer in room.all_peers().await {
            self.peer_rooms.remove(&peer.peer_id);
            room.remove_peer(peer.peer_id).await;
            peer.close("room destroyed").await;
        }
        info!(room = %room_name, drain, "Room destroyed");
    }

    /// Active room count.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Look up a room by name.
    pub async fn get_room(&self, room_name: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(room_name).cloned()
    }

    /// Graceful shutdown: destroy rooms (draining their agents), then drain
    /// pending write-through tasks.
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.rooms.read().await.keys().cloned().collect();
        for name in names {
            self.destroy_room(&name, true).await;
        }
        self.writes.close();
        self.writes.wait().await;
        info!("Room manager drained");
    }
}

/// Bridge the relay tap into a rotating STT stream and pump its transcript
/// events into the room: broadcast, append-on-final, persist, tick.
fn spawn_stt_pipeline(
    peer: &Arc<PeerSession>,
    room: Weak<Room>,
    provider: Arc<dyn SttProvider>,
    config: SttSessionConfig,
    persistence: Arc<dyn Persistence>,
    writes: TaskTracker,
) {
    let Some(relay) = peer.relay() else { return };

    let mut tap = relay.tap();
    let (frames_tx, frames_rx) = mpsc::channel(256);
    let bridge: JoinHandle<()> = tokio::spawn(async move {
        while let Some(frame) = tap.recv().await {
            if frames_tx.send(frame.payload).await.is_err() {
                break;
            }
        }
    });
    peer.hold_task(bridge);

    let (events_tx, mut events_rx) = mpsc::channel(64);
    match SttStream::spawn(provider, config, frames_rx, events_tx) {
        Ok(stream) => peer.set_stt(stream),
        Err(e) => {
            warn!(peer_id = %peer.peer_id, error = %e, "STT unavailable for peer");
            peer.signal.send(ServerEvent::Error {
                message: format!("stt unavailable: {e}"),
            });
            return;
        }
    }

    let peer_id = peer.peer_id;
    let nickname = peer.nickname.clone();
    let role = peer.role;
    let signal = peer.signal.clone();
    let pump: JoinHandle<()> = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                SttStreamEvent::Transcript(result) => {
                    let Some(room) = room.upgrade() else { break };
                    if result.is_final {
                        let turn = room
                            .append_turn(peer_id, &nickname, role, result.text, result.confidence)
                            .await;
                        room.broadcast(
                            &Envelope::from(ServerEvent::Transcript {
                                peer_id,
                                nickname: nickname.clone(),
                                text: turn.text.clone(),
                                timestamp: turn.timestamp,
                                is_final: true,
                                confidence: turn.confidence,
                                source: turn.source.clone(),
                            }),
                            None,
                        )
                        .await;

                        let session_id = room.session_id;
                        let row = TranscriptRow {
                            turn_index: turn.turn_index,
                            speaker_type: turn.speaker_role.as_str().to_string(),
                            speaker_name: turn.nickname.clone(),
                            text: turn.text.clone(),
                            timestamp: turn.timestamp,
                            confidence: turn.confidence,
                            is_final: true,
                            source: turn.source.clone(),
                        };
                        let persistence = Arc::clone(&persistence);
                        writes.spawn(async move {
                            if let Err(e) = persistence.transcript_append(session_id, row).await {
                                warn!(error = %e, "Dropping transcript write");
                            }
                        });

                        room.agent().notify_tick();
                    } else {
                        room.broadcast(
                            &Envelope::from(ServerEvent::Transcript {
                                peer_id,
                                nickname: nickname.clone(),
                                text: result.text,
                                timestamp: chrono::Utc::now(),
                                is_final: false,
                                confidence: result.confidence,
                                source: super::room::TRANSCRIPT_SOURCE_STT.to_string(),
                            }),
                            None,
                        )
                        .await;
                    }
                }
                SttStreamEvent::Failed(reason) => {
                    // Peer-level: the room continues without STT for this
                    // speaker.
                    warn!(peer_id = %peer_id, reason = %reason, "STT ended for peer");
                    signal.send(ServerEvent::Error {
                        message: format!("stt failed: {reason}"),
                    });
                    break;
                }
            }
        }
    });
    peer.hold_task(pump);
}

#[cfg(test)]
#[path = "manager_test.rs"]
mod manager_test;
