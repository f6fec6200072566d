//! Peer Session
//!
//! One WebRTC peer connection per signaling client. The browser offers,
//! the server answers; remote ICE candidates are buffered until the remote
//! description is applied; renegotiation requests are deferred while the
//! call is still establishing.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;
use webrtc::api::API;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

use super::error::RoomError;
use super::relay::{spawn_forwarder, AudioRelayTrack, RelaySubscription};
use crate::signal::messages::{CandidateInit, Role, ServerEvent};
use crate::signal::ClientHandle;
use crate::stt::SttStream;

/// Peer connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    OfferReceived,
    Answering,
    Connected,
    Failed,
    Closed,
}

/// Opus capability used for every egress track; the media engine registers
/// nothing else.
#[must_use]
pub fn opus_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "audio/opus".to_string(),
        clock_rate: 48000,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
        rtcp_feedback: vec![],
    }
}

/// Represents one participant's WebRTC connection.
pub struct PeerSession {
    /// Server-minted peer id, unique per signaling connection.
    pub peer_id: Uuid,
    /// Room this peer belongs to.
    pub room_name: String,
    /// Nickname.
    pub nickname: String,
    /// Participant role.
    pub role: Role,
    /// Customer phone reference, when provided on join.
    pub customer_ref: Option<String>,
    /// Join time.
    pub joined_at: DateTime<Utc>,
    /// The WebRTC peer connection.
    pub peer_connection: Arc<RTCPeerConnection>,
    /// Signaling channel back to the browser.
    pub signal: ClientHandle,

    state: StdMutex<PeerState>,
    remote_description_set: AtomicBool,
    pending_candidates: StdMutex<Vec<RTCIceCandidateInit>>,
    applied_candidates: StdMutex<HashSet<String>>,
    /// Egress tracks keyed by source peer.
    outgoing_tracks: RwLock<HashMap<Uuid, Arc<TrackLocalStaticRTP>>>,
    /// Strong references to every task pumping media or transcripts for
    /// this peer. Dropping these silently kills the pipelines, so they are
    /// held for the session's whole lifetime and aborted on close.
    consumer_tasks: StdMutex<Vec<JoinHandle<()>>>,
    /// This peer's upstream relay hub, set when its audio track arrives.
    relay: StdMutex<Option<Arc<AudioRelayTrack>>>,
    /// Per-peer transcription stream.
    stt: StdMutex<Option<SttStream>>,
    /// Renegotiation requested while the call was still establishing.
    pending_renegotiation: StdMutex<Option<String>>,
}

impl PeerSession {
    /// Create a session with a fresh peer connection.
    pub async fn new(
        api: &API,
        rtc_config: RTCConfiguration,
        peer_id: Uuid,
        room_name: String,
        nickname: String,
        role: Role,
        customer_ref: Option<String>,
        signal: ClientHandle,
    ) -> Result<Self, RoomError> {
        let peer_connection = api.new_peer_connection(rtc_config).await?;

        Ok(Self {
            peer_id,
            room_name,
            nickname,
            role,
            customer_ref,
            joined_at: Utc::now(),
            peer_connection: Arc::new(peer_connection),
            signal,
            state: StdMutex::new(PeerState::New),
            remote_description_set: AtomicBool::new(false),
            pending_candidates: StdMutex::new(Vec::new()),
            applied_candidates: StdMutex::new(HashSet::new()),
            outgoing_tracks: RwLock::new(HashMap::new()),
            consumer_tasks: StdMutex::new(Vec::new()),
            relay: StdMutex::new(None),
            stt: StdMutex::new(None),
            pending_renegotiation: StdMutex::new(None),
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PeerState {
        *self.state.lock().unwrap()
    }

    pub(crate) fn set_state(&self, state: PeerState) {
        *self.state.lock().unwrap() = state;
    }

    /// Whether the transport is established.
    pub fn is_connected(&self) -> bool {
        self.state() == PeerState::Connected
    }

    /// Apply a browser offer and produce the answer SDP.
    ///
    /// Legal in `New` and, for renegotiation, in `Connected`. Anything else
    /// is a bad state: a second offer racing the first answer is rejected
    /// rather than applied.
    pub async fn handle_offer(&self, sdp: String) -> Result<String, RoomError> {
        let current = self.state();
        if !matches!(current, PeerState::New | PeerState::Connected) {
            return Err(RoomError::BadState(format!(
                "offer not acceptable in state {current:?}"
            )));
        }
        self.set_state(PeerState::OfferReceived);

        let offer = RTCSessionDescription::offer(sdp)
            .map_err(|e| RoomError::Signaling(e.to_string()))?;
        self.peer_connection.set_remote_description(offer).await?;
        self.remote_description_set.store(true, Ordering::Release);
        self.flush_pending_candidates().await;

        let answer = self.peer_connection.create_answer(None).await?;
        self.peer_connection
            .set_local_description(answer.clone())
            .await?;

        // A renegotiation on an established transport does not re-fire the
        // connection-state callback; keep the session CONNECTED.
        if current == PeerState::Connected
            && self.peer_connection.connection_state()
                == webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState::Connected
        {
            self.set_state(PeerState::Connected);
        } else {
            self.set_state(PeerState::Answering);
        }

        Ok(answer.sdp)
    }

    /// Apply a remote ICE candidate, buffering it while no remote
    /// description is set. Duplicates and candidates on a closed session
    /// are no-ops.
    pub async fn add_remote_candidate(&self, candidate: CandidateInit) -> Result<(), RoomError> {
        if self.state() == PeerState::Closed {
            return Ok(());
        }

        {
            let mut applied = self.applied_candidates.lock().unwrap();
            if !applied.insert(candidate.candidate.clone()) {
                debug!(peer_id = %self.peer_id, "Duplicate ICE candidate ignored");
                return Ok(());
            }
        }

        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };

        if self.remote_description_set.load(Ordering::Acquire) {
            self.peer_connection.add_ice_candidate(init).await?;
        } else {
            self.pending_candidates.lock().unwrap().push(init);
        }
        Ok(())
    }

    async fn flush_pending_candidates(&self) {
        let pending: Vec<RTCIceCandidateInit> =
            std::mem::take(&mut *self.pending_candidates.lock().unwrap());
        for init in pending {
            if let Err(e) = self.peer_connection.add_ice_candidate(init).await {
                warn!(peer_id = %self.peer_id, error = %e, "Buffered ICE candidate rejected");
            }
        }
    }

    /// Queue a renegotiation request. The room flushes queued requests only
    /// once every member is connected; renegotiating mid-ICE closes the
    /// transport prematurely.
    pub fn request_renegotiation(&self, reason: &str) {
        debug!(peer_id = %self.peer_id, reason, "Queueing renegotiation");
        *self.pending_renegotiation.lock().unwrap() = Some(reason.to_string());
    }

    /// Emit a deferred renegotiation request, if one is queued and the
    /// transport is up. Returns true when a request was sent.
    pub fn flush_renegotiation(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        let Some(reason) = self.pending_renegotiation.lock().unwrap().take() else {
            return false;
        };
        self.signal
            .send(ServerEvent::RenegotiationNeeded { reason });
        true
    }

    /// Attach one source peer's relayed audio as a new egress track and
    /// start its paced forwarder. Each egress path gets its own relay
    /// subscription.
    pub async fn add_downstream(
        &self,
        source_peer_id: Uuid,
        subscription: RelaySubscription,
    ) -> Result<(), RoomError> {
        let local_track = Arc::new(TrackLocalStaticRTP::new(
            opus_capability(),
            format!("audio-{source_peer_id}"),
            format!("relay-{}-{}", source_peer_id, self.peer_id),
        ));

        self.peer_connection
            .add_track(Arc::clone(&local_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        self.hold_task(spawn_forwarder(subscription, Arc::clone(&local_track)));
        self.outgoing_tracks
            .write()
            .await
            .insert(source_peer_id, local_track);
        Ok(())
    }

    /// Whether this peer already receives audio from `source_peer_id`.
    pub async fn has_downstream(&self, source_peer_id: Uuid) -> bool {
        self.outgoing_tracks.read().await.contains_key(&source_peer_id)
    }

    /// Forget a source's egress track. The m-line itself stays until the
    /// next renegotiation.
    pub async fn remove_downstream(&self, source_peer_id: Uuid) {
        self.outgoing_tracks.write().await.remove(&source_peer_id);
    }

    /// Keep a media/transcript task alive for the session's lifetime.
    pub fn hold_task(&self, handle: JoinHandle<()>) {
        self.consumer_tasks.lock().unwrap().push(handle);
    }

    /// Record this peer's upstream relay hub.
    pub fn set_relay(&self, relay: Arc<AudioRelayTrack>) {
        *self.relay.lock().unwrap() = Some(relay);
    }

    /// This peer's upstream relay hub, if its audio has arrived.
    pub fn relay(&self) -> Option<Arc<AudioRelayTrack>> {
        self.relay.lock().unwrap().clone()
    }

    /// Attach the per-peer transcription stream.
    pub fn set_stt(&self, stream: SttStream) {
        *self.stt.lock().unwrap() = Some(stream);
    }

    /// Tear the session down: stop consumers, end the relay, close the
    /// transport. Idempotent.
    pub async fn close(&self, reason: &str) {
        if self.state() == PeerState::Closed {
            return;
        }
        self.set_state(PeerState::Closed);
        debug!(peer_id = %self.peer_id, reason, "Closing peer session");

        if let Some(relay) = self.relay.lock().unwrap().take() {
            relay.finish();
        }
        let stt = self.stt.lock().unwrap().take();
        drop(stt);

        let tasks: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.consumer_tasks.lock().unwrap());
        for task in tasks {
            task.abort();
        }

        if let Err(e) = self.peer_connection.close().await {
            warn!(peer_id = %self.peer_id, error = %e, "Error closing peer connection");
        }
    }
}
