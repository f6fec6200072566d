//! Signaling Message Types
//!
//! JSON envelope shared with the browser: `{"type": ..., "data": ...}`,
//! plus `node`/`turn_id` beside the tag on analysis updates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role of a room participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Human counselor.
    Agent,
    /// Counseled customer.
    Customer,
}

impl Role {
    /// Wire name used in persistence rows.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Customer => "customer",
        }
    }
}

/// ICE candidate payload. Browsers wrap the init dict in a `candidate`
/// field; one level of nesting is tolerated on inbound.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateInit {
    /// Candidate string.
    pub candidate: String,
    /// SDP mid.
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// SDP media line index.
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// Inbound `ice_candidate` data: either the init dict itself or the dict
/// wrapped once in a `candidate` field.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IceCandidateData {
    /// `{"candidate": {"candidate": ..., "sdpMid": ...}}`
    Wrapped { candidate: CandidateInit },
    /// `{"candidate": ..., "sdpMid": ...}`
    Flat(CandidateInit),
}

impl IceCandidateData {
    /// Unwrap to the candidate init dict.
    #[must_use]
    pub fn into_inner(self) -> CandidateInit {
        match self {
            Self::Wrapped { candidate } | Self::Flat(candidate) => candidate,
        }
    }
}

/// Client-to-server signaling events.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Join (and lazily create) a named room. An `agent_code` marks the
    /// counselor side; otherwise the peer joins as a customer.
    JoinRoom {
        room_name: String,
        nickname: String,
        #[serde(default)]
        phone_number: Option<String>,
        #[serde(default)]
        agent_code: Option<String>,
    },
    /// WebRTC offer; the server answers.
    Offer {
        sdp: String,
        #[serde(rename = "type")]
        kind: String,
    },
    /// Trickle ICE candidate from the browser.
    IceCandidate(IceCandidateData),
    /// Leave the current room.
    LeaveRoom {},
    /// Direct task for the room agent (e.g. one-shot consultation guide).
    AgentTask {
        task: String,
        #[serde(default)]
        room_name: Option<String>,
        #[serde(default)]
        user_options: Option<serde_json::Value>,
    },
    /// Finalize the consultation session.
    EndSession {},
}

/// Summary of another participant, sent on join.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSummary {
    /// Peer ID.
    pub peer_id: Uuid,
    /// Nickname.
    pub nickname: String,
    /// Role.
    pub role: Role,
}

/// Status of a direct agent task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Processing,
    Done,
    Error,
}

/// Server-to-client signaling events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Fresh server-minted peer id, first event on every connection.
    PeerId { peer_id: Uuid },
    /// Join confirmation with roster and any resolved customer context.
    RoomJoined {
        room_name: String,
        peer_count: usize,
        other_peers: Vec<PeerSummary>,
        #[serde(skip_serializing_if = "Option::is_none")]
        customer_info: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        consultation_history: Option<serde_json::Value>,
    },
    /// Another peer joined the room.
    UserJoined {
        peer_id: Uuid,
        nickname: String,
        peer_count: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        customer_info: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        consultation_history: Option<serde_json::Value>,
    },
    /// Another peer left the room.
    UserLeft {
        peer_id: Uuid,
        nickname: String,
        peer_count: usize,
    },
    /// WebRTC answer to the client's offer.
    Answer {
        sdp: String,
        #[serde(rename = "type")]
        kind: String,
    },
    /// Trickle ICE candidate from the server.
    IceCandidate { candidate: CandidateInit },
    /// The client should produce a new offer.
    RenegotiationNeeded { reason: String },
    /// Interim or final transcript for one speaker.
    Transcript {
        peer_id: Uuid,
        nickname: String,
        text: String,
        timestamp: DateTime<Utc>,
        is_final: bool,
        confidence: f32,
        source: String,
    },
    /// Analysis pipeline availability.
    AgentReady { llm_available: bool },
    /// One analysis node's result; `node`/`turn_id` ride on the envelope.
    AgentUpdate(serde_json::Value),
    /// Progress of a direct agent task.
    AgentStatus {
        task: String,
        status: TaskStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// One-shot consultation guide.
    AgentConsultation {
        guide: Vec<String>,
        recommendations: Vec<serde_json::Value>,
        citations: Vec<String>,
        generated_at: DateTime<Utc>,
    },
    /// Session finalization outcome.
    SessionEnded {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<Uuid>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Peer-visible error.
    Error { message: String },
}

/// Outbound envelope. `node` and `turn_id` sit beside `type`/`data` and are
/// only populated for `agent_update`.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub event: ServerEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
}

impl Envelope {
    /// Envelope for an analysis node result.
    #[must_use]
    pub fn agent_update(node: &str, turn_id: &str, payload: serde_json::Value) -> Self {
        Self {
            event: ServerEvent::AgentUpdate(payload),
            node: Some(node.to_string()),
            turn_id: Some(turn_id.to_string()),
        }
    }
}

impl From<ServerEvent> for Envelope {
    fn from(event: ServerEvent) -> Self {
        Self {
            event,
            node: None,
            turn_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_room_parses() {
        let raw = r#"{"type":"join_room","data":{"room_name":"R","nickname":"kim","phone_number":"01012345678"}}"#;
        let event: ClientEvent = serde_json::from_str(raw).unwrap();
        match event {
            ClientEvent::JoinRoom {
                room_name,
                nickname,
                phone_number,
                agent_code,
            } => {
                assert_eq!(room_name, "R");
                assert_eq!(nickname, "kim");
                assert_eq!(phone_number.as_deref(), Some("01012345678"));
                assert!(agent_code.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn leave_room_with_empty_data_parses() {
        let raw = r#"{"type":"leave_room","data":{}}"#;
        assert!(matches!(
            serde_json::from_str::<ClientEvent>(raw).unwrap(),
            ClientEvent::LeaveRoom {}
        ));
    }

    #[test]
    fn ice_candidate_accepts_both_nestings() {
        let nested = r#"{"type":"ice_candidate","data":{"candidate":{"candidate":"candidate:1 1 udp 1 10.0.0.1 1 typ relay","sdpMid":"0","sdpMLineIndex":0}}}"#;
        let flat = r#"{"type":"ice_candidate","data":{"candidate":"candidate:1 1 udp 1 10.0.0.1 1 typ relay","sdpMid":"0","sdpMLineIndex":0}}"#;

        for raw in [nested, flat] {
            let event: ClientEvent = serde_json::from_str(raw).unwrap();
            match event {
                ClientEvent::IceCandidate(data) => {
                    let init = data.into_inner();
                    assert!(init.candidate.contains("typ relay"));
                    assert_eq!(init.sdp_mid.as_deref(), Some("0"));
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[test]
    fn agent_update_envelope_lifts_node_and_turn_id() {
        let envelope =
            Envelope::agent_update("intent", "turn_3", serde_json::json!({"intent_label":"x"}));
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "agent_update");
        assert_eq!(value["node"], "intent");
        assert_eq!(value["turn_id"], "turn_3");
        assert_eq!(value["data"]["intent_label"], "x");
    }

    #[test]
    fn plain_event_envelope_omits_node() {
        let envelope = Envelope::from(ServerEvent::AgentReady {
            llm_available: true,
        });
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "agent_ready");
        assert!(value.get("node").is_none());
        assert_eq!(value["data"]["llm_available"], true);
    }
}
