//! Room Service Errors

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur on the signaling and media plane.
#[derive(Debug, Error)]
pub enum RoomError {
    /// Room was explicitly ended; it no longer accepts joins.
    #[error("room closed: {0}")]
    RoomClosed(String),

    /// Room not found.
    #[error("room not found: {0}")]
    RoomNotFound(String),

    /// Peer is not a member of any room.
    #[error("peer not in a room: {0}")]
    NotInRoom(Uuid),

    /// Peer already joined a room.
    #[error("peer already joined a room")]
    DuplicateJoin,

    /// Process-wide room limit reached.
    #[error("room limit reached (max: {max_rooms})")]
    RoomLimitReached {
        /// Maximum allowed concurrent rooms.
        max_rooms: usize,
    },

    /// Signaling message not legal in the current peer state.
    #[error("bad state: {0}")]
    BadState(String),

    /// WebRTC error.
    #[error("webrtc error: {0}")]
    WebRtc(String),

    /// Signaling error.
    #[error("signaling error: {0}")]
    Signaling(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<webrtc::Error> for RoomError {
    fn from(err: webrtc::Error) -> Self {
        Self::WebRtc(err.to_string())
    }
}
