//! Room and Media Plane
//!
//! Signaling state machine, SFU-style audio fan-out and room lifecycle.
//! Audio arrives as one upstream track per peer and leaves as one
//! independent paced downstream per other peer; a second tap per upstream
//! feeds transcription.

pub mod error;
pub mod manager;
pub mod peer;
pub mod relay;
#[allow(clippy::module_inception)]
pub mod room;

pub use error::RoomError;
pub use manager::{Collaborators, RoomManager};
pub use peer::{PeerSession, PeerState};
pub use relay::{AudioRelayTrack, RelayFrame, RelaySubscription};
pub use room::{Room, RoomStatus, TranscriptTurn, TRANSCRIPT_SOURCE_STT};
