//! Streaming Transcription
//!
//! Per-peer adapters between the audio relay tap and the external STT
//! provider: PCM conversion, chunking and seamless session rotation.

pub mod pcm;
pub mod provider;
pub mod stream;
pub mod ws;

pub use provider::{SttError, SttProvider, SttResult, SttSessionConfig, DOMAIN_PHRASES};
pub use stream::{SttStream, SttStreamEvent};
pub use ws::WsSttProvider;
