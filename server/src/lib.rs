//! Counsel Assist Server
//!
//! Real-time counselor-assist backend: browser audio over WebRTC relayed
//! among room members, per-speaker streaming transcription, and a per-room
//! analysis pipeline fanned out over the signaling channel.

pub mod agent;
pub mod app;
pub mod config;
pub mod db;
pub mod llm;
pub mod persistence;
pub mod room;
pub mod rtc;
pub mod signal;
pub mod stt;
pub mod vector;
