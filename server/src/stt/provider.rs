//! STT Provider Seam
//!
//! A provider session is a pair of channels: PCM chunks go up, transcript
//! events come down. The concrete wire protocol lives behind [`SttProvider`].

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors from the transcription provider.
#[derive(Debug, Clone, Error)]
pub enum SttError {
    /// Credential or configuration failure. Non-retryable, peer-level.
    #[error("fatal stt error: {0}")]
    Fatal(String),

    /// Stream-limit or transport hiccup. Handled by session rotation and
    /// never surfaced to the client.
    #[error("transient stt error: {0}")]
    Transient(String),
}

impl SttError {
    /// Classify a provider-reported error string. Duration-limit and
    /// "internal"/"500"-class signals rotate; credential and configuration
    /// signals are fatal.
    #[must_use]
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        let fatal = ["unauthorized", "unauthenticated", "credential", "permission", "invalid argument", "not found"]
            .iter()
            .any(|needle| lower.contains(needle));
        if fatal {
            Self::Fatal(message.to_string())
        } else {
            Self::Transient(message.to_string())
        }
    }

    /// Whether this error triggers a scheduled rotation.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Configuration for one provider session.
#[derive(Debug, Clone)]
pub struct SttSessionConfig {
    /// BCP-47 language code.
    pub language_code: String,
    /// Streaming model name.
    pub model: String,
    /// Ask for automatic punctuation.
    pub enable_automatic_punctuation: bool,
    /// Domain phrases boosted in recognition (tariff/plan/penalty terms).
    pub phrase_hints: Vec<String>,
    /// PCM sample rate submitted to the provider.
    pub sample_rate: u32,
}

/// One transcription result from the provider.
#[derive(Debug, Clone)]
pub struct SttResult {
    /// Recognized text.
    pub text: String,
    /// Committed result; interim results may be superseded.
    pub is_final: bool,
    /// Provider confidence in [0, 1].
    pub confidence: f32,
}

/// An open provider session.
///
/// Dropping `audio_tx` ends the upstream; the `results` channel closes once
/// the provider has flushed. A session-level failure arrives as an `Err`
/// result and also closes the channel.
pub struct SttSessionHandle {
    /// PCM chunk uplink (s16le, mono, ≤25 KB per submission).
    pub audio_tx: mpsc::Sender<Bytes>,
    /// Transcript downlink.
    pub results: mpsc::Receiver<Result<SttResult, SttError>>,
}

/// Streaming transcription provider.
#[async_trait]
pub trait SttProvider: Send + Sync + 'static {
    /// Open a streaming session.
    async fn open(&self, config: &SttSessionConfig) -> Result<SttSessionHandle, SttError>;
}

/// Fixed dictionary of domain phrases boosted for every peer.
pub const DOMAIN_PHRASES: &[&str] = &[
    "요금제",
    "요금제 변경",
    "해지",
    "위약금",
    "약정",
    "멤버십",
    "결합 할인",
    "선택 약정",
    "데이터 무제한",
    "납부",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_internal_errors_as_transient() {
        assert!(SttError::classify("500 Internal Server Error").is_transient());
        assert!(SttError::classify("internal: stream duration limit exceeded").is_transient());
        assert!(SttError::classify("connection reset").is_transient());
    }

    #[test]
    fn classify_credential_errors_as_fatal() {
        assert!(!SttError::classify("401 Unauthorized").is_transient());
        assert!(!SttError::classify("invalid argument: bad encoding").is_transient());
        assert!(!SttError::classify("credential expired").is_transient());
    }
}
