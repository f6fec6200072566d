//! Per-Peer STT Stream
//!
//! Long-lived task that feeds one speaker's relay tap into the provider and
//! forwards transcript events. Provider stream-duration limits surface as
//! transient errors; the stream treats them as scheduled rotations and opens
//! a successor session, losing at most the chunk in flight.

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::pcm::{split_chunks, PcmConverter};
use super::provider::{SttError, SttProvider, SttResult, SttSessionConfig};

/// Consecutive failed session opens tolerated before giving up.
const MAX_OPEN_FAILURES: u32 = 5;

/// Events surfaced to the stream's owner.
#[derive(Debug, Clone)]
pub enum SttStreamEvent {
    /// Interim or final transcript.
    Transcript(SttResult),
    /// Non-retryable failure; transcription for this peer has ended.
    Failed(String),
}

/// Handle to a running per-peer transcription stream.
///
/// The worker task must be held strongly for its whole lifetime; dropping
/// the handle aborts it.
pub struct SttStream {
    handle: JoinHandle<()>,
}

impl SttStream {
    /// Start transcribing `frames` (Opus payloads from the relay tap).
    ///
    /// Fails only when the local decoder cannot be opened; provider problems
    /// are reported through `events`.
    pub fn spawn(
        provider: Arc<dyn SttProvider>,
        config: SttSessionConfig,
        frames: mpsc::Receiver<Bytes>,
        events: mpsc::Sender<SttStreamEvent>,
    ) -> Result<Self, SttError> {
        let converter = PcmConverter::new()?;
        let handle = tokio::spawn(run(provider, config, frames, events, converter));
        Ok(Self { handle })
    }

    /// Stop the stream immediately.
    pub fn abort(&self) {
        self.handle.abort();
    }
}

impl Drop for SttStream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Forward one result, coalescing interim results under backpressure.
/// Returns false once the owner is gone.
async fn forward(events: &mpsc::Sender<SttStreamEvent>, result: SttResult) -> bool {
    if result.is_final {
        events.send(SttStreamEvent::Transcript(result)).await.is_ok()
    } else {
        match events.try_send(SttStreamEvent::Transcript(result)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("Owner slower than realtime, coalescing interim result");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

async fn run(
    provider: Arc<dyn SttProvider>,
    config: SttSessionConfig,
    mut frames: mpsc::Receiver<Bytes>,
    events: mpsc::Sender<SttStreamEvent>,
    mut converter: PcmConverter,
) {
    let mut open_failures = 0u32;
    let mut rotations = 0u64;

    'rotate: loop {
        let session = match provider.open(&config).await {
            Ok(session) => session,
            Err(e) if e.is_transient() && open_failures < MAX_OPEN_FAILURES => {
                open_failures += 1;
                warn!(attempt = open_failures, error = %e, "STT session open failed, retrying");
                tokio::time::sleep(std::time::Duration::from_millis(
                    100 * u64::from(open_failures),
                )).await;
                continue 'rotate;
            }
            Err(e) => {
                let _ = events.send(SttStreamEvent::Failed(e.to_string())).await;
                return;
            }
        };
        open_failures = 0;
        if rotations > 0 {
            info!(rotations, "STT session rotated");
        }

        let audio_tx = session.audio_tx;
        let mut results = session.results;

        loop {
            tokio::select! {
                frame = frames.recv() => match frame {
                    Some(payload) => {
                        let pcm = match converter.decode(&payload) {
                            Ok(pcm) => pcm,
                            Err(e) => {
                                debug!(error = %e, "Dropping undecodable frame");
                                continue;
                            }
                        };
                        for chunk in split_chunks(pcm) {
                            if audio_tx.send(chunk).await.is_err() {
                                rotations += 1;
                                continue 'rotate;
                            }
                        }
                    }
                    None => {
                        // Upstream ended: half-close, drain the provider's
                        // final results, then finish.
                        drop(audio_tx);
                        while let Some(result) = results.recv().await {
                            match result {
                                Ok(r) => {
                                    if !forward(&events, r).await {
                                        return;
                                    }
                                }
                                Err(_) => break,
                            }
                        }
                        return;
                    }
                },
                result = results.recv() => match result {
                    Some(Ok(r)) => {
                        if !forward(&events, r).await {
                            return;
                        }
                    }
                    Some(Err(e)) if e.is_transient() => {
                        rotations += 1;
                        debug!(error = %e, "Rotating STT session");
                        continue 'rotate;
                    }
                    Some(Err(e)) => {
                        let _ = events.send(SttStreamEvent::Failed(e.to_string())).await;
                        return;
                    }
                    None => {
                        // Provider closed without a verdict; rotate.
                        rotations += 1;
                        continue 'rotate;
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stt::provider::{SttSessionHandle, DOMAIN_PHRASES};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn final_result(text: &str) -> Result<SttResult, SttError> {
        Ok(SttResult {
            text: text.into(),
            is_final: true,
            confidence: 0.9,
        })
    }

    fn interim_result(text: &str) -> Result<SttResult, SttError> {
        Ok(SttResult {
            text: text.into(),
            is_final: false,
            confidence: 0.5,
        })
    }

    /// Provider that replays scripted result sequences, one per session.
    struct ScriptedProvider {
        sessions: Mutex<VecDeque<Vec<Result<SttResult, SttError>>>>,
        opened: Mutex<u32>,
    }

    impl ScriptedProvider {
        fn new(sessions: Vec<Vec<Result<SttResult, SttError>>>) -> Self {
            Self {
                sessions: Mutex::new(sessions.into()),
                opened: Mutex::new(0),
            }
        }

        fn opened(&self) -> u32 {
            *self.opened.lock().unwrap()
        }
    }

    #[async_trait]
    impl SttProvider for ScriptedProvider {
        async fn open(&self, _config: &SttSessionConfig) -> Result<SttSessionHandle, SttError> {
            *self.opened.lock().unwrap() += 1;
            let script = self
                .sessions
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_default();

            let (audio_tx, mut audio_rx) = mpsc::channel::<Bytes>(16);
            let (result_tx, results) = mpsc::channel(16);

            tokio::spawn(async move {
                for item in script {
                    if result_tx.send(item).await.is_err() {
                        return;
                    }
                }
                // Like a real provider: flush is complete once the uplink
                // half-closes, then the downlink ends.
                while audio_rx.recv().await.is_some() {}
            });

            Ok(SttSessionHandle { audio_tx, results })
        }
    }

    fn test_config() -> SttSessionConfig {
        SttSessionConfig {
            language_code: "ko-KR".into(),
            model: "latest_long".into(),
            enable_automatic_punctuation: true,
            phrase_hints: DOMAIN_PHRASES.iter().map(ToString::to_string).collect(),
            sample_rate: 48_000,
        }
    }

    #[tokio::test]
    async fn rotation_is_invisible_and_preserves_order() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            vec![
                interim_result("요금제"),
                final_result("요금제 변경하고 싶어요"),
                Err(SttError::Transient("internal: stream limit".into())),
            ],
            vec![final_result("해지 위약금이 얼마인가요")],
        ]));

        let (frames_tx, frames_rx) = mpsc::channel::<Bytes>(8);
        let (events_tx, mut events_rx) = mpsc::channel(32);
        let _stream =
            SttStream::spawn(provider.clone(), test_config(), frames_rx, events_tx).unwrap();

        let mut finals = Vec::new();
        while finals.len() < 2 {
            match tokio::time::timeout(std::time::Duration::from_secs(5), events_rx.recv())
                .await
                .expect("stream stalled")
                .expect("stream closed early")
            {
                SttStreamEvent::Transcript(r) if r.is_final => finals.push(r.text),
                SttStreamEvent::Transcript(_) => {}
                SttStreamEvent::Failed(reason) => panic!("rotation surfaced as failure: {reason}"),
            }
        }

        assert_eq!(
            finals,
            vec!["요금제 변경하고 싶어요", "해지 위약금이 얼마인가요"]
        );
        assert_eq!(provider.opened(), 2);
        drop(frames_tx);
    }

    #[tokio::test]
    async fn fatal_provider_error_is_surfaced_once() {
        let provider = Arc::new(ScriptedProvider::new(vec![vec![
            Err(SttError::Fatal("401 Unauthorized".into())),
        ]]));

        let (_frames_tx, frames_rx) = mpsc::channel::<Bytes>(8);
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let _stream = SttStream::spawn(provider, test_config(), frames_rx, events_tx).unwrap();

        match tokio::time::timeout(std::time::Duration::from_secs(5), events_rx.recv())
            .await
            .expect("stream stalled")
            .expect("stream closed early")
        {
            SttStreamEvent::Failed(reason) => assert!(reason.contains("401")),
            other => panic!("expected failure event, got {other:?}"),
        }
        assert!(events_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn upstream_end_drains_final_results() {
        let provider = Arc::new(ScriptedProvider::new(vec![vec![final_result("마지막 문장")]]));

        let (frames_tx, frames_rx) = mpsc::channel::<Bytes>(8);
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let _stream = SttStream::spawn(provider, test_config(), frames_rx, events_tx).unwrap();

        // End the upstream immediately; the final result must still arrive.
        drop(frames_tx);

        match tokio::time::timeout(std::time::Duration::from_secs(5), events_rx.recv())
            .await
            .expect("stream stalled")
            .expect("stream closed early")
        {
            SttStreamEvent::Transcript(r) => {
                assert!(r.is_final);
                assert_eq!(r.text, "마지막 문장");
            }
            other => panic!("expected transcript, got {other:?}"),
        }
    }
}
