//! WebSocket STT Provider
//!
//! Streaming adapter for providers that accept binary PCM frames over a
//! WebSocket and answer with JSON transcript events. The session opens with
//! a JSON config message carrying language, model, punctuation and phrase
//! hints.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use super::provider::{SttError, SttProvider, SttResult, SttSessionConfig, SttSessionHandle};

/// Transcript event frame from the provider.
#[derive(Debug, Deserialize)]
struct WireResult {
    #[serde(default)]
    text: String,
    #[serde(default)]
    is_final: bool,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    error: Option<String>,
}

/// WebSocket streaming provider.
pub struct WsSttProvider {
    endpoint: String,
}

impl WsSttProvider {
    /// Provider for a `ws://` / `wss://` streaming endpoint.
    #[must_use]
    pub const fn new(endpoint: String) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl SttProvider for WsSttProvider {
    async fn open(&self, config: &SttSessionConfig) -> Result<SttSessionHandle, SttError> {
        let (ws, _response) = connect_async(self.endpoint.as_str())
            .await
            .map_err(|e| SttError::classify(&e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        let opening = serde_json::json!({
            "config": {
                "language_code": config.language_code,
                "model": config.model,
                "enable_automatic_punctuation": config.enable_automatic_punctuation,
                "sample_rate_hertz": config.sample_rate,
                "encoding": "LINEAR16",
                "phrase_hints": config.phrase_hints,
            }
        });
        sink.send(Message::Text(opening.to_string().into()))
            .await
            .map_err(|e| SttError::classify(&e.to_string()))?;

        let (audio_tx, mut audio_rx) = mpsc::channel::<bytes::Bytes>(64);
        let (result_tx, result_rx) = mpsc::channel::<Result<SttResult, SttError>>(64);

        // Uplink pump: PCM chunks out, half-close when the caller drops the
        // sender.
        tokio::spawn(async move {
            while let Some(chunk) = audio_rx.recv().await {
                if let Err(e) = sink.send(Message::Binary(chunk)).await {
                    debug!(error = %e, "STT uplink closed");
                    break;
                }
            }
            let _ = sink.send(Message::Close(None)).await;
        });

        // Downlink pump: JSON results in.
        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        let parsed: WireResult = match serde_json::from_str(text.as_str()) {
                            Ok(parsed) => parsed,
                            Err(e) => {
                                warn!(error = %e, "Unparseable STT frame, skipping");
                                continue;
                            }
                        };
                        let event = if let Some(error) = parsed.error {
                            Err(SttError::classify(&error))
                        } else {
                            Ok(SttResult {
                                text: parsed.text,
                                is_final: parsed.is_final,
                                confidence: parsed.confidence,
                            })
                        };
                        let terminal = event.is_err();
                        if result_tx.send(event).await.is_err() || terminal {
                            break;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "STT session closed by provider");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = result_tx.send(Err(SttError::classify(&e.to_string()))).await;
                        break;
                    }
                }
            }
        });

        Ok(SttSessionHandle {
            audio_tx,
            results: result_rx,
        })
    }
}
