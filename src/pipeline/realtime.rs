//! Speech-to-speech passthrough pipeline.
//!
//! Audio frames go to the realtime provider essentially verbatim; provider
//! events come back translated into [`PipelineEvent`]s by a relay task. Turn
//! detection lives on the provider side, so there is no local VAD here.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{PipelineEvent, VoicePipeline};
use crate::providers::{ProviderError, RealtimeEvent, RealtimeVoice};
use crate::session::types::SessionMode;

pub struct RealtimePipeline {
    provider: Mutex<Box<dyn RealtimeVoice>>,
    relay: JoinHandle<()>,
}

impl RealtimePipeline {
    /// Connect the provider and start relaying its events. A connect failure
    /// here is the session-start fallback trigger.
    pub async fn connect(
        mut provider: Box<dyn RealtimeVoice>,
        events: mpsc::Sender<PipelineEvent>,
    ) -> Result<Self, ProviderError> {
        let provider_events = provider.connect().await?;
        let relay = tokio::spawn(Self::relay(provider_events, events));
        Ok(Self {
            provider: Mutex::new(provider),
            relay,
        })
    }

    async fn relay(
        mut provider_events: mpsc::Receiver<RealtimeEvent>,
        events: mpsc::Sender<PipelineEvent>,
    ) {
        while let Some(event) = provider_events.recv().await {
            let translated = match event {
                RealtimeEvent::SpeechStarted { .. } => vec![PipelineEvent::SpeechStarted],
                RealtimeEvent::SpeechEnded { duration_ms, .. } => {
                    vec![PipelineEvent::SpeechEnded { duration_ms }]
                }
                RealtimeEvent::UserTranscript { text, is_final } => {
                    vec![PipelineEvent::Transcript { text, is_final }]
                }
                RealtimeEvent::ResponseStarted => vec![PipelineEvent::ResponseStarted],
                RealtimeEvent::TextDelta { delta } => vec![PipelineEvent::TextDelta { delta }],
                RealtimeEvent::AudioDelta { data, sample_rate } => vec![PipelineEvent::Audio {
                    data,
                    sample_rate,
                    is_final: false,
                }],
                RealtimeEvent::ResponseDone => vec![
                    PipelineEvent::Audio {
                        data: Bytes::new(),
                        sample_rate: 0,
                        is_final: true,
                    },
                    PipelineEvent::ResponseComplete,
                ],
                RealtimeEvent::Error(error) if error.is_fatal() => {
                    warn!(%error, "realtime provider failed fatally");
                    vec![PipelineEvent::FallbackRequired {
                        reason: error.to_string(),
                    }]
                }
                RealtimeEvent::Error(error) => {
                    warn!(%error, "realtime provider reported a turn error");
                    vec![PipelineEvent::TurnFailed { error }]
                }
                RealtimeEvent::Disconnected { reason } => {
                    debug!(%reason, "realtime provider disconnected");
                    vec![PipelineEvent::FallbackRequired { reason }]
                }
            };
            for event in translated {
                if events.send(event).await.is_err() {
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl VoicePipeline for RealtimePipeline {
    fn mode(&self) -> SessionMode {
        SessionMode::Realtime
    }

    async fn push_audio(&self, frame: Bytes) -> Result<(), ProviderError> {
        self.provider.lock().await.send_audio(frame).await
    }

    async fn end_turn(&self) -> Result<(), ProviderError> {
        // Turn boundaries come from the provider's server-side VAD.
        Ok(())
    }

    async fn cancel_response(&self) -> Result<(), ProviderError> {
        self.provider.lock().await.cancel().await
    }

    async fn shutdown(&self) {
        self.provider.lock().await.close().await;
        self.relay.abort();
    }
}
