//! OpenAI Realtime API client.
//!
//! Speech-to-speech over `wss://api.openai.com/v1/realtime`. Audio is PCM16
//! base64 in both directions; server VAD handles turn detection and
//! `response.cancel` is the native interruption primitive.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use base64::prelude::*;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, error, info, warn};

use super::{ProviderError, RealtimeEvent, RealtimeVoice, SecretString};

const OPENAI_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";
const DEFAULT_REALTIME_MODEL: &str = "gpt-4o-realtime-preview";
const DEFAULT_REALTIME_VOICE: &str = "alloy";

/// Sample rate of realtime audio deltas.
const REALTIME_SAMPLE_RATE: u32 = 24_000;

/// Capacity of the outbound client-event channel.
const WS_CHANNEL_CAPACITY: usize = 256;

pub struct OpenAiRealtime {
    api_key: SecretString,
    model: String,
    voice: String,
    instructions: Option<String>,
    connected: Arc<AtomicBool>,
    ws_sender: Arc<Mutex<Option<mpsc::Sender<String>>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl OpenAiRealtime {
    pub fn new(
        api_key: SecretString,
        model: Option<String>,
        voice: Option<String>,
        instructions: Option<String>,
    ) -> Self {
        Self {
            api_key,
            model: model.unwrap_or_else(|| DEFAULT_REALTIME_MODEL.to_string()),
            voice: voice.unwrap_or_else(|| DEFAULT_REALTIME_VOICE.to_string()),
            instructions,
            connected: Arc::new(AtomicBool::new(false)),
            ws_sender: Arc::new(Mutex::new(None)),
            tasks: Vec::new(),
        }
    }

    fn session_update(&self) -> Value {
        json!({
            "type": "session.update",
            "session": {
                "modalities": ["text", "audio"],
                "voice": self.voice,
                "instructions": self.instructions,
                "input_audio_format": "pcm16",
                "output_audio_format": "pcm16",
                "input_audio_transcription": {"model": "whisper-1"},
                "turn_detection": {
                    "type": "server_vad",
                    "create_response": true,
                    "interrupt_response": true,
                },
            },
        })
    }

    async fn queue(&self, event: Value) -> Result<(), ProviderError> {
        let guard = self.ws_sender.lock().await;
        let sender = guard.as_ref().ok_or(ProviderError::NotConnected)?;
        sender
            .send(event.to_string())
            .await
            .map_err(|_| ProviderError::Connection("sender task gone".to_string()))
    }

    /// Translate one provider event into our capability event, if it maps.
    fn translate(value: &Value) -> Option<RealtimeEvent> {
        let kind = value.get("type")?.as_str()?;
        match kind {
            "input_audio_buffer.speech_started" => Some(RealtimeEvent::SpeechStarted {
                audio_ms: value["audio_start_ms"].as_u64().unwrap_or(0),
            }),
            "input_audio_buffer.speech_stopped" => {
                let audio_ms = value["audio_end_ms"].as_u64().unwrap_or(0);
                Some(RealtimeEvent::SpeechEnded {
                    audio_ms,
                    // the provider reports only the end offset; the session
                    // layer keeps its own utterance timing
                    duration_ms: 0,
                })
            }
            "conversation.item.input_audio_transcription.completed" => {
                Some(RealtimeEvent::UserTranscript {
                    text: value["transcript"].as_str().unwrap_or_default().to_string(),
                    is_final: true,
                })
            }
            "response.created" => Some(RealtimeEvent::ResponseStarted),
            "response.audio_transcript.delta" => Some(RealtimeEvent::TextDelta {
                delta: value["delta"].as_str().unwrap_or_default().to_string(),
            }),
            "response.audio.delta" => {
                let delta = value["delta"].as_str().unwrap_or_default();
                match BASE64_STANDARD.decode(delta) {
                    Ok(audio) => Some(RealtimeEvent::AudioDelta {
                        data: Bytes::from(audio),
                        sample_rate: REALTIME_SAMPLE_RATE,
                    }),
                    Err(e) => {
                        error!("failed to decode realtime audio delta: {e}");
                        None
                    }
                }
            }
            "response.done" => Some(RealtimeEvent::ResponseDone),
            "error" => {
                let message = value["error"]["message"]
                    .as_str()
                    .unwrap_or("unknown provider error")
                    .to_string();
                let code = value["error"]["code"].as_str().unwrap_or_default();
                let err = match code {
                    "invalid_api_key" | "invalid_authentication" => ProviderError::Auth(message),
                    "rate_limit_exceeded" | "insufficient_quota" => ProviderError::Quota(message),
                    _ => ProviderError::Request(message),
                };
                Some(RealtimeEvent::Error(err))
            }
            _ => {
                debug!(kind, "unhandled realtime server event");
                None
            }
        }
    }
}

#[async_trait]
impl RealtimeVoice for OpenAiRealtime {
    async fn connect(&mut self) -> Result<mpsc::Receiver<RealtimeEvent>, ProviderError> {
        if self.connected.load(Ordering::SeqCst) {
            return Err(ProviderError::Connection("already connected".to_string()));
        }

        let url = format!("{OPENAI_REALTIME_URL}?model={}", self.model);
        let request = http::Request::builder()
            .uri(&url)
            .header("Authorization", format!("Bearer {}", self.api_key.expose()))
            .header("OpenAI-Beta", "realtime=v1")
            .header(
                "Sec-WebSocket-Key",
                tungstenite::handshake::client::generate_key(),
            )
            .header("Sec-WebSocket-Version", "13")
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Host", "api.openai.com")
            .body(())
            .map_err(|e| ProviderError::Connection(e.to_string()))?;

        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| ProviderError::Connection(e.to_string()))?;
        info!(model = %self.model, "connected to OpenAI realtime API");

        let (mut ws_sink, mut ws_source) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(WS_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel::<RealtimeEvent>(WS_CHANNEL_CAPACITY);

        self.connected.store(true, Ordering::SeqCst);
        *self.ws_sender.lock().await = Some(out_tx.clone());

        let writer = tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = ws_sink.send(Message::Text(text.into())).await {
                    warn!("realtime send failed: {e}");
                    break;
                }
            }
        });

        let connected = Arc::clone(&self.connected);
        let reader = tokio::spawn(async move {
            while let Some(message) = ws_source.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<Value>(&text) {
                        Ok(value) => {
                            if let Some(event) = Self::translate(&value)
                                && events_tx.send(event).await.is_err()
                            {
                                break;
                            }
                        }
                        Err(e) => warn!("unparseable realtime event: {e}"),
                    },
                    Ok(Message::Close(frame)) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .unwrap_or_else(|| "closed by provider".to_string());
                        let _ = events_tx.send(RealtimeEvent::Disconnected { reason }).await;
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = events_tx
                            .send(RealtimeEvent::Disconnected {
                                reason: e.to_string(),
                            })
                            .await;
                        break;
                    }
                }
            }
            connected.store(false, Ordering::SeqCst);
        });
        self.tasks.push(writer);
        self.tasks.push(reader);

        self.queue(self.session_update()).await?;
        Ok(events_rx)
    }

    async fn send_audio(&self, frame: Bytes) -> Result<(), ProviderError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ProviderError::NotConnected);
        }
        self.queue(json!({
            "type": "input_audio_buffer.append",
            "audio": BASE64_STANDARD.encode(&frame),
        }))
        .await
    }

    async fn cancel(&self) -> Result<(), ProviderError> {
        if !self.connected.load(Ordering::SeqCst) {
            // Nothing in flight; cancellation is a no-op.
            return Ok(());
        }
        self.queue(json!({"type": "response.cancel"})).await
    }

    async fn close(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        *self.ws_sender.lock().await = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    fn name(&self) -> &str {
        "openai"
    }
}
