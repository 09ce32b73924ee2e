//! Provider capability traits and factories.
//!
//! Providers are consumed as abstract capabilities: cascade sessions use the
//! speech-to-text / language-model / text-to-speech triple, realtime sessions
//! use a single bidirectional speech-to-speech provider. Concrete SDK details
//! stay behind these traits; the session layer never sees them.

pub mod credentials;
pub mod openai;
pub mod openai_realtime;
pub mod simulated;

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::errors::{ErrorCode, GatewayError, GatewayResult};
pub use credentials::{CredentialStore, SecretString};

/// Errors surfaced by provider implementations.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Credentials rejected by the provider
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// Quota or rate limit exhausted on the provider side
    #[error("quota exceeded: {0}")]
    Quota(String),

    /// Could not establish or keep the provider connection
    #[error("connection failed: {0}")]
    Connection(String),

    /// Request was sent but the provider reported a failure
    #[error("request failed: {0}")]
    Request(String),

    /// The provider answered with something we could not parse
    #[error("unexpected response: {0}")]
    InvalidResponse(String),

    /// The stage-level timeout expired
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Operation attempted without a live connection
    #[error("provider is not connected")]
    NotConnected,
}

impl ProviderError {
    /// Wire code this error maps to.
    pub fn code(&self) -> ErrorCode {
        match self {
            ProviderError::Auth(_) => ErrorCode::AuthFailed,
            ProviderError::Quota(_) => ErrorCode::QuotaExceeded,
            _ => ErrorCode::ProviderError,
        }
    }

    /// Whether a realtime pipeline should abandon the provider and ask for
    /// fallback instead of retrying on the next turn.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProviderError::Auth(_) | ProviderError::Quota(_) | ProviderError::Connection(_)
        )
    }
}

impl From<ProviderError> for GatewayError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Auth(msg) => GatewayError::AuthFailed(msg),
            ProviderError::Quota(msg) => GatewayError::QuotaExceeded(msg),
            other => GatewayError::Provider(other.to_string()),
        }
    }
}

/// Result of a speech-to-text invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcription {
    pub text: String,
    pub confidence: Option<f32>,
}

/// One prior exchange handed to the language model.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

/// Speaker role in the conversation history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

/// Streamed language-model tokens.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

/// Streamed synthesized audio bytes.
pub type AudioStream = Pin<Box<dyn Stream<Item = Result<Bytes, ProviderError>> + Send>>;

/// Batch speech-to-text capability.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Transcribe one buffered utterance (PCM16, 16 kHz, mono).
    async fn transcribe(&self, audio: Bytes) -> Result<Transcription, ProviderError>;

    fn name(&self) -> &str;
}

/// Streaming language-model capability.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Generate a streamed response to the latest user message, given the
    /// system prompt and prior history (which already ends with that message).
    async fn generate(
        &self,
        system_prompt: &str,
        history: &[ChatTurn],
    ) -> Result<TokenStream, ProviderError>;

    fn name(&self) -> &str;
}

/// Text-to-speech capability, streaming where the provider supports it.
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    /// Synthesize one text fragment. Non-streaming providers yield the whole
    /// clip as a single item; its full duration is charged to TTFB.
    async fn synthesize(&self, text: &str) -> Result<AudioStream, ProviderError>;

    /// Whether audio arrives incrementally.
    fn supports_streaming(&self) -> bool;

    /// Sample rate of the produced PCM16 audio.
    fn sample_rate(&self) -> u32;

    fn name(&self) -> &str;
}

/// Events emitted by a realtime speech-to-speech provider.
#[derive(Debug)]
pub enum RealtimeEvent {
    /// Provider VAD: user speech began
    SpeechStarted { audio_ms: u64 },
    /// Provider VAD: user speech ended
    SpeechEnded { audio_ms: u64, duration_ms: u64 },
    /// Transcript of the user utterance
    UserTranscript { text: String, is_final: bool },
    /// Response generation began
    ResponseStarted,
    /// Streamed response text
    TextDelta { delta: String },
    /// Streamed response audio (PCM16)
    AudioDelta { data: Bytes, sample_rate: u32 },
    /// Response finished
    ResponseDone,
    /// Provider-side failure
    Error(ProviderError),
    /// The provider connection dropped
    Disconnected { reason: String },
}

/// Bidirectional speech-to-speech capability.
#[async_trait]
pub trait RealtimeVoice: Send + Sync {
    /// Establish the provider connection and hand back its event stream.
    async fn connect(&mut self) -> Result<mpsc::Receiver<RealtimeEvent>, ProviderError>;

    /// Forward one captured audio frame, essentially verbatim.
    async fn send_audio(&self, frame: Bytes) -> Result<(), ProviderError>;

    /// Cancel the in-flight response via the provider's native primitive.
    /// Idempotent when nothing is in flight.
    async fn cancel(&self) -> Result<(), ProviderError>;

    /// Tear down the connection.
    async fn close(&mut self);

    fn name(&self) -> &str;
}

/// Shared handles the factories need to build a provider.
#[derive(Clone)]
pub struct ProviderContext {
    pub http: reqwest::Client,
    pub credentials: Arc<CredentialStore>,
    /// Bound applied to each provider stage call
    pub stage_timeout: Duration,
}

impl ProviderContext {
    fn resolve_key(&self, user_id: &str, provider: &str) -> GatewayResult<SecretString> {
        self.credentials.resolve(user_id, provider).ok_or_else(|| {
            GatewayError::AuthFailed(format!("no credentials available for provider {provider}"))
        })
    }
}

/// Build a speech-to-text provider by name.
pub fn create_stt(
    ctx: &ProviderContext,
    user_id: &str,
    provider: &str,
    model: Option<&str>,
) -> GatewayResult<Arc<dyn SpeechToText>> {
    match provider {
        "openai" => {
            let key = ctx.resolve_key(user_id, "openai")?;
            Ok(Arc::new(openai::OpenAiStt::new(
                ctx.http.clone(),
                key,
                model.map(str::to_string),
            )))
        }
        "simulated" => Ok(Arc::new(simulated::SimulatedStt::default())),
        other => Err(GatewayError::InvalidMode(format!(
            "unsupported stt provider: {other}. Supported providers: openai, simulated"
        ))),
    }
}

/// Build a language-model provider by name.
pub fn create_llm(
    ctx: &ProviderContext,
    user_id: &str,
    provider: &str,
    model: Option<&str>,
) -> GatewayResult<Arc<dyn LanguageModel>> {
    match provider {
        "openai" => {
            let key = ctx.resolve_key(user_id, "openai")?;
            Ok(Arc::new(openai::OpenAiLlm::new(
                ctx.http.clone(),
                key,
                model.map(str::to_string),
            )))
        }
        "simulated" => Ok(Arc::new(simulated::SimulatedLlm::default())),
        other => Err(GatewayError::InvalidMode(format!(
            "unsupported llm provider: {other}. Supported providers: openai, simulated"
        ))),
    }
}

/// Build a text-to-speech provider by name.
pub fn create_tts(
    ctx: &ProviderContext,
    user_id: &str,
    provider: &str,
    voice: Option<&str>,
) -> GatewayResult<Arc<dyn TextToSpeech>> {
    match provider {
        "openai" => {
            let key = ctx.resolve_key(user_id, "openai")?;
            Ok(Arc::new(openai::OpenAiTts::new(
                ctx.http.clone(),
                key,
                voice.map(str::to_string),
            )))
        }
        "simulated" => Ok(Arc::new(simulated::SimulatedTts::from_voice_hint(voice))),
        other => Err(GatewayError::InvalidMode(format!(
            "unsupported tts provider: {other}. Supported providers: openai, simulated"
        ))),
    }
}

/// Build a realtime speech-to-speech provider by name.
///
/// `simulated-offline` always fails to connect and `simulated-flaky` drops
/// mid-response; they exist to exercise the connect-time and mid-session
/// realtime-to-cascade fallback paths without a real outage.
pub fn create_realtime(
    ctx: &ProviderContext,
    user_id: &str,
    provider: &str,
    model: Option<&str>,
    voice: Option<&str>,
    instructions: Option<&str>,
) -> GatewayResult<Box<dyn RealtimeVoice>> {
    match provider {
        "openai" => {
            let key = ctx.resolve_key(user_id, "openai")?;
            Ok(Box::new(openai_realtime::OpenAiRealtime::new(
                key,
                model.map(str::to_string),
                voice.map(str::to_string),
                instructions.map(str::to_string),
            )))
        }
        "simulated" => Ok(Box::new(simulated::SimulatedRealtime::new(false))),
        "simulated-offline" => Ok(Box::new(simulated::SimulatedRealtime::new(true))),
        "simulated-flaky" => Ok(Box::new(simulated::SimulatedRealtime::flaky())),
        other => Err(GatewayError::InvalidMode(format!(
            "unsupported realtime provider: {other}. Supported providers: openai, simulated"
        ))),
    }
}
