//! Voice pipeline abstraction.
//!
//! A pipeline turns inbound audio frames into a stream of [`PipelineEvent`]s.
//! Both execution modes sit behind [`VoicePipeline`], so the session runner
//! and the fallback logic never care which one is live.

pub mod cascade;
pub mod realtime;
pub mod vad;

use async_trait::async_trait;
use bytes::Bytes;

use crate::providers::ProviderError;
use crate::session::types::SessionMode;

pub use cascade::CascadePipeline;
pub use realtime::RealtimePipeline;

/// Events flowing from a pipeline to the session runner.
///
/// The runner is the only consumer; it owns turn state and translates these
/// into wire messages. Pipelines never talk to the transport directly.
#[derive(Debug)]
pub enum PipelineEvent {
    /// User speech detected (VAD or provider-side)
    SpeechStarted,
    /// User speech ended; a turn begins
    SpeechEnded { duration_ms: u64 },
    /// User transcript, possibly partial
    Transcript { text: String, is_final: bool },
    /// Response generation began
    ResponseStarted,
    /// Streamed response text
    TextDelta { delta: String },
    /// Streamed response audio (PCM16). An empty frame with `is_final` set
    /// marks the end of the response audio.
    Audio {
        data: Bytes,
        sample_rate: u32,
        is_final: bool,
    },
    /// The response ran to natural completion
    ResponseComplete,
    /// The turn failed; session continues, turn is abandoned
    TurnFailed { error: ProviderError },
    /// The pipeline is no longer viable and the session should switch to a
    /// cascade pipeline at the next turn boundary
    FallbackRequired { reason: String },
}

/// A live voice pipeline bound to one session.
///
/// Constructed with an event sender; all output flows through it. Methods are
/// called only by the session runner, serially.
#[async_trait]
pub trait VoicePipeline: Send + Sync {
    /// Which mode this pipeline implements.
    fn mode(&self) -> SessionMode;

    /// Feed one captured audio frame (PCM16, 16 kHz, mono).
    async fn push_audio(&self, frame: Bytes) -> Result<(), ProviderError>;

    /// Client signalled end of the utterance explicitly.
    async fn end_turn(&self) -> Result<(), ProviderError>;

    /// Stop the in-flight response. Idempotent; a no-op when nothing is in
    /// flight. Audio already emitted is not recalled.
    async fn cancel_response(&self) -> Result<(), ProviderError>;

    /// Tear down provider connections and background tasks.
    async fn shutdown(&self);
}
