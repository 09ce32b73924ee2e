//! Deterministic in-process providers.
//!
//! These back offline operation and the integration suite: fixed transcript,
//! scripted token stream, sine-tone audio, and a realtime provider that runs
//! a miniature speech-detect/respond loop entirely locally. Timing hints are
//! taken from the configured voice so tests can stretch the playback window
//! without touching provider code.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, mpsc};
use tokio::time::timeout;
use tracing::debug;

use super::{
    AudioStream, ChatRole, ChatTurn, LanguageModel, ProviderError, RealtimeEvent, RealtimeVoice,
    SpeechToText, TextToSpeech, TokenStream, Transcription,
};

const SIMULATED_SAMPLE_RATE: u32 = 16_000;

/// Bytes per millisecond of PCM16 mono at 16 kHz.
const BYTES_PER_MS: u64 = 32;

/// Generate `ms` milliseconds of a 330 Hz sine tone as PCM16.
pub fn tone_pcm16(ms: u64) -> Bytes {
    let samples = (SIMULATED_SAMPLE_RATE as u64 * ms / 1000) as usize;
    let mut out = Vec::with_capacity(samples * 2);
    for i in 0..samples {
        let t = i as f32 / SIMULATED_SAMPLE_RATE as f32;
        let v = (t * 330.0 * 2.0 * std::f32::consts::PI).sin();
        let sample = (v * 12_000.0) as i16;
        out.extend_from_slice(&sample.to_le_bytes());
    }
    Bytes::from(out)
}

// =============================================================================
// Speech-to-Text
// =============================================================================

/// Fixed-transcript STT with a small processing delay.
pub struct SimulatedStt {
    delay: Duration,
}

impl Default for SimulatedStt {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(15),
        }
    }
}

#[async_trait]
impl SpeechToText for SimulatedStt {
    async fn transcribe(&self, audio: Bytes) -> Result<Transcription, ProviderError> {
        if audio.is_empty() {
            return Err(ProviderError::Request("empty utterance".to_string()));
        }
        tokio::time::sleep(self.delay).await;
        let duration_ms = audio.len() as u64 / BYTES_PER_MS;
        Ok(Transcription {
            text: format!("simulated utterance of {duration_ms} ms"),
            confidence: Some(0.93),
        })
    }

    fn name(&self) -> &str {
        "simulated"
    }
}

// =============================================================================
// Language Model
// =============================================================================

/// Scripted token stream with per-token delays.
pub struct SimulatedLlm {
    token_delay: Duration,
}

impl Default for SimulatedLlm {
    fn default() -> Self {
        Self {
            token_delay: Duration::from_millis(4),
        }
    }
}

#[async_trait]
impl LanguageModel for SimulatedLlm {
    async fn generate(
        &self,
        _system_prompt: &str,
        history: &[ChatTurn],
    ) -> Result<TokenStream, ProviderError> {
        let exchange = history
            .iter()
            .filter(|t| t.role == ChatRole::User)
            .count();
        let reply = format!("This is simulated reply number {exchange}. How can I help further? ");
        let tokens: Vec<String> = reply.split_inclusive(' ').map(str::to_string).collect();
        let delay = self.token_delay;

        Ok(Box::pin(async_stream::stream! {
            for token in tokens {
                tokio::time::sleep(delay).await;
                yield Ok(token);
            }
        }))
    }

    fn name(&self) -> &str {
        "simulated"
    }
}

// =============================================================================
// Text-to-Speech
// =============================================================================

/// Sine-tone TTS. The voice hint tunes pacing: `slow` stretches the clip so
/// tests can interrupt mid-playback, `single-shot` disables streaming and
/// yields the whole clip as one buffer.
pub struct SimulatedTts {
    chunk_count: usize,
    chunk_delay: Duration,
    streaming: bool,
}

impl Default for SimulatedTts {
    fn default() -> Self {
        Self {
            chunk_count: 6,
            chunk_delay: Duration::from_millis(5),
            streaming: true,
        }
    }
}

impl SimulatedTts {
    pub fn from_voice_hint(voice: Option<&str>) -> Self {
        match voice {
            Some("slow") => Self {
                chunk_count: 30,
                chunk_delay: Duration::from_millis(40),
                streaming: true,
            },
            Some("single-shot") => Self {
                streaming: false,
                ..Default::default()
            },
            _ => Self::default(),
        }
    }
}

#[async_trait]
impl TextToSpeech for SimulatedTts {
    async fn synthesize(&self, text: &str) -> Result<AudioStream, ProviderError> {
        if text.trim().is_empty() {
            return Err(ProviderError::Request("empty synthesis text".to_string()));
        }
        let chunk_count = self.chunk_count;
        let chunk_delay = self.chunk_delay;

        if !self.streaming {
            // One blocking clip; the whole wait lands in TTFB.
            tokio::time::sleep(chunk_delay * chunk_count as u32).await;
            let clip = tone_pcm16(20 * chunk_count as u64);
            return Ok(Box::pin(async_stream::stream! {
                yield Ok(clip);
            }));
        }

        Ok(Box::pin(async_stream::stream! {
            for _ in 0..chunk_count {
                tokio::time::sleep(chunk_delay).await;
                yield Ok(tone_pcm16(20));
            }
        }))
    }

    fn supports_streaming(&self) -> bool {
        self.streaming
    }

    fn sample_rate(&self) -> u32 {
        SIMULATED_SAMPLE_RATE
    }

    fn name(&self) -> &str {
        "simulated"
    }
}

// =============================================================================
// Realtime
// =============================================================================

/// How long the utterance loop waits after the last frame before declaring
/// end of speech.
const SILENCE_WINDOW: Duration = Duration::from_millis(60);

/// Local speech-to-speech provider: detects utterances by frame arrival,
/// then streams a scripted transcript, text deltas and tone audio back.
pub struct SimulatedRealtime {
    /// When set, `connect` always fails; exercises the fallback path.
    offline: bool,
    /// When set, the connection drops partway through the first response;
    /// exercises mid-session fallback.
    fail_mid_response: bool,
    connected: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    frames_tx: mpsc::Sender<Bytes>,
    frames_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
}

impl SimulatedRealtime {
    pub fn new(offline: bool) -> Self {
        let (frames_tx, frames_rx) = mpsc::channel(64);
        Self {
            offline,
            fail_mid_response: false,
            connected: Arc::new(AtomicBool::new(false)),
            cancelled: Arc::new(AtomicBool::new(false)),
            frames_tx,
            frames_rx: Mutex::new(Some(frames_rx)),
        }
    }

    /// A provider that connects fine but loses its connection while the
    /// first response is streaming.
    pub fn flaky() -> Self {
        let mut provider = Self::new(false);
        provider.fail_mid_response = true;
        provider
    }

    async fn run(
        mut frames: mpsc::Receiver<Bytes>,
        events: mpsc::Sender<RealtimeEvent>,
        cancelled: Arc<AtomicBool>,
        connected: Arc<AtomicBool>,
        fail_mid_response: bool,
    ) {
        let mut clock_ms: u64 = 0;
        loop {
            // Wait for the first frame of an utterance.
            let Some(frame) = frames.recv().await else {
                break;
            };
            let mut received_ms = frame.len() as u64 / BYTES_PER_MS;
            let speech_start = clock_ms;
            if events
                .send(RealtimeEvent::SpeechStarted {
                    audio_ms: speech_start,
                })
                .await
                .is_err()
            {
                break;
            }

            // Drain frames until a silence window elapses.
            loop {
                match timeout(SILENCE_WINDOW, frames.recv()).await {
                    Ok(Some(frame)) => received_ms += frame.len() as u64 / BYTES_PER_MS,
                    Ok(None) => return,
                    Err(_) => break,
                }
            }
            clock_ms += received_ms;
            let sent = events
                .send(RealtimeEvent::SpeechEnded {
                    audio_ms: clock_ms,
                    duration_ms: received_ms,
                })
                .await;
            if sent.is_err() {
                break;
            }

            cancelled.store(false, Ordering::SeqCst);
            let _ = events
                .send(RealtimeEvent::UserTranscript {
                    text: format!("simulated speech of {received_ms} ms"),
                    is_final: true,
                })
                .await;
            let _ = events.send(RealtimeEvent::ResponseStarted).await;

            let mut finished = true;
            for token in ["I ", "hear ", "you ", "loud and clear. "] {
                tokio::time::sleep(Duration::from_millis(4)).await;
                if cancelled.load(Ordering::SeqCst)
                    || events
                        .send(RealtimeEvent::TextDelta {
                            delta: token.to_string(),
                        })
                        .await
                        .is_err()
                {
                    finished = false;
                    break;
                }
            }
            if finished {
                for chunk in 0..6 {
                    tokio::time::sleep(Duration::from_millis(8)).await;
                    if cancelled.load(Ordering::SeqCst) {
                        debug!("simulated realtime response cancelled mid-stream");
                        break;
                    }
                    if fail_mid_response && chunk == 2 {
                        debug!("simulated realtime connection dropping mid-response");
                        let _ = events
                            .send(RealtimeEvent::Disconnected {
                                reason: "simulated connection drop".to_string(),
                            })
                            .await;
                        connected.store(false, Ordering::SeqCst);
                        return;
                    }
                    if events
                        .send(RealtimeEvent::AudioDelta {
                            data: tone_pcm16(20),
                            sample_rate: SIMULATED_SAMPLE_RATE,
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
            if events.send(RealtimeEvent::ResponseDone).await.is_err() {
                break;
            }
        }
        connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl RealtimeVoice for SimulatedRealtime {
    async fn connect(&mut self) -> Result<mpsc::Receiver<RealtimeEvent>, ProviderError> {
        if self.offline {
            return Err(ProviderError::Connection(
                "simulated realtime provider is offline".to_string(),
            ));
        }
        let frames = self
            .frames_rx
            .lock()
            .await
            .take()
            .ok_or(ProviderError::Connection("already connected".to_string()))?;
        let (events_tx, events_rx) = mpsc::channel(256);
        self.connected.store(true, Ordering::SeqCst);
        tokio::spawn(Self::run(
            frames,
            events_tx,
            Arc::clone(&self.cancelled),
            Arc::clone(&self.connected),
            self.fail_mid_response,
        ));
        Ok(events_rx)
    }

    async fn send_audio(&self, frame: Bytes) -> Result<(), ProviderError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ProviderError::NotConnected);
        }
        self.frames_tx
            .send(frame)
            .await
            .map_err(|_| ProviderError::Connection("frame channel closed".to_string()))
    }

    async fn cancel(&self) -> Result<(), ProviderError> {
        // Harmless when nothing is in flight.
        self.cancelled.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn name(&self) -> &str {
        "simulated"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_stt_reports_duration() {
        let stt = SimulatedStt::default();
        let result = stt.transcribe(tone_pcm16(100)).await.expect("transcribe");
        assert_eq!(result.text, "simulated utterance of 100 ms");
        assert!(result.confidence.unwrap() > 0.9);
    }

    #[tokio::test]
    async fn test_stt_rejects_empty_audio() {
        let stt = SimulatedStt::default();
        assert!(stt.transcribe(Bytes::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_llm_streams_tokens() {
        let llm = SimulatedLlm::default();
        let history = vec![ChatTurn {
            role: ChatRole::User,
            content: "hello".to_string(),
        }];
        let stream = llm.generate("be brief", &history).await.expect("generate");
        let tokens: Vec<String> = stream.map(|t| t.expect("token")).collect().await;
        assert!(!tokens.is_empty());
        assert!(tokens.concat().contains("simulated reply number 1"));
    }

    #[tokio::test]
    async fn test_tts_streams_pcm() {
        let tts = SimulatedTts::default();
        assert!(tts.supports_streaming());
        let stream = tts.synthesize("hello there").await.expect("synthesize");
        let chunks: Vec<Bytes> = stream.map(|c| c.expect("chunk")).collect().await;
        assert_eq!(chunks.len(), 6);
        // 20 ms of PCM16 @ 16 kHz
        assert_eq!(chunks[0].len(), 640);
    }

    #[tokio::test]
    async fn test_tts_single_shot() {
        let tts = SimulatedTts::from_voice_hint(Some("single-shot"));
        assert!(!tts.supports_streaming());
        let stream = tts.synthesize("hello").await.expect("synthesize");
        let chunks: Vec<Bytes> = stream.map(|c| c.expect("chunk")).collect().await;
        assert_eq!(chunks.len(), 1);
    }

    #[tokio::test]
    async fn test_realtime_full_turn() {
        let mut provider = SimulatedRealtime::new(false);
        let mut events = provider.connect().await.expect("connect");
        provider.send_audio(tone_pcm16(100)).await.expect("audio");

        let mut saw_speech_started = false;
        let mut saw_speech_ended = false;
        let mut audio_chunks = 0;
        let mut done = false;
        while let Some(event) = events.recv().await {
            match event {
                RealtimeEvent::SpeechStarted { .. } => saw_speech_started = true,
                RealtimeEvent::SpeechEnded { duration_ms, .. } => {
                    saw_speech_ended = true;
                    assert_eq!(duration_ms, 100);
                }
                RealtimeEvent::AudioDelta { .. } => audio_chunks += 1,
                RealtimeEvent::ResponseDone => {
                    done = true;
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_speech_started && saw_speech_ended && done);
        assert_eq!(audio_chunks, 6);
    }

    #[tokio::test]
    async fn test_realtime_offline_fails_connect() {
        let mut provider = SimulatedRealtime::new(true);
        let err = provider.connect().await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_realtime_flaky_drops_mid_response() {
        let mut provider = SimulatedRealtime::flaky();
        let mut events = provider.connect().await.expect("connect");
        provider.send_audio(tone_pcm16(100)).await.expect("audio");

        let mut audio_chunks = 0;
        let mut disconnected = false;
        while let Some(event) = events.recv().await {
            match event {
                RealtimeEvent::AudioDelta { .. } => audio_chunks += 1,
                RealtimeEvent::ResponseDone => panic!("response must not complete"),
                RealtimeEvent::Disconnected { .. } => {
                    disconnected = true;
                    break;
                }
                _ => {}
            }
        }
        assert!(disconnected);
        assert!(audio_chunks > 0 && audio_chunks < 6);
    }

    #[tokio::test]
    async fn test_realtime_cancel_stops_audio() {
        let mut provider = SimulatedRealtime::new(false);
        let mut events = provider.connect().await.expect("connect");
        provider.send_audio(tone_pcm16(100)).await.expect("audio");

        let mut audio_chunks = 0;
        while let Some(event) = events.recv().await {
            match event {
                RealtimeEvent::AudioDelta { .. } => {
                    audio_chunks += 1;
                    if audio_chunks == 1 {
                        provider.cancel().await.expect("cancel");
                    }
                }
                RealtimeEvent::ResponseDone => break,
                _ => {}
            }
        }
        assert!(audio_chunks < 6, "cancel should cut the stream short");
    }
}
