//! Chained speech-to-text, language-model, text-to-speech pipeline.
//!
//! Inbound audio is buffered per utterance; end-of-speech (VAD or explicit)
//! closes the buffer and kicks off a response task. The response task runs
//! the three stages with the language model and synthesis overlapped:
//! completed sentences are handed to a synthesis task over a bounded channel
//! while tokens are still streaming.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::vad::{BYTES_PER_MS, EnergyVad, VadConfig};
use super::{PipelineEvent, VoicePipeline};
use crate::providers::{
    ChatRole, ChatTurn, LanguageModel, ProviderError, SpeechToText, TextToSpeech,
};
use crate::session::types::SessionMode;

/// Sentences queued for synthesis while tokens are still streaming.
const SYNTHESIS_QUEUE_DEPTH: usize = 8;

/// A sentence fragment longer than this many bytes is synthesized without
/// waiting for terminal punctuation.
const MAX_FRAGMENT_BYTES: usize = 200;

pub struct CascadePipeline {
    stt: Arc<dyn SpeechToText>,
    llm: Arc<dyn LanguageModel>,
    tts: Arc<dyn TextToSpeech>,
    events: mpsc::Sender<PipelineEvent>,
    system_prompt: String,
    /// Conversation history, shared with whoever owned the previous pipeline
    /// so a mode switch carries context across.
    history: Arc<Mutex<Vec<ChatTurn>>>,
    stage_timeout: Duration,
    vad: Mutex<EnergyVad>,
    utterance: Mutex<BytesMut>,
    /// Cancellation for the response task currently executing, if any
    active_turn: Arc<Mutex<Option<CancellationToken>>>,
    /// Handle of the most recently queued response task; a new turn chains
    /// behind it instead of displacing it
    last_response: Mutex<Option<JoinHandle<()>>>,
    /// Parent of every per-turn token; cancelled on shutdown
    shutdown: CancellationToken,
}

impl CascadePipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stt: Arc<dyn SpeechToText>,
        llm: Arc<dyn LanguageModel>,
        tts: Arc<dyn TextToSpeech>,
        events: mpsc::Sender<PipelineEvent>,
        system_prompt: String,
        history: Arc<Mutex<Vec<ChatTurn>>>,
        stage_timeout: Duration,
        vad_config: VadConfig,
    ) -> Self {
        Self {
            stt,
            llm,
            tts,
            events,
            system_prompt,
            history,
            stage_timeout,
            vad: Mutex::new(EnergyVad::new(vad_config)),
            utterance: Mutex::new(BytesMut::new()),
            active_turn: Arc::new(Mutex::new(None)),
            last_response: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Close the utterance buffer and queue the response task for it.
    ///
    /// A response still in flight is never displaced here: the new turn
    /// waits behind it, and whether the old response gets cut off is the
    /// session runner's barge-in decision, applied through
    /// [`cancel_response`](VoicePipeline::cancel_response).
    fn commit_utterance(&self, duration_ms: u64) {
        let audio = {
            let mut buffer = self.utterance.lock();
            if buffer.is_empty() {
                return;
            }
            buffer.split().freeze()
        };

        let task = RespondTask {
            stt: Arc::clone(&self.stt),
            llm: Arc::clone(&self.llm),
            tts: Arc::clone(&self.tts),
            events: self.events.clone(),
            system_prompt: self.system_prompt.clone(),
            history: Arc::clone(&self.history),
            stage_timeout: self.stage_timeout,
            cancel: self.shutdown.child_token(),
        };
        let previous = self.last_response.lock().take();
        let active = Arc::clone(&self.active_turn);
        let handle = tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            *active.lock() = Some(task.cancel.clone());
            task.run(audio, duration_ms).await;
        });
        *self.last_response.lock() = Some(handle);
    }
}

#[async_trait]
impl VoicePipeline for CascadePipeline {
    fn mode(&self) -> SessionMode {
        SessionMode::Cascade
    }

    async fn push_audio(&self, frame: Bytes) -> Result<(), ProviderError> {
        let result = {
            let mut vad = self.vad.lock();
            let result = vad.process(&frame);
            if vad.is_active() || result.speech_end {
                self.utterance.lock().extend_from_slice(&frame);
            }
            result
        };

        if result.speech_start {
            let _ = self.events.send(PipelineEvent::SpeechStarted).await;
        }
        if result.speech_end {
            self.commit_utterance(result.utterance_ms);
        }
        Ok(())
    }

    async fn end_turn(&self) -> Result<(), ProviderError> {
        let flushed = self.vad.lock().flush();
        let duration_ms = match flushed {
            Some(ms) => ms,
            // utterance never crossed the VAD threshold; use the raw buffer
            None => self.utterance.lock().len() as u64 / BYTES_PER_MS,
        };
        self.commit_utterance(duration_ms);
        Ok(())
    }

    async fn cancel_response(&self) -> Result<(), ProviderError> {
        if let Some(token) = self.active_turn.lock().take() {
            token.cancel();
        }
        Ok(())
    }

    async fn shutdown(&self) {
        // cancels the executing response and any turns queued behind it
        self.shutdown.cancel();
    }
}

/// State captured for one response, run to completion on its own task.
struct RespondTask {
    stt: Arc<dyn SpeechToText>,
    llm: Arc<dyn LanguageModel>,
    tts: Arc<dyn TextToSpeech>,
    events: mpsc::Sender<PipelineEvent>,
    system_prompt: String,
    history: Arc<Mutex<Vec<ChatTurn>>>,
    stage_timeout: Duration,
    cancel: CancellationToken,
}

impl RespondTask {
    async fn run(self, audio: Bytes, duration_ms: u64) {
        if self.cancel.is_cancelled() {
            return;
        }
        // speech-end is announced here, not at commit time, so a turn that
        // queued behind an earlier response only opens once that response
        // has been finalized
        let _ = self
            .events
            .send(PipelineEvent::SpeechEnded { duration_ms })
            .await;
        if let Err(error) = self.respond(audio).await {
            warn!(%error, "cascade turn failed");
            let _ = self.events.send(PipelineEvent::TurnFailed { error }).await;
        }
    }

    async fn stage<T>(
        &self,
        fut: impl Future<Output = Result<T, ProviderError>>,
    ) -> Result<T, ProviderError> {
        match tokio::time::timeout(self.stage_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(self.stage_timeout)),
        }
    }

    async fn respond(&self, audio: Bytes) -> Result<(), ProviderError> {
        let transcription = self.stage(self.stt.transcribe(audio)).await?;
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        debug!(text = %transcription.text, "utterance transcribed");
        let _ = self
            .events
            .send(PipelineEvent::Transcript {
                text: transcription.text.clone(),
                is_final: true,
            })
            .await;
        self.history.lock().push(ChatTurn {
            role: ChatRole::User,
            content: transcription.text,
        });

        let history_snapshot = self.history.lock().clone();
        let mut tokens = self
            .stage(self.llm.generate(&self.system_prompt, &history_snapshot))
            .await?;
        let _ = self.events.send(PipelineEvent::ResponseStarted).await;

        // synthesis consumes completed sentences while tokens keep streaming
        let (sentence_tx, sentence_rx) = mpsc::channel::<String>(SYNTHESIS_QUEUE_DEPTH);
        let synthesis = tokio::spawn(
            SynthesisTask {
                tts: Arc::clone(&self.tts),
                events: self.events.clone(),
                cancel: self.cancel.clone(),
                stage_timeout: self.stage_timeout,
            }
            .run(sentence_rx),
        );

        let mut response_text = String::new();
        let mut fragment = String::new();
        let mut stream_error = None;
        loop {
            let token = tokio::select! {
                _ = self.cancel.cancelled() => break,
                token = tokens.next() => token,
            };
            let token = match token {
                Some(Ok(token)) => token,
                Some(Err(error)) => {
                    stream_error = Some(error);
                    break;
                }
                None => break,
            };
            response_text.push_str(&token);
            let _ = self
                .events
                .send(PipelineEvent::TextDelta { delta: token.clone() })
                .await;

            fragment.push_str(&token);
            while let Some(sentence) = take_sentence(&mut fragment) {
                if sentence_tx.send(sentence).await.is_err() {
                    break;
                }
            }
        }
        let tail = fragment.trim().to_string();
        if !tail.is_empty() && stream_error.is_none() && !self.cancel.is_cancelled() {
            let _ = sentence_tx.send(tail).await;
        }
        drop(sentence_tx);

        let synthesis_result = synthesis.await.unwrap_or(Ok(()));

        // partial responses still enter the history so the next turn sees
        // what the user actually heard
        if !response_text.is_empty() {
            self.history.lock().push(ChatTurn {
                role: ChatRole::Assistant,
                content: response_text,
            });
        }

        if let Some(error) = stream_error {
            return Err(error);
        }
        synthesis_result?;

        if !self.cancel.is_cancelled() {
            let _ = self.events.send(PipelineEvent::ResponseComplete).await;
        }
        Ok(())
    }
}

/// Streams synthesized audio for each queued sentence.
struct SynthesisTask {
    tts: Arc<dyn TextToSpeech>,
    events: mpsc::Sender<PipelineEvent>,
    cancel: CancellationToken,
    stage_timeout: Duration,
}

impl SynthesisTask {
    async fn run(self, mut sentences: mpsc::Receiver<String>) -> Result<(), ProviderError> {
        let sample_rate = self.tts.sample_rate();
        while let Some(sentence) = sentences.recv().await {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            let mut audio =
                match tokio::time::timeout(self.stage_timeout, self.tts.synthesize(&sentence))
                    .await
                {
                    Ok(result) => result?,
                    Err(_) => return Err(ProviderError::Timeout(self.stage_timeout)),
                };
            loop {
                let chunk = tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(()),
                    chunk = audio.next() => chunk,
                };
                match chunk {
                    Some(Ok(data)) => {
                        let _ = self
                            .events
                            .send(PipelineEvent::Audio {
                                data,
                                sample_rate,
                                is_final: false,
                            })
                            .await;
                    }
                    Some(Err(error)) => return Err(error),
                    None => break,
                }
            }
        }
        if !self.cancel.is_cancelled() {
            let _ = self
                .events
                .send(PipelineEvent::Audio {
                    data: Bytes::new(),
                    sample_rate,
                    is_final: true,
                })
                .await;
        }
        Ok(())
    }
}

/// Pop the first complete sentence off the fragment buffer, if any. Fragments
/// past [`MAX_FRAGMENT_BYTES`] are cut at the last whitespace so synthesis is
/// never starved by a run-on response.
fn take_sentence(fragment: &mut String) -> Option<String> {
    if let Some(pos) = fragment.find(['.', '!', '?']) {
        let boundary = fragment
            .char_indices()
            .find(|(i, _)| *i > pos)
            .map_or(fragment.len(), |(i, _)| i);
        let sentence = fragment[..boundary].trim().to_string();
        fragment.drain(..boundary);
        if sentence.is_empty() {
            return take_sentence(fragment);
        }
        return Some(sentence);
    }
    if fragment.len() > MAX_FRAGMENT_BYTES {
        // the byte limit can land inside a multibyte character; back up to
        // the nearest boundary before slicing
        let mut limit = MAX_FRAGMENT_BYTES;
        while !fragment.is_char_boundary(limit) {
            limit -= 1;
        }
        let cut = fragment[..limit].rfind(char::is_whitespace).unwrap_or(limit);
        let sentence = fragment[..cut].trim().to_string();
        fragment.drain(..cut);
        if !sentence.is_empty() {
            return Some(sentence);
        }
    }
    None
}
