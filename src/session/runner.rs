//! Per-session driver task.
//!
//! The runner is the single writer of turn state. It consumes client commands
//! and pipeline events from two channels, updates the session record, marks
//! latency checkpoints and emits wire messages. Nothing else mutates a live
//! session, so there is no turn-level locking anywhere.

use std::sync::Arc;

use base64::prelude::*;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::barge_in::{BargeInController, BargeInDecision};
use crate::errors::GatewayError;
use crate::latency::{Checkpoint, LatencyTracker};
use crate::mode::ModeController;
use crate::pipeline::PipelineEvent;
use crate::protocol::messages::{AUDIO_FORMAT_PCM16, MessageRoute, ServerMessage};
use crate::session::types::{Session, SessionMode, SessionStatus, Turn, epoch_millis};

/// Client-originated commands, forwarded by the connection handler.
#[derive(Debug)]
pub enum SessionCommand {
    /// Decoded audio frame
    Audio(Bytes),
    /// Explicit end of the user utterance
    EndTurn,
    /// Explicit response interrupt
    Interrupt,
    /// Client ended the session; terminal status `completed`
    End,
}

pub struct SessionRunner {
    session: Arc<Mutex<Session>>,
    controller: Arc<ModeController>,
    latency: LatencyTracker,
    barge_in: BargeInController,
    outbound: mpsc::Sender<MessageRoute>,
    commands: mpsc::Receiver<SessionCommand>,
    events: mpsc::Receiver<PipelineEvent>,
    cancel: CancellationToken,

    next_turn_number: u32,
    current_turn: Option<Turn>,
    response_in_flight: bool,
}

impl SessionRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: Arc<Mutex<Session>>,
        controller: Arc<ModeController>,
        barge_in: BargeInController,
        outbound: mpsc::Sender<MessageRoute>,
        commands: mpsc::Receiver<SessionCommand>,
        events: mpsc::Receiver<PipelineEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session,
            controller,
            latency: LatencyTracker::new(),
            barge_in,
            outbound,
            commands,
            events,
            cancel,
            next_turn_number: 1,
            current_turn: None,
            response_in_flight: false,
        }
    }

    pub async fn run(mut self) {
        let session_id = self.session.lock().id.clone();
        debug!(session_id, "session runner started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    // terminal status was set by whoever cancelled us
                    self.finish(None).await;
                    break;
                }
                command = self.commands.recv() => {
                    match command {
                        Some(SessionCommand::End) => {
                            self.finish(Some(SessionStatus::Completed)).await;
                            break;
                        }
                        Some(command) => self.handle_command(command).await,
                        None => {
                            // connection handler dropped without an explicit end
                            self.finish(Some(SessionStatus::Disconnected)).await;
                            break;
                        }
                    }
                }
                event = self.events.recv() => {
                    match event {
                        Some(event) => {
                            if self.handle_event(event).await.is_break() {
                                break;
                            }
                        }
                        None => {
                            error!(session_id, "pipeline event channel closed unexpectedly");
                            self.finish(Some(SessionStatus::Error)).await;
                            break;
                        }
                    }
                }
            }
        }
        debug!(session_id, "session runner stopped");
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Audio(frame) => {
                let pipeline = self.controller.current();
                if let Err(error) = pipeline.push_audio(frame).await {
                    if error.is_fatal() && pipeline.mode() == SessionMode::Realtime {
                        self.send_error(&GatewayError::Provider(error.to_string()))
                            .await;
                        self.perform_fallback().await;
                    } else {
                        self.send_error(&GatewayError::from(error)).await;
                    }
                }
            }
            SessionCommand::EndTurn => {
                if let Err(error) = self.controller.current().end_turn().await {
                    self.send_error(&GatewayError::from(error)).await;
                }
            }
            SessionCommand::Interrupt => {
                if self.barge_in.on_explicit_interrupt(self.response_in_flight) {
                    self.interrupt_response().await;
                }
            }
            SessionCommand::End => unreachable!("handled in the select loop"),
        }
    }

    async fn handle_event(&mut self, event: PipelineEvent) -> std::ops::ControlFlow<()> {
        match event {
            PipelineEvent::SpeechStarted => {
                match self.barge_in.on_speech_started(self.response_in_flight) {
                    BargeInDecision::Ignore => return std::ops::ControlFlow::Continue(()),
                    BargeInDecision::Interrupt => {
                        info!("barge-in: user speech cancels the in-flight response");
                        self.interrupt_response().await;
                    }
                    BargeInDecision::Continue => {}
                }
                self.send(ServerMessage::SpeechStarted {
                    timestamp: epoch_millis(),
                })
                .await;
            }
            PipelineEvent::SpeechEnded { duration_ms } => {
                let turn_number = self.next_turn_number;
                self.next_turn_number += 1;
                self.latency.mark(turn_number, Checkpoint::SpeechEnd);
                self.current_turn = Some(Turn {
                    turn_number,
                    user_transcript: None,
                    ai_response: None,
                    interrupted: false,
                    started_at: epoch_millis(),
                    ended_at: None,
                    latency: None,
                });
                self.send(ServerMessage::SpeechEnded {
                    timestamp: epoch_millis(),
                    duration_ms,
                })
                .await;
            }
            PipelineEvent::Transcript { text, is_final } => {
                let Some(turn_number) = self.current_turn.as_ref().map(|t| t.turn_number) else {
                    return std::ops::ControlFlow::Continue(());
                };
                if is_final {
                    self.latency.mark(turn_number, Checkpoint::SttDone);
                    if let Some(turn) = self.current_turn.as_mut() {
                        turn.user_transcript = Some(text.clone());
                    }
                }
                self.send(ServerMessage::Transcript {
                    text,
                    is_final,
                    confidence: None,
                })
                .await;
            }
            PipelineEvent::ResponseStarted => {
                let Some(turn_number) = self.current_turn.as_ref().map(|t| t.turn_number) else {
                    return std::ops::ControlFlow::Continue(());
                };
                self.response_in_flight = true;
                self.send(ServerMessage::ResponseStarted {
                    turn_number,
                    timestamp: epoch_millis(),
                })
                .await;
            }
            PipelineEvent::TextDelta { delta } => {
                if !self.response_in_flight {
                    return std::ops::ControlFlow::Continue(());
                }
                let Some(turn_number) = self.current_turn.as_ref().map(|t| t.turn_number) else {
                    return std::ops::ControlFlow::Continue(());
                };
                self.latency.mark(turn_number, Checkpoint::LlmFirstToken);
                if let Some(turn) = self.current_turn.as_mut() {
                    turn.ai_response.get_or_insert_default().push_str(&delta);
                }
                self.send(ServerMessage::TextDelta {
                    delta,
                    full_text: None,
                })
                .await;
            }
            PipelineEvent::Audio {
                data,
                sample_rate,
                is_final,
            } => {
                // stray audio arriving after an interrupt or turn failure
                // is dropped, never forwarded
                if !self.response_in_flight {
                    return std::ops::ControlFlow::Continue(());
                }
                if let Some(turn) = self.current_turn.as_ref()
                    && !is_final
                {
                    self.latency.mark(turn.turn_number, Checkpoint::TtsFirstByte);
                    self.latency.mark(turn.turn_number, Checkpoint::FirstAudio);
                }
                self.send(ServerMessage::AudioChunk {
                    audio: BASE64_STANDARD.encode(&data),
                    format: AUDIO_FORMAT_PCM16.to_string(),
                    sample_rate,
                    is_final,
                })
                .await;
            }
            PipelineEvent::ResponseComplete => {
                self.finalize_turn(false).await;
            }
            PipelineEvent::TurnFailed { error } => {
                let gateway_error = GatewayError::from(error);
                self.send_error(&gateway_error).await;
                self.abandon_turn();
                if !gateway_error.recoverable() {
                    self.finish(Some(SessionStatus::Error)).await;
                    return std::ops::ControlFlow::Break(());
                }
            }
            PipelineEvent::FallbackRequired { reason } => {
                warn!(%reason, "realtime pipeline requested fallback");
                self.send_error(&GatewayError::Provider(format!(
                    "realtime provider unavailable: {reason}"
                )))
                .await;
                // the swap lands on a turn boundary: a half-delivered
                // response is closed out as interrupted first, an open turn
                // with nothing promised yet is dropped
                if self.response_in_flight {
                    self.interrupt_response().await;
                } else {
                    self.abandon_turn();
                }
                self.perform_fallback().await;
            }
        }
        std::ops::ControlFlow::Continue(())
    }

    /// Cancel the in-flight response and finalize the turn as interrupted.
    async fn interrupt_response(&mut self) {
        let Some(turn_number) = self.current_turn.as_ref().map(|t| t.turn_number) else {
            return;
        };
        if let Err(error) = self.controller.current().cancel_response().await {
            warn!(%error, "cancel_response failed");
        }
        self.send(ServerMessage::Interrupted {
            turn_number,
            timestamp: epoch_millis(),
        })
        .await;
        self.finalize_turn(true).await;
    }

    /// Commit the current turn and report `response_ended`.
    async fn finalize_turn(&mut self, interrupted: bool) {
        let Some(mut turn) = self.current_turn.take() else {
            self.response_in_flight = false;
            return;
        };
        self.response_in_flight = false;

        let mode = self.session.lock().mode;
        self.latency.mark(turn.turn_number, Checkpoint::ResponseEnd);
        let record = self.latency.finalize(turn.turn_number, mode);

        turn.interrupted = interrupted;
        turn.ended_at = Some(epoch_millis());
        turn.latency = Some(record.clone());
        let turn_number = turn.turn_number;
        self.session.lock().turns.push(turn);

        self.send(ServerMessage::ResponseEnded {
            turn_number,
            latency: record.into(),
            interrupted,
        })
        .await;
    }

    /// Drop the current turn without reporting a result for it.
    fn abandon_turn(&mut self) {
        if let Some(turn) = self.current_turn.take() {
            self.latency.discard(turn.turn_number);
        }
        self.response_in_flight = false;
    }

    /// Swap the live pipeline for a cascade one and tell the client.
    async fn perform_fallback(&mut self) {
        if self.session.lock().mode == SessionMode::Cascade {
            return;
        }
        match self.controller.fall_back().await {
            Ok(()) => {
                let (session_id, config) = {
                    let mut session = self.session.lock();
                    session.mode = SessionMode::Cascade;
                    (session.id.clone(), session.config.clone())
                };
                self.send(ServerMessage::SessionStarted {
                    session_id,
                    mode: SessionMode::Cascade,
                    config,
                })
                .await;
            }
            Err(error) => {
                error!(%error, "fallback to cascade failed");
                self.send_error(&error).await;
                // the cancelled branch of the select loop runs the teardown
                self.session.lock().status = SessionStatus::Error;
                self.cancel.cancel();
            }
        }
    }

    /// Move the session to a terminal status, report the summary and close.
    async fn finish(&mut self, status: Option<SessionStatus>) {
        self.abandon_turn();
        self.controller.shutdown().await;

        let (session_id, summary, status) = {
            let mut session = self.session.lock();
            if let Some(status) = status
                && !session.status.is_terminal()
            {
                session.status = status;
            }
            if session.status == SessionStatus::Active {
                session.status = SessionStatus::Disconnected;
            }
            if session.ended_at.is_none() {
                session.ended_at = Some(epoch_millis());
            }
            (session.id.clone(), session.summary(), session.status)
        };

        info!(session_id, ?status, "session ended");
        self.send(ServerMessage::SessionEnded {
            session_id,
            summary,
            status,
        })
        .await;
        let _ = self.outbound.send(MessageRoute::Close).await;
    }

    async fn send(&self, message: ServerMessage) {
        let _ = self.outbound.send(MessageRoute::Outgoing(message)).await;
    }

    async fn send_error(&self, error: &GatewayError) {
        self.send(ServerMessage::from_error(error)).await;
    }
}
