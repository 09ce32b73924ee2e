//! End-to-End Session Flow Tests
//!
//! Drives complete conversation turns through the session engine with the
//! deterministic in-process providers, asserting the message sequence a
//! client would observe on the wire and the latency invariants of the
//! per-turn reports.

use std::io::Write;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use voxbench_gateway::ServerConfig;
use voxbench_gateway::protocol::messages::{LatencyReport, MessageRoute, ServerMessage};
use voxbench_gateway::providers::simulated::tone_pcm16;
use voxbench_gateway::session::{
    SessionCommand, SessionManager, SessionMode, SessionRequest, SessionStatus,
};
use voxbench_gateway::session::types::SessionProviderConfig;

/// Build a manager wired entirely to the simulated providers.
fn simulated_manager() -> (SessionManager, tempfile::NamedTempFile) {
    let mut file = tempfile::NamedTempFile::new().expect("temp config");
    file.write_all(
        b"default_stt_provider: simulated\n\
          default_llm_provider: simulated\n\
          default_tts_provider: simulated\n\
          default_realtime_provider: simulated\n",
    )
    .expect("write config");
    let config = ServerConfig::from_file(file.path()).expect("config");
    (SessionManager::new(&config), file)
}

fn request(mode: SessionMode, config: SessionProviderConfig) -> SessionRequest {
    SessionRequest {
        user_id: "tester".to_string(),
        mode,
        config,
        system_prompt: None,
        barge_in_enabled: true,
    }
}

/// Receive the next outgoing message, panicking on close or timeout.
async fn next_message(rx: &mut mpsc::Receiver<MessageRoute>) -> ServerMessage {
    let route = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("message timeout")
        .expect("channel closed");
    match route {
        MessageRoute::Outgoing(msg) => msg,
        MessageRoute::Close => panic!("connection closed unexpectedly"),
    }
}

/// Drain messages until `response_ended`, returning everything seen since
/// the call, the ended message last.
async fn collect_until_response_ended(rx: &mut mpsc::Receiver<MessageRoute>) -> Vec<ServerMessage> {
    let mut seen = Vec::new();
    loop {
        let msg = next_message(rx).await;
        let done = matches!(msg, ServerMessage::ResponseEnded { .. });
        seen.push(msg);
        if done {
            return seen;
        }
    }
}

/// Feed an utterance as 20 ms frames, the way a capture client would.
async fn send_utterance(handle: &voxbench_gateway::session::SessionHandle, ms: u64) {
    let frames = ms / 20;
    for _ in 0..frames {
        assert!(handle.command(SessionCommand::Audio(tone_pcm16(20))).await);
    }
}

fn latency_of(msg: &ServerMessage) -> (&LatencyReport, bool) {
    match msg {
        ServerMessage::ResponseEnded {
            latency,
            interrupted,
            ..
        } => (latency, *interrupted),
        other => panic!("expected response_ended, got {other:?}"),
    }
}

#[tokio::test]
async fn test_cascade_turn_message_sequence_and_latency() {
    let (manager, _config) = simulated_manager();
    let (tx, mut rx) = mpsc::channel(256);
    let handle = manager
        .start_session(request(SessionMode::Cascade, SessionProviderConfig::default()), tx)
        .await
        .expect("start");

    match next_message(&mut rx).await {
        ServerMessage::SessionStarted { mode, .. } => assert_eq!(mode, SessionMode::Cascade),
        other => panic!("expected session_started, got {other:?}"),
    }

    send_utterance(&handle, 200).await;
    assert!(handle.command(SessionCommand::EndTurn).await);

    let messages = collect_until_response_ended(&mut rx).await;

    // the stages of the turn appear in conversational order
    let position = |pred: fn(&ServerMessage) -> bool| {
        messages
            .iter()
            .position(pred)
            .unwrap_or_else(|| panic!("missing expected message in {messages:?}"))
    };
    let speech_started = position(|m| matches!(m, ServerMessage::SpeechStarted { .. }));
    let speech_ended = position(|m| matches!(m, ServerMessage::SpeechEnded { .. }));
    let transcript = position(|m| matches!(m, ServerMessage::Transcript { is_final: true, .. }));
    let response_started = position(|m| matches!(m, ServerMessage::ResponseStarted { .. }));
    let first_audio = position(|m| matches!(m, ServerMessage::AudioChunk { is_final: false, .. }));
    assert!(speech_started < speech_ended);
    assert!(speech_ended < transcript);
    assert!(transcript < response_started);
    assert!(response_started < first_audio);

    match &messages[transcript] {
        ServerMessage::Transcript { text, .. } => assert!(text.contains("simulated utterance")),
        _ => unreachable!(),
    }
    match &messages[first_audio] {
        ServerMessage::AudioChunk {
            format,
            sample_rate,
            audio,
            ..
        } => {
            assert_eq!(format, "pcm16");
            assert_eq!(*sample_rate, 16_000);
            assert!(!audio.is_empty());
        }
        _ => unreachable!(),
    }

    // text deltas stream alongside the audio
    assert!(
        messages
            .iter()
            .any(|m| matches!(m, ServerMessage::TextDelta { .. }))
    );

    // the final audio chunk marks end of response audio
    assert!(
        messages
            .iter()
            .any(|m| matches!(m, ServerMessage::AudioChunk { is_final: true, .. }))
    );

    let (latency, interrupted) = latency_of(messages.last().expect("non-empty"));
    assert!(!interrupted);
    assert!(latency.stt_ms.is_some());
    assert!(latency.llm_ttft_ms.is_some());
    assert!(latency.tts_ttfb_ms.is_some());
    assert!(latency.realtime_ms.is_none());
    // total covers the stage sum, allowing queueing overhead
    let stage_sum =
        latency.stt_ms.unwrap() + latency.llm_ttft_ms.unwrap() + latency.tts_ttfb_ms.unwrap();
    assert!(latency.total_ms >= stage_sum);
    assert!(latency.total_ms - stage_sum < 250);

    assert!(handle.command(SessionCommand::End).await);
}

#[tokio::test]
async fn test_cascade_turns_are_numbered_sequentially() {
    let (manager, _config) = simulated_manager();
    let (tx, mut rx) = mpsc::channel(256);
    let handle = manager
        .start_session(request(SessionMode::Cascade, SessionProviderConfig::default()), tx)
        .await
        .expect("start");
    next_message(&mut rx).await; // session_started

    for expected_turn in 1..=2u32 {
        send_utterance(&handle, 200).await;
        assert!(handle.command(SessionCommand::EndTurn).await);
        let messages = collect_until_response_ended(&mut rx).await;
        match messages.last() {
            Some(ServerMessage::ResponseEnded { turn_number, .. }) => {
                assert_eq!(*turn_number, expected_turn);
            }
            other => panic!("expected response_ended, got {other:?}"),
        }
    }

    // the session summary counts both turns
    assert!(handle.command(SessionCommand::End).await);
    loop {
        match next_message(&mut rx).await {
            ServerMessage::SessionEnded {
                summary, status, ..
            } => {
                assert_eq!(status, SessionStatus::Completed);
                assert_eq!(summary.turns, 2);
                assert_eq!(summary.interrupted_turns, 0);
                break;
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn test_realtime_turn_reports_single_latency() {
    let (manager, _config) = simulated_manager();
    let (tx, mut rx) = mpsc::channel(256);
    let handle = manager
        .start_session(request(SessionMode::Realtime, SessionProviderConfig::default()), tx)
        .await
        .expect("start");

    match next_message(&mut rx).await {
        ServerMessage::SessionStarted { mode, .. } => assert_eq!(mode, SessionMode::Realtime),
        other => panic!("expected session_started, got {other:?}"),
    }

    // the simulated realtime provider ends the utterance on its own after a
    // silence window, no end_turn needed
    assert!(handle.command(SessionCommand::Audio(tone_pcm16(100))).await);

    let messages = collect_until_response_ended(&mut rx).await;
    assert!(
        messages
            .iter()
            .any(|m| matches!(m, ServerMessage::SpeechEnded { .. }))
    );
    assert!(
        messages
            .iter()
            .any(|m| matches!(m, ServerMessage::AudioChunk { is_final: false, .. }))
    );

    let (latency, interrupted) = latency_of(messages.last().expect("non-empty"));
    assert!(!interrupted);
    assert!(latency.realtime_ms.is_some());
    assert_eq!(latency.stt_ms, None);
    assert_eq!(latency.llm_ttft_ms, None);
    assert_eq!(latency.tts_ttfb_ms, None);
    assert_eq!(latency.total_ms, latency.realtime_ms.unwrap());

    assert!(handle.command(SessionCommand::End).await);
}

#[tokio::test]
async fn test_explicit_interrupt_cuts_response_short() {
    let (manager, _config) = simulated_manager();
    let (tx, mut rx) = mpsc::channel(256);
    // slow voice stretches playback so the interrupt lands mid-response
    let config = SessionProviderConfig {
        tts_voice: Some("slow".to_string()),
        ..Default::default()
    };
    let handle = manager
        .start_session(request(SessionMode::Cascade, config), tx)
        .await
        .expect("start");
    next_message(&mut rx).await; // session_started

    send_utterance(&handle, 200).await;
    assert!(handle.command(SessionCommand::EndTurn).await);

    // wait for playback to begin, then cut it off
    loop {
        if matches!(
            next_message(&mut rx).await,
            ServerMessage::AudioChunk { is_final: false, .. }
        ) {
            break;
        }
    }
    assert!(handle.command(SessionCommand::Interrupt).await);

    let mut saw_interrupted = false;
    loop {
        match next_message(&mut rx).await {
            ServerMessage::Interrupted { turn_number, .. } => {
                assert_eq!(turn_number, 1);
                saw_interrupted = true;
            }
            ServerMessage::ResponseEnded { interrupted, .. } => {
                assert!(interrupted);
                break;
            }
            _ => {}
        }
    }
    assert!(saw_interrupted);

    assert!(handle.command(SessionCommand::End).await);
}

#[tokio::test]
async fn test_barge_in_speech_interrupts_playback() {
    let (manager, _config) = simulated_manager();
    let (tx, mut rx) = mpsc::channel(256);
    let config = SessionProviderConfig {
        tts_voice: Some("slow".to_string()),
        ..Default::default()
    };
    let handle = manager
        .start_session(request(SessionMode::Cascade, config), tx)
        .await
        .expect("start");
    next_message(&mut rx).await; // session_started

    send_utterance(&handle, 200).await;
    assert!(handle.command(SessionCommand::EndTurn).await);
    loop {
        if matches!(
            next_message(&mut rx).await,
            ServerMessage::AudioChunk { is_final: false, .. }
        ) {
            break;
        }
    }

    // the user talks over the response
    send_utterance(&handle, 200).await;
    assert!(handle.command(SessionCommand::EndTurn).await);

    // the in-flight turn ends as interrupted with its audio cut off, and the
    // overlapping speech opens the next turn with the next number
    let mut saw_interrupted = false;
    let mut saw_interrupted_end = false;
    loop {
        match next_message(&mut rx).await {
            ServerMessage::Interrupted { turn_number, .. } => {
                assert_eq!(turn_number, 1);
                saw_interrupted = true;
            }
            ServerMessage::AudioChunk { .. } if saw_interrupted => {
                panic!("audio for the interrupted turn arrived after the interrupt");
            }
            ServerMessage::ResponseEnded {
                turn_number,
                interrupted,
                ..
            } => {
                assert_eq!(turn_number, 1);
                assert!(saw_interrupted, "response_ended before the interrupt notice");
                assert!(interrupted);
                saw_interrupted_end = true;
            }
            ServerMessage::ResponseStarted { turn_number, .. } => {
                assert!(saw_interrupted_end);
                assert_eq!(turn_number, 2);
                break;
            }
            _ => {}
        }
    }

    assert!(handle.command(SessionCommand::End).await);
}

#[tokio::test]
async fn test_barge_in_disabled_lets_response_finish() {
    let (manager, _config) = simulated_manager();
    let (tx, mut rx) = mpsc::channel(256);
    let config = SessionProviderConfig {
        tts_voice: Some("slow".to_string()),
        ..Default::default()
    };
    let mut req = request(SessionMode::Cascade, config);
    req.barge_in_enabled = false;
    let handle = manager.start_session(req, tx).await.expect("start");
    next_message(&mut rx).await; // session_started

    send_utterance(&handle, 200).await;
    assert!(handle.command(SessionCommand::EndTurn).await);
    loop {
        if matches!(
            next_message(&mut rx).await,
            ServerMessage::AudioChunk { is_final: false, .. }
        ) {
            break;
        }
    }

    // overlapping speech is ignored; the first response plays to completion
    // and only then does the second utterance open its own turn
    send_utterance(&handle, 200).await;
    assert!(handle.command(SessionCommand::EndTurn).await);

    let mut saw_first_end = false;
    loop {
        match next_message(&mut rx).await {
            ServerMessage::Interrupted { .. } => panic!("barge-in should be ignored"),
            ServerMessage::ResponseEnded {
                turn_number,
                interrupted,
                ..
            } if !saw_first_end => {
                assert_eq!(turn_number, 1);
                assert!(!interrupted);
                saw_first_end = true;
            }
            ServerMessage::ResponseStarted { turn_number, .. } => {
                assert!(
                    saw_first_end,
                    "second turn started before the first response ended"
                );
                assert_eq!(turn_number, 2);
            }
            ServerMessage::ResponseEnded {
                turn_number,
                interrupted,
                ..
            } => {
                assert_eq!(turn_number, 2);
                assert!(!interrupted);
                break;
            }
            _ => {}
        }
    }

    assert!(handle.command(SessionCommand::End).await);
}

#[tokio::test]
async fn test_realtime_drop_mid_session_falls_back_to_cascade() {
    let (manager, _config) = simulated_manager();
    let (tx, mut rx) = mpsc::channel(256);
    // this provider loses its connection while the first response streams
    let config = SessionProviderConfig {
        provider: Some("simulated-flaky".to_string()),
        ..Default::default()
    };
    let handle = manager
        .start_session(request(SessionMode::Realtime, config), tx)
        .await
        .expect("start");
    match next_message(&mut rx).await {
        ServerMessage::SessionStarted { mode, .. } => assert_eq!(mode, SessionMode::Realtime),
        other => panic!("expected session_started, got {other:?}"),
    }

    assert!(handle.command(SessionCommand::Audio(tone_pcm16(100))).await);

    // the half-delivered turn is closed out as interrupted, then the session
    // is re-announced on the cascade stack under the same id
    let mut saw_error = false;
    let mut saw_interrupted_end = false;
    loop {
        match next_message(&mut rx).await {
            ServerMessage::Error { recoverable, .. } => {
                assert!(recoverable);
                saw_error = true;
            }
            ServerMessage::ResponseEnded {
                turn_number,
                interrupted,
                ..
            } => {
                assert_eq!(turn_number, 1);
                assert!(interrupted);
                saw_interrupted_end = true;
            }
            ServerMessage::SessionStarted {
                session_id, mode, ..
            } => {
                assert_eq!(session_id, handle.id);
                assert_eq!(mode, SessionMode::Cascade);
                break;
            }
            _ => {}
        }
    }
    assert!(saw_error);
    assert!(saw_interrupted_end);

    // the next turn runs through the cascade stages
    send_utterance(&handle, 200).await;
    assert!(handle.command(SessionCommand::EndTurn).await);
    let messages = collect_until_response_ended(&mut rx).await;
    match messages.last() {
        Some(ServerMessage::ResponseEnded { turn_number, .. }) => assert_eq!(*turn_number, 2),
        other => panic!("expected response_ended, got {other:?}"),
    }
    let (latency, interrupted) = latency_of(messages.last().expect("non-empty"));
    assert!(!interrupted);
    assert!(latency.stt_ms.is_some());
    assert!(latency.realtime_ms.is_none());

    assert!(handle.command(SessionCommand::End).await);
}

#[tokio::test]
async fn test_session_end_reports_summary_and_closes() {
    let (manager, _config) = simulated_manager();
    let (tx, mut rx) = mpsc::channel(256);
    let handle = manager
        .start_session(request(SessionMode::Cascade, SessionProviderConfig::default()), tx)
        .await
        .expect("start");
    next_message(&mut rx).await; // session_started

    assert!(handle.command(SessionCommand::End).await);

    let mut saw_ended = false;
    loop {
        let route = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("message timeout")
            .expect("channel closed");
        match route {
            MessageRoute::Outgoing(ServerMessage::SessionEnded {
                session_id, status, ..
            }) => {
                assert_eq!(session_id, handle.id);
                assert_eq!(status, SessionStatus::Completed);
                saw_ended = true;
            }
            MessageRoute::Close => break,
            _ => {}
        }
    }
    assert!(saw_ended, "session_ended must precede the close");
    assert_eq!(handle.status(), SessionStatus::Completed);
}
