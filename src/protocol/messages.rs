//! Wire protocol message types.
//!
//! The protocol is a tagged-union JSON exchange over a persistent WebSocket.
//! Audio rides inside `audio_chunk` messages as base64-encoded PCM16, 16 kHz,
//! mono, little-endian.

use serde::{Deserialize, Serialize};

use crate::errors::ErrorCode;
use crate::latency::LatencyRecord;
use crate::session::types::{SessionMode, SessionProviderConfig, SessionStatus, SessionSummary};

/// Maximum allowed size for a single protocol message (64 KB).
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Inbound audio-chunk rate ceiling, per connection.
pub const MAX_AUDIO_CHUNKS_PER_SEC: usize = 20;

/// Idle-session timeout: 30 minutes without traffic in either direction.
pub const IDLE_TIMEOUT_SECS: u64 = 30 * 60;

/// Wire audio format identifier for PCM 16-bit little-endian.
pub const AUDIO_FORMAT_PCM16: &str = "pcm16";

/// Client sample rate: PCM16 at 16 kHz mono.
pub const CLIENT_SAMPLE_RATE: u32 = 16_000;

// =============================================================================
// Incoming Messages (Client -> Server)
// =============================================================================

/// Incoming WebSocket messages from the client.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Open a session in the requested mode
    StartSession {
        mode: SessionMode,
        #[serde(default)]
        config: SessionProviderConfig,
        /// Explicit system prompt; overrides the scenario-derived one
        #[serde(default)]
        system_prompt: Option<String>,
        /// Scenario template reference, resolved by the platform layer
        #[serde(default)]
        template_id: Option<String>,
        /// Defaults to the server-wide barge-in setting
        #[serde(default)]
        barge_in_enabled: Option<bool>,
    },

    /// One frame of captured audio (base64 PCM16, 16 kHz, mono)
    AudioChunk {
        audio: String,
        #[serde(default)]
        timestamp: Option<u64>,
    },

    /// Explicit end of the user utterance (manual turn detection)
    EndTurn {},

    /// Explicit request to cut off the in-flight response
    Interrupt {},

    /// End the session, reporting it as completed
    EndSession {},

    /// Heartbeat
    Ping { timestamp: u64 },
}

// =============================================================================
// Outgoing Messages (Server -> Client)
// =============================================================================

/// Outgoing WebSocket messages to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once when the connection is accepted
    ConnectionReady { server_time: u64 },

    /// Session is live; re-sent with the effective configuration after a
    /// mode fallback
    SessionStarted {
        session_id: String,
        mode: SessionMode,
        config: SessionProviderConfig,
    },

    /// Voice activity: user speech began
    SpeechStarted { timestamp: u64 },

    /// Voice activity: user speech ended
    SpeechEnded { timestamp: u64, duration_ms: u64 },

    /// User transcript (partial or final)
    Transcript {
        text: String,
        is_final: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        confidence: Option<f32>,
    },

    /// AI response generation began for a turn
    ResponseStarted { turn_number: u32, timestamp: u64 },

    /// One chunk of synthesized response audio, in generation order
    AudioChunk {
        audio: String,
        format: String,
        sample_rate: u32,
        is_final: bool,
    },

    /// Streamed response text
    TextDelta {
        delta: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        full_text: Option<String>,
    },

    /// Turn finished; carries the latency breakdown
    ResponseEnded {
        turn_number: u32,
        latency: LatencyReport,
        interrupted: bool,
    },

    /// The in-flight response was cut off; stop playback immediately
    Interrupted { turn_number: u32, timestamp: u64 },

    /// Session reached a terminal status
    SessionEnded {
        session_id: String,
        summary: SessionSummary,
        status: SessionStatus,
    },

    /// Error report; `recoverable = false` precedes a connection close
    Error {
        code: ErrorCode,
        message: String,
        recoverable: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
    },

    /// Heartbeat reply
    Pong {
        client_timestamp: u64,
        server_timestamp: u64,
    },
}

impl ServerMessage {
    /// Build an `error` message from an engine error.
    pub fn from_error(err: &crate::errors::GatewayError) -> Self {
        ServerMessage::Error {
            code: err.code(),
            message: err.to_string(),
            recoverable: err.recoverable(),
            details: None,
        }
    }
}

/// Latency fields of `response_ended`. Mode-inapplicable stages serialize as
/// explicit nulls so clients can distinguish "not measured" from "omitted".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyReport {
    pub total_ms: u64,
    pub stt_ms: Option<u64>,
    pub llm_ttft_ms: Option<u64>,
    pub tts_ttfb_ms: Option<u64>,
    pub realtime_ms: Option<u64>,
}

impl From<LatencyRecord> for LatencyReport {
    fn from(record: LatencyRecord) -> Self {
        LatencyReport {
            total_ms: record.total_ms,
            stt_ms: record.stt_ms,
            llm_ttft_ms: record.llm_ttft_ms,
            tts_ttfb_ms: record.tts_ttfb_ms,
            realtime_ms: record.realtime_ms,
        }
    }
}

/// Message routing for the WebSocket sender task.
#[derive(Debug)]
pub enum MessageRoute {
    /// JSON text message
    Outgoing(ServerMessage),
    /// Close the connection after draining
    Close,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_session_deserialization() {
        let json = r#"{
            "type": "start_session",
            "mode": "cascade",
            "config": {
                "stt_provider": "simulated",
                "llm_provider": "simulated",
                "tts_provider": "simulated",
                "ai_role": "barista"
            },
            "barge_in_enabled": true
        }"#;

        let msg: ClientMessage = serde_json::from_str(json).expect("should deserialize");
        match msg {
            ClientMessage::StartSession {
                mode,
                config,
                barge_in_enabled,
                ..
            } => {
                assert_eq!(mode, SessionMode::Cascade);
                assert_eq!(config.stt_provider.as_deref(), Some("simulated"));
                assert_eq!(config.ai_role.as_deref(), Some("barista"));
                assert_eq!(barge_in_enabled, Some(true));
            }
            other => panic!("expected StartSession, got {other:?}"),
        }
    }

    #[test]
    fn test_start_session_minimal() {
        let json = r#"{"type": "start_session", "mode": "realtime"}"#;
        let msg: ClientMessage = serde_json::from_str(json).expect("should deserialize");
        match msg {
            ClientMessage::StartSession { mode, config, .. } => {
                assert_eq!(mode, SessionMode::Realtime);
                assert_eq!(config, SessionProviderConfig::default());
            }
            other => panic!("expected StartSession, got {other:?}"),
        }
    }

    #[test]
    fn test_audio_chunk_deserialization() {
        let json = r#"{"type": "audio_chunk", "audio": "AAAA", "timestamp": 123}"#;
        let msg: ClientMessage = serde_json::from_str(json).expect("should deserialize");
        match msg {
            ClientMessage::AudioChunk { audio, timestamp } => {
                assert_eq!(audio, "AAAA");
                assert_eq!(timestamp, Some(123));
            }
            other => panic!("expected AudioChunk, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_body_messages() {
        for json in [
            r#"{"type": "end_turn"}"#,
            r#"{"type": "interrupt"}"#,
            r#"{"type": "end_session"}"#,
        ] {
            serde_json::from_str::<ClientMessage>(json).expect("should deserialize");
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        let json = r#"{"type": "bogus"}"#;
        assert!(serde_json::from_str::<ClientMessage>(json).is_err());
    }

    #[test]
    fn test_response_ended_serializes_null_stages() {
        let msg = ServerMessage::ResponseEnded {
            turn_number: 1,
            latency: LatencyReport {
                total_ms: 420,
                realtime_ms: Some(420),
                ..Default::default()
            },
            interrupted: false,
        };
        let json = serde_json::to_string(&msg).expect("should serialize");
        assert!(json.contains(r#""type":"response_ended""#));
        assert!(json.contains(r#""stt_ms":null"#));
        assert!(json.contains(r#""llm_ttft_ms":null"#));
        assert!(json.contains(r#""tts_ttfb_ms":null"#));
        assert!(json.contains(r#""realtime_ms":420"#));
    }

    #[test]
    fn test_error_serialization() {
        let msg = ServerMessage::Error {
            code: ErrorCode::ProviderError,
            message: "stt stage timed out".to_string(),
            recoverable: true,
            details: None,
        };
        let json = serde_json::to_string(&msg).expect("should serialize");
        assert!(json.contains(r#""code":"PROVIDER_ERROR""#));
        assert!(json.contains(r#""recoverable":true"#));
        assert!(!json.contains("details"));
    }

    #[test]
    fn test_session_started_serialization() {
        let msg = ServerMessage::SessionStarted {
            session_id: "sess-1".to_string(),
            mode: SessionMode::Cascade,
            config: SessionProviderConfig {
                stt_provider: Some("openai".to_string()),
                ..Default::default()
            },
        };
        let json = serde_json::to_string(&msg).expect("should serialize");
        assert!(json.contains(r#""mode":"cascade""#));
        assert!(json.contains(r#""stt_provider":"openai""#));
        // unset config fields stay off the wire entirely
        assert!(!json.contains("tts_voice"));
    }

    #[test]
    fn test_interrupted_roundtrip() {
        let msg = ServerMessage::Interrupted {
            turn_number: 2,
            timestamp: 99,
        };
        let json = serde_json::to_string(&msg).expect("should serialize");
        let back: ServerMessage = serde_json::from_str(&json).expect("should deserialize");
        match back {
            ServerMessage::Interrupted {
                turn_number,
                timestamp,
            } => {
                assert_eq!(turn_number, 2);
                assert_eq!(timestamp, 99);
            }
            other => panic!("expected Interrupted, got {other:?}"),
        }
    }
}
