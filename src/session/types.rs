//! Session and turn records.

use serde::{Deserialize, Serialize};

use crate::latency::LatencyRecord;

/// Execution mode for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// Direct speech-to-speech passthrough to a realtime provider
    Realtime,
    /// Chained speech-to-text, language-model, text-to-speech pipeline
    Cascade,
}

impl std::fmt::Display for SessionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionMode::Realtime => write!(f, "realtime"),
            SessionMode::Cascade => write!(f, "cascade"),
        }
    }
}

/// Session lifecycle status. Every state other than `Active` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Live conversation
    Active,
    /// Ended by a client `end_session`
    Completed,
    /// Transport closed unexpectedly, or displaced by a newer session
    Disconnected,
    /// Unrecoverable pipeline or provider fault
    Error,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Active)
    }
}

/// Provider selection for a session. Realtime sessions use the `provider` /
/// `model` / `voice` fields; cascade sessions use the `stt_` / `llm_` / `tts_`
/// triple. Unset fields fall back to server defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionProviderConfig {
    /// Realtime provider (e.g. "openai", "simulated")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// Realtime model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Realtime output voice
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    /// Speech-to-text provider for cascade mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stt_provider: Option<String>,

    /// Language-model provider for cascade mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_provider: Option<String>,

    /// Language model name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_model: Option<String>,

    /// Text-to-speech provider for cascade mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tts_provider: Option<String>,

    /// Text-to-speech voice
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tts_voice: Option<String>,

    /// Label for the human participant (e.g. "customer")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_role: Option<String>,

    /// Label for the AI participant (e.g. "support agent")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_role: Option<String>,

    /// Free-form scenario context injected into the system prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario_context: Option<String>,
}

/// One live conversation.
#[derive(Debug, Clone)]
pub struct Session {
    /// Session id (UUID v4)
    pub id: String,
    /// Owning user id
    pub user_id: String,
    /// Currently effective mode. Fallback rewrites this to `Cascade`.
    pub mode: SessionMode,
    /// Effective provider configuration
    pub config: SessionProviderConfig,
    /// Role label for the human participant
    pub user_role: String,
    /// Role label for the AI participant
    pub ai_role: String,
    /// Scenario context text, if any
    pub scenario_context: Option<String>,
    /// Whether voice activity during playback interrupts the response
    pub barge_in_enabled: bool,
    /// Lifecycle status; terminal once it leaves `Active`
    pub status: SessionStatus,
    /// Unix epoch millis
    pub started_at: u64,
    /// Unix epoch millis, set when the status turns terminal
    pub ended_at: Option<u64>,
    /// Committed turns, in order
    pub turns: Vec<Turn>,
}

impl Session {
    /// Summary statistics reported in `session_ended`.
    pub fn summary(&self) -> SessionSummary {
        let turns = self.turns.len() as u32;
        let interrupted_turns = self.turns.iter().filter(|t| t.interrupted).count() as u32;
        let totals: Vec<u64> = self
            .turns
            .iter()
            .filter_map(|t| t.latency.as_ref().map(|l| l.total_ms))
            .collect();
        let avg_total_latency_ms = if totals.is_empty() {
            None
        } else {
            Some(totals.iter().sum::<u64>() / totals.len() as u64)
        };
        SessionSummary {
            turns,
            interrupted_turns,
            avg_total_latency_ms,
        }
    }
}

/// One user-utterance-plus-AI-response exchange.
#[derive(Debug, Clone)]
pub struct Turn {
    /// 1-based, strictly increasing within the session
    pub turn_number: u32,
    /// Final user transcript, once the STT stage (or provider) reports it
    pub user_transcript: Option<String>,
    /// Accumulated AI response text
    pub ai_response: Option<String>,
    /// Set when barge-in or an explicit interrupt cut the response short
    pub interrupted: bool,
    /// Unix epoch millis; never earlier than the session start
    pub started_at: u64,
    /// Unix epoch millis
    pub ended_at: Option<u64>,
    /// Latency breakdown, attached at finalization
    pub latency: Option<LatencyRecord>,
}

/// Counts reported in the `session_ended` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub turns: u32,
    pub interrupted_turns: u32,
    pub avg_total_latency_ms: Option<u64>,
}

/// Current wall-clock time in unix epoch milliseconds.
pub fn epoch_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
