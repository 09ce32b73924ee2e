//! Per-turn latency measurement.
//!
//! Checkpoints are recorded against a monotonic clock ([`Instant`]) and
//! reduced to a [`LatencyRecord`] when the turn finalizes. Stages that never
//! ran simply have no checkpoint and yield `None` for their metric.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::session::types::SessionMode;

/// Stage boundaries recorded per turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Checkpoint {
    /// End of user speech (VAD end-of-speech or explicit end_turn)
    SpeechEnd,
    /// Final user transcript available (cascade STT stage)
    SttDone,
    /// First streamed language-model token (cascade)
    LlmFirstToken,
    /// First synthesized audio byte (cascade TTS stage)
    TtsFirstByte,
    /// First response audio delivered to the client (either mode)
    FirstAudio,
    /// Response finished or was interrupted
    ResponseEnd,
}

/// Latency breakdown attached to a finalized turn.
///
/// `total_ms` measures speech-end to first response audio, the user-perceived
/// response delay. For cascade turns it telescopes into the three stage
/// metrics; reconciliation against their sum tolerates [`RECONCILE_TOLERANCE_MS`]
/// of transport and queueing overhead.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyRecord {
    pub total_ms: u64,
    pub stt_ms: Option<u64>,
    pub llm_ttft_ms: Option<u64>,
    pub tts_ttfb_ms: Option<u64>,
    pub realtime_ms: Option<u64>,
}

/// Allowed gap between `total_ms` and the sum of cascade stage latencies.
pub const RECONCILE_TOLERANCE_MS: u64 = 250;

impl LatencyRecord {
    /// Sum of the non-null cascade stage latencies.
    pub fn stage_sum_ms(&self) -> u64 {
        self.stt_ms.unwrap_or(0) + self.llm_ttft_ms.unwrap_or(0) + self.tts_ttfb_ms.unwrap_or(0)
    }

    /// Whether the record satisfies the reconciliation invariant.
    pub fn is_consistent(&self) -> bool {
        let sum = self.stage_sum_ms();
        self.total_ms >= sum && self.total_ms - sum <= RECONCILE_TOLERANCE_MS
    }
}

/// Records checkpoints for in-flight turns and derives latency records.
///
/// At most one turn is in flight per session, but the tracker is keyed by
/// turn number so a finalize racing a new turn's first checkpoint never
/// mixes measurements.
pub struct LatencyTracker {
    checkpoints: Mutex<HashMap<u32, HashMap<Checkpoint, Instant>>>,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self {
            checkpoints: Mutex::new(HashMap::new()),
        }
    }

    /// Record a checkpoint for a turn. First write wins; a duplicate mark
    /// (e.g. a second audio chunk) does not move the checkpoint.
    pub fn mark(&self, turn_number: u32, checkpoint: Checkpoint) {
        self.mark_at(turn_number, checkpoint, Instant::now());
    }

    /// Record a checkpoint with an explicit timestamp.
    pub fn mark_at(&self, turn_number: u32, checkpoint: Checkpoint, at: Instant) {
        self.checkpoints
            .lock()
            .entry(turn_number)
            .or_default()
            .entry(checkpoint)
            .or_insert(at);
    }

    /// Whether a checkpoint has been recorded for a turn.
    pub fn has(&self, turn_number: u32, checkpoint: Checkpoint) -> bool {
        self.checkpoints
            .lock()
            .get(&turn_number)
            .is_some_and(|m| m.contains_key(&checkpoint))
    }

    /// Reduce the turn's checkpoints to a latency record and drop them.
    ///
    /// Missing checkpoints yield `None` for the affected metric, never an
    /// error. A turn with no `SpeechEnd` mark reports zero total latency.
    pub fn finalize(&self, turn_number: u32, mode: SessionMode) -> LatencyRecord {
        let marks = self
            .checkpoints
            .lock()
            .remove(&turn_number)
            .unwrap_or_default();

        let delta = |from: Checkpoint, to: Checkpoint| -> Option<u64> {
            let (a, b) = (marks.get(&from)?, marks.get(&to)?);
            Some(b.saturating_duration_since(*a).as_millis() as u64)
        };

        // total: speech end to first audio, falling back to response end when
        // the turn produced no audio (failure or early interrupt)
        let total_ms = delta(Checkpoint::SpeechEnd, Checkpoint::FirstAudio)
            .or_else(|| delta(Checkpoint::SpeechEnd, Checkpoint::ResponseEnd))
            .unwrap_or(0);

        match mode {
            SessionMode::Cascade => LatencyRecord {
                total_ms,
                stt_ms: delta(Checkpoint::SpeechEnd, Checkpoint::SttDone),
                llm_ttft_ms: delta(Checkpoint::SttDone, Checkpoint::LlmFirstToken),
                tts_ttfb_ms: delta(Checkpoint::LlmFirstToken, Checkpoint::TtsFirstByte),
                realtime_ms: None,
            },
            SessionMode::Realtime => LatencyRecord {
                total_ms,
                stt_ms: None,
                llm_ttft_ms: None,
                tts_ttfb_ms: None,
                realtime_ms: delta(Checkpoint::SpeechEnd, Checkpoint::FirstAudio),
            },
        }
    }

    /// Discard any checkpoints for a turn without producing a record.
    pub fn discard(&self, turn_number: u32) {
        self.checkpoints.lock().remove(&turn_number);
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cascade_breakdown() {
        let tracker = LatencyTracker::new();
        let t0 = Instant::now();
        tracker.mark_at(1, Checkpoint::SpeechEnd, t0);
        tracker.mark_at(1, Checkpoint::SttDone, t0 + Duration::from_millis(120));
        tracker.mark_at(1, Checkpoint::LlmFirstToken, t0 + Duration::from_millis(300));
        tracker.mark_at(1, Checkpoint::TtsFirstByte, t0 + Duration::from_millis(450));
        tracker.mark_at(1, Checkpoint::FirstAudio, t0 + Duration::from_millis(450));
        tracker.mark_at(1, Checkpoint::ResponseEnd, t0 + Duration::from_millis(900));

        let record = tracker.finalize(1, SessionMode::Cascade);
        assert_eq!(record.stt_ms, Some(120));
        assert_eq!(record.llm_ttft_ms, Some(180));
        assert_eq!(record.tts_ttfb_ms, Some(150));
        assert_eq!(record.total_ms, 450);
        assert_eq!(record.realtime_ms, None);
        assert!(record.total_ms >= record.stage_sum_ms());
        assert!(record.is_consistent());
    }

    #[test]
    fn test_realtime_breakdown() {
        let tracker = LatencyTracker::new();
        let t0 = Instant::now();
        tracker.mark_at(3, Checkpoint::SpeechEnd, t0);
        tracker.mark_at(3, Checkpoint::FirstAudio, t0 + Duration::from_millis(380));
        tracker.mark_at(3, Checkpoint::ResponseEnd, t0 + Duration::from_millis(2_000));

        let record = tracker.finalize(3, SessionMode::Realtime);
        assert_eq!(record.realtime_ms, Some(380));
        assert_eq!(record.total_ms, 380);
        assert_eq!(record.stt_ms, None);
        assert_eq!(record.llm_ttft_ms, None);
        assert_eq!(record.tts_ttfb_ms, None);
    }

    #[test]
    fn test_missing_checkpoints_yield_none() {
        let tracker = LatencyTracker::new();
        let t0 = Instant::now();
        tracker.mark_at(2, Checkpoint::SpeechEnd, t0);
        tracker.mark_at(2, Checkpoint::ResponseEnd, t0 + Duration::from_millis(50));

        let record = tracker.finalize(2, SessionMode::Cascade);
        assert_eq!(record.stt_ms, None);
        assert_eq!(record.llm_ttft_ms, None);
        assert_eq!(record.tts_ttfb_ms, None);
        // fell back to response end
        assert_eq!(record.total_ms, 50);
    }

    #[test]
    fn test_first_mark_wins() {
        let tracker = LatencyTracker::new();
        let t0 = Instant::now();
        tracker.mark_at(1, Checkpoint::SpeechEnd, t0);
        tracker.mark_at(1, Checkpoint::FirstAudio, t0 + Duration::from_millis(100));
        tracker.mark_at(1, Checkpoint::FirstAudio, t0 + Duration::from_millis(900));

        let record = tracker.finalize(1, SessionMode::Realtime);
        assert_eq!(record.total_ms, 100);
    }

    #[test]
    fn test_finalize_unknown_turn() {
        let tracker = LatencyTracker::new();
        let record = tracker.finalize(42, SessionMode::Cascade);
        assert_eq!(record.total_ms, 0);
        assert_eq!(record.stt_ms, None);
    }

    #[test]
    fn test_turns_are_isolated() {
        let tracker = LatencyTracker::new();
        let t0 = Instant::now();
        tracker.mark_at(1, Checkpoint::SpeechEnd, t0);
        tracker.mark_at(2, Checkpoint::SpeechEnd, t0 + Duration::from_millis(500));
        tracker.mark_at(2, Checkpoint::FirstAudio, t0 + Duration::from_millis(600));
        tracker.discard(1);

        let record = tracker.finalize(2, SessionMode::Realtime);
        assert_eq!(record.total_ms, 100);
        assert!(!tracker.has(1, Checkpoint::SpeechEnd));
    }
}
