//! Energy-based voice activity detection.
//!
//! Classifies PCM16 frames by RMS energy and runs a four-state machine with
//! confirmation windows on both edges, so a cough does not start a turn and a
//! breath pause does not end one.

use tracing::debug;

/// Bytes of PCM16 mono audio per millisecond at 16 kHz.
pub const BYTES_PER_MS: u64 = 32;

#[derive(Debug, Clone)]
pub struct VadConfig {
    /// RMS amplitude above which a frame counts as speech (0..=32767 scale)
    pub energy_threshold: f64,
    /// Speech must persist this long before a speech-start fires
    pub min_speech_ms: u64,
    /// Silence must persist this long before a speech-end fires
    pub min_silence_ms: u64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            energy_threshold: 500.0,
            min_speech_ms: 100,
            min_silence_ms: 600,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VadState {
    Silence,
    PotentialSpeech,
    Speech,
    PotentialSilence,
}

/// Edge transitions reported for one processed frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VadResult {
    pub speech_start: bool,
    pub speech_end: bool,
    /// Length of the utterance that just ended, set with `speech_end`
    pub utterance_ms: u64,
}

pub struct EnergyVad {
    config: VadConfig,
    state: VadState,
    /// Consecutive milliseconds of speech-classified audio
    speech_ms: u64,
    /// Consecutive milliseconds of silence-classified audio
    silence_ms: u64,
    /// Milliseconds of audio in the current utterance, pauses included
    utterance_ms: u64,
}

/// RMS amplitude of a PCM16 little-endian frame.
pub fn rms_amplitude(frame: &[u8]) -> f64 {
    let samples = frame.len() / 2;
    if samples == 0 {
        return 0.0;
    }
    let sum: f64 = frame
        .chunks_exact(2)
        .map(|pair| {
            let value = i16::from_le_bytes([pair[0], pair[1]]) as f64;
            value * value
        })
        .sum();
    (sum / samples as f64).sqrt()
}

impl EnergyVad {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            state: VadState::Silence,
            speech_ms: 0,
            silence_ms: 0,
            utterance_ms: 0,
        }
    }

    /// Classify one frame and advance the state machine.
    pub fn process(&mut self, frame: &[u8]) -> VadResult {
        let frame_ms = frame.len() as u64 / BYTES_PER_MS;
        let is_speech_frame = rms_amplitude(frame) >= self.config.energy_threshold;

        if is_speech_frame {
            self.speech_ms += frame_ms;
            self.silence_ms = 0;
        } else {
            self.silence_ms += frame_ms;
            self.speech_ms = 0;
        }
        if self.state != VadState::Silence {
            self.utterance_ms += frame_ms;
        }

        let mut result = VadResult::default();
        self.state = match self.state {
            VadState::Silence => {
                if is_speech_frame {
                    self.utterance_ms = frame_ms;
                    if self.speech_ms >= self.config.min_speech_ms {
                        result.speech_start = true;
                        debug!(speech_ms = self.speech_ms, "speech started");
                        VadState::Speech
                    } else {
                        VadState::PotentialSpeech
                    }
                } else {
                    VadState::Silence
                }
            }
            VadState::PotentialSpeech => {
                if is_speech_frame {
                    if self.speech_ms >= self.config.min_speech_ms {
                        result.speech_start = true;
                        debug!(speech_ms = self.speech_ms, "speech confirmed");
                        VadState::Speech
                    } else {
                        VadState::PotentialSpeech
                    }
                } else {
                    // too short to count as speech
                    self.utterance_ms = 0;
                    VadState::Silence
                }
            }
            VadState::Speech => {
                if is_speech_frame {
                    VadState::Speech
                } else if self.silence_ms >= self.config.min_silence_ms {
                    result.speech_end = true;
                    result.utterance_ms = self.utterance_ms.saturating_sub(self.silence_ms);
                    debug!(utterance_ms = result.utterance_ms, "speech ended");
                    self.utterance_ms = 0;
                    VadState::Silence
                } else {
                    VadState::PotentialSilence
                }
            }
            VadState::PotentialSilence => {
                if is_speech_frame {
                    VadState::Speech
                } else if self.silence_ms >= self.config.min_silence_ms {
                    result.speech_end = true;
                    result.utterance_ms = self.utterance_ms.saturating_sub(self.silence_ms);
                    debug!(
                        silence_ms = self.silence_ms,
                        utterance_ms = result.utterance_ms,
                        "silence confirmed"
                    );
                    self.utterance_ms = 0;
                    VadState::Silence
                } else {
                    VadState::PotentialSilence
                }
            }
        };
        result
    }

    /// Whether the machine currently considers the user to be speaking.
    pub fn is_speaking(&self) -> bool {
        matches!(self.state, VadState::Speech | VadState::PotentialSilence)
    }

    /// Whether an utterance is in progress, confirmation windows included.
    /// Audio should be buffered while this holds so the leading edge of the
    /// utterance is not dropped.
    pub fn is_active(&self) -> bool {
        self.state != VadState::Silence
    }

    /// Force an end-of-speech edge, e.g. for an explicit end-of-turn signal.
    /// Returns the utterance length if speech was in progress.
    pub fn flush(&mut self) -> Option<u64> {
        let was_speaking = self.is_speaking();
        let utterance_ms = self.utterance_ms;
        self.state = VadState::Silence;
        self.speech_ms = 0;
        self.silence_ms = 0;
        self.utterance_ms = 0;
        was_speaking.then_some(utterance_ms)
    }

    pub fn reset(&mut self) {
        self.state = VadState::Silence;
        self.speech_ms = 0;
        self.silence_ms = 0;
        self.utterance_ms = 0;
    }
}
