//! Barge-in policy.
//!
//! Decides what user speech during response playback means: cut the response
//! off, or ignore the speech entirely. Explicit `interrupt` messages bypass
//! the policy and always cancel when a response is in flight.

/// What to do about a speech-start edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BargeInDecision {
    /// Cancel the in-flight response, then treat this as new speech
    Interrupt,
    /// Drop the event; the response keeps playing
    Ignore,
    /// No response in flight; ordinary start of an utterance
    Continue,
}

#[derive(Debug, Clone)]
pub struct BargeInController {
    enabled: bool,
}

impl BargeInController {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Policy decision for a voice-activity speech-start edge.
    pub fn on_speech_started(&self, response_in_flight: bool) -> BargeInDecision {
        if !response_in_flight {
            BargeInDecision::Continue
        } else if self.enabled {
            BargeInDecision::Interrupt
        } else {
            BargeInDecision::Ignore
        }
    }

    /// Whether an explicit client `interrupt` should cancel anything.
    /// Independent of the voice policy; a no-op only when nothing is playing.
    pub fn on_explicit_interrupt(&self, response_in_flight: bool) -> bool {
        response_in_flight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enabled_interrupts_in_flight_response() {
        let controller = BargeInController::new(true);
        assert_eq!(
            controller.on_speech_started(true),
            BargeInDecision::Interrupt
        );
        assert_eq!(
            controller.on_speech_started(false),
            BargeInDecision::Continue
        );
    }

    #[test]
    fn test_disabled_ignores_speech_during_playback() {
        let controller = BargeInController::new(false);
        assert_eq!(controller.on_speech_started(true), BargeInDecision::Ignore);
        assert_eq!(
            controller.on_speech_started(false),
            BargeInDecision::Continue
        );
    }

    #[test]
    fn test_explicit_interrupt_ignores_policy() {
        for enabled in [true, false] {
            let controller = BargeInController::new(enabled);
            assert!(controller.on_explicit_interrupt(true));
            assert!(!controller.on_explicit_interrupt(false));
        }
    }
}
