//! Client-side building blocks.
//!
//! Reference implementations of the pieces a client harness needs around the
//! wire protocol: microphone framing, response playback with interrupt flush,
//! and the bounded reconnection policy. They carry no I/O of their own so
//! test harnesses and real clients can drive them however they capture and
//! play audio.

pub mod audio;
pub mod reconnect;

pub use audio::{AudioFrameBuffer, CallbackCapture, CaptureStrategy, PlaybackQueue, PollingCapture};
pub use reconnect::{PING_INTERVAL, ReconnectDecision, ReconnectionSupervisor};
