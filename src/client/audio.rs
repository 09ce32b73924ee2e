//! Capture framing and playback queueing.
//!
//! Capture devices deliver audio in whatever chunk size suits them; the
//! gateway wants steady ~100 ms frames. [`AudioFrameBuffer`] reframes the
//! stream, and the two [`CaptureStrategy`] implementations adapt it to
//! callback-driven and polled capture APIs.
//!
//! Playback is a FIFO with an epoch counter: an interrupt flush bumps the
//! epoch, so audio chunks still in flight from the cancelled response are
//! rejected on arrival instead of producing a stale audio tail.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

/// Frame length sent to the gateway.
pub const FRAME_MS: u64 = 100;

/// 100 ms of PCM16 mono at 16 kHz.
pub const FRAME_BYTES: usize = 3_200;

/// Reframes arbitrary capture chunks into fixed-size frames.
pub struct AudioFrameBuffer {
    pending: BytesMut,
    frame_bytes: usize,
}

impl AudioFrameBuffer {
    pub fn new() -> Self {
        Self::with_frame_bytes(FRAME_BYTES)
    }

    pub fn with_frame_bytes(frame_bytes: usize) -> Self {
        Self {
            pending: BytesMut::new(),
            frame_bytes,
        }
    }

    /// Append captured audio. Complete frames become available from
    /// [`Self::next_frame`].
    pub fn extend(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    /// Take the next complete frame, if one has accumulated.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        (self.pending.len() >= self.frame_bytes)
            .then(|| self.pending.split_to(self.frame_bytes).freeze())
    }

    /// Drain the remainder as a short final frame, e.g. at end of capture.
    pub fn drain(&mut self) -> Option<Bytes> {
        (!self.pending.is_empty()).then(|| self.pending.split().freeze())
    }

    pub fn buffered_bytes(&self) -> usize {
        self.pending.len()
    }
}

impl Default for AudioFrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// How captured audio reaches the sender.
pub trait CaptureStrategy {
    /// Feed one chunk from the capture device.
    fn ingest(&mut self, chunk: &[u8]);

    /// End of capture; flush any partial frame.
    fn finish(&mut self);
}

/// Pushes every completed frame into a callback as soon as it fills, for
/// capture APIs that deliver audio on their own thread.
pub struct CallbackCapture<F: FnMut(Bytes)> {
    buffer: AudioFrameBuffer,
    on_frame: F,
}

impl<F: FnMut(Bytes)> CallbackCapture<F> {
    pub fn new(on_frame: F) -> Self {
        Self {
            buffer: AudioFrameBuffer::new(),
            on_frame,
        }
    }
}

impl<F: FnMut(Bytes)> CaptureStrategy for CallbackCapture<F> {
    fn ingest(&mut self, chunk: &[u8]) {
        self.buffer.extend(chunk);
        while let Some(frame) = self.buffer.next_frame() {
            (self.on_frame)(frame);
        }
    }

    fn finish(&mut self) {
        if let Some(frame) = self.buffer.drain() {
            (self.on_frame)(frame);
        }
    }
}

/// Accumulates frames for the caller to collect on its own schedule, for
/// send loops that poll on a timer.
pub struct PollingCapture {
    buffer: AudioFrameBuffer,
    ready: VecDeque<Bytes>,
}

impl PollingCapture {
    pub fn new() -> Self {
        Self {
            buffer: AudioFrameBuffer::new(),
            ready: VecDeque::new(),
        }
    }

    /// Take the oldest complete frame, if any.
    pub fn poll(&mut self) -> Option<Bytes> {
        self.ready.pop_front()
    }
}

impl Default for PollingCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureStrategy for PollingCapture {
    fn ingest(&mut self, chunk: &[u8]) {
        self.buffer.extend(chunk);
        while let Some(frame) = self.buffer.next_frame() {
            self.ready.push_back(frame);
        }
    }

    fn finish(&mut self) {
        if let Some(frame) = self.buffer.drain() {
            self.ready.push_back(frame);
        }
    }
}

/// FIFO playback queue with output gain and epoch-guarded flushing.
pub struct PlaybackQueue {
    queue: VecDeque<Bytes>,
    epoch: u64,
    gain: f32,
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            epoch: 0,
            gain: 1.0,
        }
    }

    /// Current epoch; capture it when a response starts and pass it back
    /// with every chunk of that response.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Output gain multiplier, clamped to keep samples in range.
    pub fn set_gain(&mut self, gain: f32) {
        self.gain = gain.clamp(0.0, 4.0);
    }

    /// Enqueue one chunk of PCM16 audio. Chunks tagged with a stale epoch
    /// belong to a flushed response and are dropped; returns whether the
    /// chunk was accepted.
    pub fn push(&mut self, epoch: u64, chunk: Bytes) -> bool {
        if epoch != self.epoch {
            return false;
        }
        if chunk.is_empty() {
            return true;
        }
        let chunk = if (self.gain - 1.0).abs() < f32::EPSILON {
            chunk
        } else {
            apply_gain(&chunk, self.gain)
        };
        self.queue.push_back(chunk);
        true
    }

    /// Next chunk to hand to the audio device.
    pub fn pop(&mut self) -> Option<Bytes> {
        self.queue.pop_front()
    }

    /// Drop everything queued and advance the epoch. Playback goes silent
    /// immediately and late chunks from the old response stay out.
    pub fn flush(&mut self) -> u64 {
        self.queue.clear();
        self.epoch += 1;
        self.epoch
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queued playback length in milliseconds (PCM16 at 16 kHz).
    pub fn buffered_ms(&self) -> u64 {
        self.queue.iter().map(|c| c.len() as u64 / 32).sum()
    }
}

impl Default for PlaybackQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_gain(chunk: &[u8], gain: f32) -> Bytes {
    let mut out = Vec::with_capacity(chunk.len());
    for pair in chunk.chunks_exact(2) {
        let sample = i16::from_le_bytes([pair[0], pair[1]]) as f32 * gain;
        let sample = sample.clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        out.extend_from_slice(&sample.to_le_bytes());
    }
    Bytes::from(out)
}
