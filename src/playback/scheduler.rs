//! Gapless scheduling of streamed TTS audio
//!
//! Incoming chunks are base64 PCM16 LE. The first chunk after a reset carries
//! a WAV container header which is stripped exactly once.
//!
//! # Playhead
//!
//! The playhead is the scheduled end time of the last buffer, on the output
//! device's clock (seconds). It never moves backward. When it has fallen
//! behind the clock it is snapped to `now + guard`.
//!
//! ```text
//!   clock ──────now────────────────────────────▶
//!                  │guard│ buf 1  │ buf 2 │ buf 3 │
//!                        ▲start   ▲       ▲       ▲playhead
//! ```

use std::collections::VecDeque;

use base64::{engine::general_purpose::STANDARD, Engine};

use crate::error::PlaybackError;

/// Size of the WAV header carried by the first chunk of a response
pub const WAV_HEADER_BYTES: usize = 44;

/// Minimum number of queued buffers that starts playback even when the
/// playhead is still far ahead of the clock
const START_THRESHOLD_BUFFERS: usize = 2;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub sample_rate: u32,
    /// Guard between "now" and the earliest start time, in seconds
    pub guard_secs: f64,
    pub header_bytes: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            guard_secs: 0.1,
            header_bytes: WAV_HEADER_BYTES,
        }
    }
}

/// A buffer placed on the output timeline
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledBuffer {
    pub start_at: f64,
    pub duration: f64,
    pub samples: Vec<f32>,
}

impl ScheduledBuffer {
    pub fn end_at(&self) -> f64 {
        self.start_at + self.duration
    }
}

/// Decode a base64 chunk, optionally dropping a leading header
pub fn decode_chunk(audio_base64: &str, strip_bytes: usize) -> Result<Vec<f32>, PlaybackError> {
    let bytes = STANDARD
        .decode(audio_base64.trim())
        .map_err(|e| PlaybackError::InvalidBase64(e.to_string()))?;

    let payload = bytes.get(strip_bytes..).unwrap_or(&[]);
    if payload.len() % 2 != 0 {
        log::debug!("Scheduler: dropping trailing odd byte of audio chunk");
    }
    Ok(pcm16_le_to_f32(payload))
}

/// Signed 16-bit LE samples to floats in [-1, 1]
pub fn pcm16_le_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect()
}

/// Result of a scheduling pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulePass {
    /// Buffers to hand to the output, in order
    pub scheduled: Vec<ScheduledBuffer>,
    /// End of stream reached and all audio has played out
    pub finished: bool,
}

/// FIFO of decoded buffers plus the playhead
#[derive(Debug)]
pub struct PlaybackScheduler {
    config: SchedulerConfig,
    queue: VecDeque<Vec<f32>>,
    playhead: f64,
    playing: bool,
    strip_header: bool,
    end_of_stream: bool,
    chunks_received: u64,
}

impl PlaybackScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            queue: VecDeque::new(),
            playhead: 0.0,
            playing: false,
            strip_header: true,
            end_of_stream: false,
            chunks_received: 0,
        }
    }

    /// Start a new playback session (new utterance).
    ///
    /// Clears the queue and playing flag, re-arms header stripping and
    /// re-anchors the playhead at `now` (never backward).
    pub fn reset(&mut self, now: f64) {
        let dropped = self.queue.len();
        self.queue.clear();
        self.playing = false;
        self.strip_header = true;
        self.end_of_stream = false;
        self.chunks_received = 0;
        self.playhead = self.playhead.max(now);
        log::debug!(
            "Scheduler: reset at {:.3}s (dropped {} queued buffers)",
            now,
            dropped
        );
    }

    /// Decode and enqueue one chunk, then try to schedule.
    ///
    /// A decode failure leaves the scheduler untouched apart from consuming
    /// the header-strip flag when it was the first chunk.
    pub fn push_chunk(
        &mut self,
        audio_base64: &str,
        is_final: bool,
        now: f64,
    ) -> Result<SchedulePass, PlaybackError> {
        let strip = if self.strip_header {
            self.strip_header = false;
            self.config.header_bytes
        } else {
            0
        };

        if is_final {
            self.end_of_stream = true;
        }

        let samples = decode_chunk(audio_base64, strip)?;
        self.chunks_received += 1;
        if !samples.is_empty() {
            self.queue.push_back(samples);
        }

        if self.chunks_received % 50 == 0 {
            log::debug!(
                "Scheduler: {} chunks received, playhead {:.3}s",
                self.chunks_received,
                self.playhead
            );
        }

        Ok(self.poll(now))
    }

    /// Mark end of stream without audio (e.g. TTS error)
    pub fn finish(&mut self) {
        self.end_of_stream = true;
    }

    /// Scheduling pass; also called periodically so a held buffer starts once
    /// the playhead comes within the guard of the clock.
    pub fn poll(&mut self, now: f64) -> SchedulePass {
        let mut pass = SchedulePass::default();

        let near_playhead = self.playhead <= now + self.config.guard_secs;
        if !self.playing
            && !self.queue.is_empty()
            && (near_playhead || self.queue.len() >= START_THRESHOLD_BUFFERS)
        {
            self.playing = true;
            while let Some(samples) = self.queue.pop_front() {
                let start_at = self.playhead.max(now + self.config.guard_secs);
                let duration = samples.len() as f64 / self.config.sample_rate as f64;
                self.playhead = start_at + duration;
                pass.scheduled.push(ScheduledBuffer {
                    start_at,
                    duration,
                    samples,
                });
            }
            self.playing = false;
        }

        if self.end_of_stream && self.queue.is_empty() && now >= self.playhead {
            self.end_of_stream = false;
            pass.finished = true;
            log::info!("Scheduler: playback drained at {:.3}s", now);
        }

        pass
    }

    /// Audio still queued or scheduled ahead of the clock
    pub fn is_active(&self, now: f64) -> bool {
        !self.queue.is_empty() || self.playhead > now
    }

    pub fn playhead(&self) -> f64 {
        self.playhead
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn awaiting_end(&self) -> bool {
        self.end_of_stream
    }
}
