//! Audio output device and clock
//!
//! The output owns a sample timeline that starts at frame 0 when the device
//! is opened. Its clock is the number of frames the device has consumed, so
//! scheduled start times line up with what is actually audible.
//!
//! The device runs at its own mix rate. Buffers arrive at the speech rate and
//! are resampled on the way in.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};

use super::scheduler::ScheduledBuffer;
use crate::audio::frames::Resampler;
use crate::error::PlaybackError;

/// Start frames this close past the timeline end are treated as contiguous
const SNAP_FRAMES: u64 = 2;

/// Where scheduled buffers go. Also provides the audio clock.
pub trait AudioSink {
    /// Seconds since the sink started
    fn now(&self) -> f64;
    /// Place a buffer on the timeline at `buffer.start_at`
    fn schedule(&mut self, buffer: ScheduledBuffer);
}

/// Samples waiting to be played, positioned at the current frame
#[derive(Debug, Default)]
struct Timeline {
    pending: VecDeque<f32>,
}

impl Timeline {
    /// Insert `samples` at absolute frame `start_frame`, given that the device
    /// has consumed `played` frames. Late buffers are appended at the end.
    fn insert(&mut self, played: u64, start_frame: u64, samples: &[f32]) {
        let end = played + self.pending.len() as u64;
        if start_frame > end + SNAP_FRAMES {
            let gap = (start_frame - end) as usize;
            self.pending.extend(std::iter::repeat(0.0).take(gap));
        } else if start_frame < end {
            log::debug!(
                "Output: buffer late by {} frames, appending",
                end - start_frame
            );
        }
        self.pending.extend(samples.iter().copied());
    }
}

/// Converts speech-rate buffers to device frames
struct RateAdapter {
    source_rate: u32,
    device_rate: u32,
    resampler: Resampler,
    /// Source time where the previous buffer ended
    next_start: Option<f64>,
}

impl RateAdapter {
    fn new(source_rate: u32, device_rate: u32) -> Self {
        Self {
            source_rate,
            device_rate,
            resampler: Resampler::new(source_rate, device_rate),
            next_start: None,
        }
    }

    fn to_frames(&self, secs: f64) -> u64 {
        (secs * self.device_rate as f64).round().max(0.0) as u64
    }

    /// Device start frame and resampled samples for `buffer`. Interpolation
    /// state carries over only between back-to-back buffers.
    fn adapt(&mut self, buffer: &ScheduledBuffer) -> (u64, Vec<f32>) {
        let source_rate = self.source_rate.max(1) as f64;
        let contiguous = self
            .next_start
            .is_some_and(|end| (buffer.start_at - end).abs() < 1.0 / source_rate);
        if !contiguous {
            self.resampler = Resampler::new(self.source_rate, self.device_rate);
        }
        self.next_start = Some(buffer.start_at + buffer.samples.len() as f64 / source_rate);
        (
            self.to_frames(buffer.start_at),
            self.resampler.process(&buffer.samples),
        )
    }
}

/// cpal-backed output stream
pub struct CpalOutput {
    _stream: Stream,
    timeline: Arc<Mutex<Timeline>>,
    frames_played: Arc<AtomicU64>,
    rate: RateAdapter,
}

impl CpalOutput {
    /// Open the default output device in its default configuration. Mono
    /// `sample_rate` audio is resampled to the device rate and duplicated
    /// across its channels.
    pub fn open(sample_rate: u32) -> Result<Self, PlaybackError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(PlaybackError::NoOutputDevice)?;

        log::info!("Output: using device {:?}", device.name());

        let supported = device
            .default_output_config()
            .map_err(|e| PlaybackError::OutputFailed(e.to_string()))?;

        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.into();
        let device_rate = config.sample_rate.0;

        log::info!(
            "Output: {} Hz, {} channels, {:?} (source {} Hz)",
            device_rate,
            config.channels,
            sample_format,
            sample_rate
        );

        let timeline = Arc::new(Mutex::new(Timeline::default()));
        let frames_played = Arc::new(AtomicU64::new(0));

        let stream = match sample_format {
            SampleFormat::F32 => {
                build_stream_typed::<f32>(&device, &config, timeline.clone(), frames_played.clone())
            }
            SampleFormat::I16 => {
                build_stream_typed::<i16>(&device, &config, timeline.clone(), frames_played.clone())
            }
            SampleFormat::U16 => {
                build_stream_typed::<u16>(&device, &config, timeline.clone(), frames_played.clone())
            }
            other => Err(PlaybackError::OutputFailed(format!(
                "Unsupported sample format {:?}",
                other
            ))),
        }?;

        stream
            .play()
            .map_err(|e| PlaybackError::OutputFailed(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            timeline,
            frames_played,
            rate: RateAdapter::new(sample_rate, device_rate),
        })
    }
}

fn build_stream_typed<T>(
    device: &Device,
    config: &StreamConfig,
    timeline: Arc<Mutex<Timeline>>,
    frames_played: Arc<AtomicU64>,
) -> Result<Stream, PlaybackError>
where
    T: cpal::SizedSample + cpal::FromSample<f32> + Send + 'static,
{
    let channels = config.channels.max(1) as usize;

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let mut frames = 0u64;
                match timeline.lock() {
                    Ok(mut tl) => {
                        for frame in data.chunks_mut(channels) {
                            let sample = tl.pending.pop_front().unwrap_or(0.0);
                            let value = T::from_sample(sample);
                            for slot in frame.iter_mut() {
                                *slot = value;
                            }
                            frames += 1;
                        }
                    }
                    Err(_) => {
                        for slot in data.iter_mut() {
                            *slot = T::EQUILIBRIUM;
                        }
                        frames = (data.len() / channels) as u64;
                    }
                }
                frames_played.fetch_add(frames, Ordering::SeqCst);
            },
            |err| log::error!("Output: stream error: {}", err),
            None,
        )
        .map_err(|e| PlaybackError::OutputFailed(e.to_string()))
}

impl AudioSink for CpalOutput {
    fn now(&self) -> f64 {
        self.frames_played.load(Ordering::SeqCst) as f64 / self.rate.device_rate.max(1) as f64
    }

    fn schedule(&mut self, buffer: ScheduledBuffer) {
        let (start_frame, samples) = self.rate.adapt(&buffer);
        let played = self.frames_played.load(Ordering::SeqCst);
        match self.timeline.lock() {
            Ok(mut tl) => tl.insert(played, start_frame, &samples),
            Err(e) => log::error!("Output: timeline lock poisoned: {}", e),
        }
    }
}

/// Clock-only sink used when no output device is available; audio is
/// discarded but scheduling and completion still behave.
pub struct SilentOutput {
    started: Instant,
}

impl Default for SilentOutput {
    fn default() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl AudioSink for SilentOutput {
    fn now(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    fn schedule(&mut self, buffer: ScheduledBuffer) {
        log::trace!("Output: discarding {:.3}s of audio", buffer.duration);
    }
}

/// Open the device output, falling back to a silent clock
pub fn open_output(sample_rate: u32) -> Box<dyn AudioSink> {
    match CpalOutput::open(sample_rate) {
        Ok(output) => Box::new(output),
        Err(e) => {
            log::warn!("Output: {} (continuing without audible playback)", e);
            Box::new(SilentOutput::default())
        }
    }
}
