//! Microphone capture using CPAL
//!
//! `MicCapture` owns the input stream. The device callback runs the frame
//! pipeline and pushes each finished frame into a single-slot channel, so at
//! most one frame waits for the session loop. When the slot is still full the
//! new frame is dropped rather than queued.
//!
//! ```text
//! Audio Thread (sync)                      Session loop (async)
//! ┌──────────────────────────┐            ┌───────────────────┐
//! │ CPAL Callback            │            │ frames.recv()     │
//! │  mix ▶ resample ▶ i16    │──try_send─▶│  ▶ transport      │
//! │  ▶ fixed-size frames     │  (1 slot)  └───────────────────┘
//! └──────────────────────────┘
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};
use tokio::sync::mpsc;

use super::frames::{mix_to_mono, sample_to_i16, FrameAssembler, Resampler};
use crate::error::CaptureError;

/// Receiver for captured PCM16 frames
pub type FrameReceiver = mpsc::Receiver<Vec<i16>>;

/// Frames allowed to wait for the consumer
const FRAME_BACKLOG: usize = 1;

/// Session-side capture parameters
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConfig {
    /// Sample rate of the frames sent to the backend
    pub sample_rate: u32,
    /// Duration of each frame
    pub frame_duration_ms: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            frame_duration_ms: 250,
        }
    }
}

impl CaptureConfig {
    /// Samples per frame at the session rate
    pub fn frame_len(&self) -> usize {
        ((self.sample_rate as u64 * self.frame_duration_ms as u64) / 1000).max(1) as usize
    }
}

/// Device-rate samples in, session frames out. Runs on the audio thread.
pub(crate) struct FramePipeline {
    channels: usize,
    resampler: Resampler,
    assembler: FrameAssembler,
    tx: mpsc::Sender<Vec<i16>>,
    frames_sent: Arc<AtomicU64>,
    frames_dropped: Arc<AtomicU64>,
}

impl FramePipeline {
    pub(crate) fn new(
        device_rate: u32,
        channels: usize,
        config: &CaptureConfig,
        tx: mpsc::Sender<Vec<i16>>,
    ) -> Self {
        Self {
            channels,
            resampler: Resampler::new(device_rate, config.sample_rate),
            assembler: FrameAssembler::new(config.frame_len()),
            tx,
            frames_sent: Arc::new(AtomicU64::new(0)),
            frames_dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub(crate) fn process<T>(&mut self, data: &[T])
    where
        T: cpal::Sample,
        f32: cpal::FromSample<T>,
    {
        let mono = mix_to_mono(data, self.channels);
        let resampled = self.resampler.process(&mono);
        let pcm: Vec<i16> = resampled.into_iter().map(sample_to_i16::<f32>).collect();

        for frame in self.assembler.push(&pcm) {
            match self.tx.try_send(frame) {
                Ok(()) => {
                    self.frames_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let dropped = self.frames_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if dropped % 10 == 1 {
                        log::warn!("Capture: consumer behind, dropped {} frames", dropped);
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Receiver gone, capture is being torn down
                }
            }
        }
    }
}

/// Handle to a running microphone capture.
/// Dropping it (or calling `stop`) releases the device immediately.
pub struct MicCapture {
    stream: Option<Stream>,
    frames_sent: Arc<AtomicU64>,
    frames_dropped: Arc<AtomicU64>,
}

impl MicCapture {
    /// Open the default input device and start producing frames.
    pub fn start(config: &CaptureConfig) -> Result<(Self, FrameReceiver), CaptureError> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or(CaptureError::NoInputDevice)?;

        log::info!("Capture: using input device {:?}", device.name());

        let supported_config = device
            .default_input_config()
            .map_err(|_| CaptureError::NoSupportedConfig)?;

        log::info!(
            "Capture: device {} Hz, {} channels, {:?} -> {} Hz mono, {} samples/frame",
            supported_config.sample_rate().0,
            supported_config.channels(),
            supported_config.sample_format(),
            config.sample_rate,
            config.frame_len()
        );

        let sample_format = supported_config.sample_format();
        let stream_config: StreamConfig = supported_config.into();
        let device_rate = stream_config.sample_rate.0;

        let (tx, rx) = mpsc::channel(FRAME_BACKLOG);
        let pipeline = FramePipeline::new(
            device_rate,
            stream_config.channels as usize,
            config,
            tx,
        );
        let frames_sent = pipeline.frames_sent.clone();
        let frames_dropped = pipeline.frames_dropped.clone();

        let stream = build_stream(&device, &stream_config, sample_format, pipeline)?;
        stream
            .play()
            .map_err(|e| CaptureError::StreamStartFailed(e.to_string()))?;

        log::info!("Capture: started");

        Ok((
            Self {
                stream: Some(stream),
                frames_sent,
                frames_dropped,
            },
            rx,
        ))
    }

    /// Release the device. Returns once the stream is dropped.
    pub fn stop(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                log::debug!("Capture: pause before release failed: {}", e);
            }
            drop(stream);
            log::info!(
                "Capture: released device ({} frames, {} dropped)",
                self.frames_sent.load(Ordering::Relaxed),
                self.frames_dropped.load(Ordering::Relaxed)
            );
        }
    }
}

impl Drop for MicCapture {
    fn drop(&mut self) {
        self.release();
    }
}

fn build_stream(
    device: &Device,
    config: &StreamConfig,
    sample_format: SampleFormat,
    pipeline: FramePipeline,
) -> Result<Stream, CaptureError> {
    match sample_format {
        SampleFormat::I16 => build_stream_typed::<i16>(device, config, pipeline),
        SampleFormat::U16 => build_stream_typed::<u16>(device, config, pipeline),
        SampleFormat::F32 => build_stream_typed::<f32>(device, config, pipeline),
        _ => Err(CaptureError::NoSupportedConfig),
    }
}

fn build_stream_typed<T>(
    device: &Device,
    config: &StreamConfig,
    mut pipeline: FramePipeline,
) -> Result<Stream, CaptureError>
where
    T: cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| pipeline.process(data),
            |err| log::error!("Capture: stream error: {}", err),
            None,
        )
        .map_err(|e| CaptureError::StreamCreationFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_len() {
        let config = CaptureConfig::default();
        assert_eq!(config.frame_len(), 4000);

        let config = CaptureConfig {
            sample_rate: 16000,
            frame_duration_ms: 256,
        };
        assert_eq!(config.frame_len(), 4096);
    }

    #[test]
    fn test_pipeline_mixes_and_frames() {
        let config = CaptureConfig {
            sample_rate: 16000,
            frame_duration_ms: 1,
        };
        let (tx, mut rx) = mpsc::channel(FRAME_BACKLOG);
        let mut pipeline = FramePipeline::new(16000, 2, &config, tx);

        // 16 stereo frames of full-scale left, silent right
        let data: Vec<f32> = (0..16).flat_map(|_| [1.0f32, 0.0]).collect();
        pipeline.process(&data);

        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.len(), 16);
        assert!(frame.iter().all(|&s| s == (0.5 * i16::MAX as f32) as i16));
    }

    #[test]
    fn test_pipeline_holds_at_most_one_frame() {
        let config = CaptureConfig {
            sample_rate: 16000,
            frame_duration_ms: 1,
        };
        let (tx, mut rx) = mpsc::channel(FRAME_BACKLOG);
        let mut pipeline = FramePipeline::new(16000, 1, &config, tx);

        pipeline.process(&vec![0i16; 16 * 3]);

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        assert_eq!(pipeline.frames_sent.load(Ordering::Relaxed), 1);
        assert_eq!(pipeline.frames_dropped.load(Ordering::Relaxed), 2);
    }
}
