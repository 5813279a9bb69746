//! Microphone input for the voice agent
//!
//! Captures from the default input device with CPAL and turns the device
//! stream into fixed-size mono PCM16 frames at the session rate. Frames can
//! optionally be teed to a WAV file with hound.

pub mod capture;
pub mod frames;
pub mod recorder;

pub use capture::{CaptureConfig, FrameReceiver, MicCapture};
pub use frames::{FrameAssembler, Resampler};
pub use recorder::CaptureRecorder;
