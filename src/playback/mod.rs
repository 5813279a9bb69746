//! Playback of streamed speech
//!
//! `scheduler` decides when each decoded chunk starts on the audio clock;
//! `output` owns the device and the clock itself.

pub mod output;
pub mod scheduler;

pub use output::{open_output, AudioSink, CpalOutput, SilentOutput};
pub use scheduler::{
    decode_chunk, PlaybackScheduler, SchedulePass, ScheduledBuffer, SchedulerConfig,
    WAV_HEADER_BYTES,
};
