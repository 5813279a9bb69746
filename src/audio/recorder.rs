//! WAV tee for captured audio
//!
//! Writes exactly the PCM16 frames that are streamed to the backend, at the
//! session rate, so a capture can be replayed or compared with the server's
//! copy of the stream.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use hound::{WavSpec, WavWriter};

use crate::error::CaptureError;

pub struct CaptureRecorder {
    writer: WavWriter<BufWriter<File>>,
    path: PathBuf,
    samples_written: u64,
}

impl CaptureRecorder {
    /// Create a mono 16-bit WAV at `path`.
    pub fn create(path: impl AsRef<Path>, sample_rate: u32) -> Result<Self, CaptureError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| CaptureError::RecordingFailed(e.to_string()))?;
        }

        let spec = WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let writer = WavWriter::create(&path, spec)
            .map_err(|e| CaptureError::RecordingFailed(e.to_string()))?;

        log::info!("Recorder: writing capture to {:?}", path);

        Ok(Self {
            writer,
            path,
            samples_written: 0,
        })
    }

    pub fn write_frame(&mut self, frame: &[i16]) -> Result<(), CaptureError> {
        for &sample in frame {
            self.writer
                .write_sample(sample)
                .map_err(|e| CaptureError::RecordingFailed(e.to_string()))?;
        }
        self.samples_written += frame.len() as u64;
        Ok(())
    }

    pub fn samples_written(&self) -> u64 {
        self.samples_written
    }

    /// Finalize the WAV header. Returns the file path.
    pub fn finalize(self) -> Result<PathBuf, CaptureError> {
        self.writer
            .finalize()
            .map_err(|e| CaptureError::RecordingFailed(e.to_string()))?;
        log::info!(
            "Recorder: finalized {:?} ({} samples)",
            self.path,
            self.samples_written
        );
        Ok(self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorder_writes_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("capture.wav");

        let mut recorder = CaptureRecorder::create(&path, 16000).unwrap();
        recorder.write_frame(&[1, -2, 3]).unwrap();
        recorder.write_frame(&[i16::MAX, i16::MIN]).unwrap();
        assert_eq!(recorder.samples_written(), 5);
        let written = recorder.finalize().unwrap();

        let mut reader = hound::WavReader::open(written).unwrap();
        assert_eq!(reader.spec().sample_rate, 16000);
        assert_eq!(reader.spec().channels, 1);
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![1, -2, 3, i16::MAX, i16::MIN]);
    }
}
