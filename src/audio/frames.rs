//! Frame assembly for captured audio
//!
//! Device callbacks deliver interleaved samples at the device rate in blocks
//! of arbitrary size. The pipeline here turns them into fixed-size mono PCM16
//! frames at the session rate: mix down, resample, convert, cut.

/// Convert any sample type to i16, clamping to the representable range.
pub fn sample_to_i16<T>(sample: T) -> i16
where
    T: cpal::Sample,
    f32: cpal::FromSample<T>,
{
    let f32_sample = <f32 as cpal::Sample>::from_sample(sample);
    let clamped = f32_sample.clamp(-1.0, 1.0);
    (clamped * i16::MAX as f32) as i16
}

/// Average interleaved channels into one.
pub fn mix_to_mono<T>(data: &[T], channels: usize) -> Vec<f32>
where
    T: cpal::Sample,
    f32: cpal::FromSample<T>,
{
    let channels = channels.max(1);
    data.chunks(channels)
        .map(|frame| {
            let sum: f32 = frame
                .iter()
                .map(|&s| <f32 as cpal::Sample>::from_sample(s))
                .sum();
            sum / frame.len() as f32
        })
        .collect()
}

/// Streaming linear-interpolation resampler.
///
/// Keeps the last input sample and the fractional read position between
/// blocks, so block boundaries do not produce clicks or drift.
#[derive(Debug, Clone)]
pub struct Resampler {
    /// Input samples advanced per output sample
    step: f64,
    /// Read position relative to the carried sample (index 0)
    position: f64,
    carry: Option<f32>,
}

impl Resampler {
    pub fn new(source_rate: u32, target_rate: u32) -> Self {
        let step = if source_rate == 0 || target_rate == 0 {
            log::warn!(
                "Invalid sample rate (source: {}, target: {}), passing through",
                source_rate,
                target_rate
            );
            1.0
        } else {
            source_rate as f64 / target_rate as f64
        };
        Self {
            step,
            position: 0.0,
            carry: None,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.step == 1.0
    }

    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        if self.is_passthrough() {
            return input.to_vec();
        }
        if input.is_empty() {
            return Vec::new();
        }

        let mut buffer = Vec::with_capacity(input.len() + 1);
        if let Some(carry) = self.carry {
            buffer.push(carry);
        }
        buffer.extend_from_slice(input);

        let last = buffer.len() - 1;
        let mut output = Vec::with_capacity((input.len() as f64 / self.step) as usize + 1);
        while self.position <= last as f64 {
            let index = self.position.floor() as usize;
            let frac = (self.position - index as f64) as f32;
            let sample = if index < last {
                buffer[index] * (1.0 - frac) + buffer[index + 1] * frac
            } else {
                buffer[index]
            };
            output.push(sample);
            self.position += self.step;
        }

        // Re-base so the last sample of this block becomes index 0
        self.position -= last as f64;
        self.carry = Some(buffer[last]);
        output
    }
}

/// Cuts a sample stream into frames of exactly `frame_len` samples.
#[derive(Debug, Clone)]
pub struct FrameAssembler {
    frame_len: usize,
    pending: Vec<i16>,
}

impl FrameAssembler {
    pub fn new(frame_len: usize) -> Self {
        let frame_len = frame_len.max(1);
        Self {
            frame_len,
            pending: Vec::with_capacity(frame_len),
        }
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Append samples and return every frame completed by them
    pub fn push(&mut self, samples: &[i16]) -> Vec<Vec<i16>> {
        let mut frames = Vec::new();
        let mut rest = samples;
        while !rest.is_empty() {
            let take = (self.frame_len - self.pending.len()).min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.pending.len() == self.frame_len {
                frames.push(std::mem::replace(
                    &mut self.pending,
                    Vec::with_capacity(self.frame_len),
                ));
            }
        }
        frames
    }

    /// Samples held back waiting for a full frame
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_to_i16() {
        assert_eq!(sample_to_i16(0.0f32), 0);
        assert_eq!(sample_to_i16(1.0f32), i16::MAX);
        assert_eq!(sample_to_i16(-1.0f32), -i16::MAX);

        // Clamping
        assert_eq!(sample_to_i16(2.0f32), i16::MAX);
        assert_eq!(sample_to_i16(-2.0f32), -i16::MAX);
    }

    #[test]
    fn test_mix_to_mono_averages_channels() {
        let stereo = [0.5f32, -0.5, 1.0, 0.0];
        assert_eq!(mix_to_mono(&stereo, 2), vec![0.0, 0.5]);
        assert_eq!(mix_to_mono(&stereo, 1), stereo.to_vec());
    }

    #[test]
    fn test_resampler_passthrough() {
        let mut r = Resampler::new(16000, 16000);
        assert_eq!(r.process(&[0.1, 0.2]), vec![0.1, 0.2]);
    }

    #[test]
    fn test_resampler_halves_rate_across_blocks() {
        let input: Vec<f32> = (0..960).map(|i| i as f32).collect();

        let mut whole = Resampler::new(48000, 24000);
        let expected = whole.process(&input);

        let mut split = Resampler::new(48000, 24000);
        let mut got = split.process(&input[..301]);
        got.extend(split.process(&input[301..]));

        assert_eq!(got, expected);
        assert_eq!(expected.len(), 480);
        assert_eq!(expected[1], 2.0);
    }

    #[test]
    fn test_resampler_non_integer_ratio_output_length() {
        let mut r = Resampler::new(44100, 16000);
        let mut total = 0;
        for _ in 0..10 {
            total += r.process(&vec![0.0; 4410]).len();
        }
        // 44100 input samples at 44.1kHz is one second at 16kHz
        assert!((15999..=16001).contains(&total), "got {}", total);
    }

    #[test]
    fn test_frame_assembler_emits_fixed_frames() {
        let mut a = FrameAssembler::new(4);
        assert!(a.push(&[1, 2, 3]).is_empty());
        let frames = a.push(&[4, 5, 6, 7, 8, 9]);
        assert_eq!(frames, vec![vec![1, 2, 3, 4], vec![5, 6, 7, 8]]);
        assert_eq!(a.pending(), 1);
    }
}
