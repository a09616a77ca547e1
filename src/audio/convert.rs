//! Format conversion to the container's 48 kHz stereo f32

use super::tap::RawSamples;

pub const OUTPUT_SAMPLE_RATE: u32 = 48_000;
pub const OUTPUT_CHANNELS: u16 = 2;

pub fn to_f32(samples: &RawSamples) -> Vec<f32> {
    match samples {
        RawSamples::F32(s) => s.clone(),
        RawSamples::I16(s) => s.iter().map(|&v| v as f32 / 32768.0).collect(),
        RawSamples::U16(s) => s.iter().map(|&v| (v as f32 - 32768.0) / 32768.0).collect(),
    }
}

/// Interleaved stereo from any channel count
///
/// Mono is duplicated; extra channels beyond the first two are dropped.
pub fn to_stereo(samples: &[f32], channels: u16) -> Vec<f32> {
    match channels {
        0 => Vec::new(),
        1 => samples.iter().flat_map(|&s| [s, s]).collect(),
        2 => samples.to_vec(),
        n => samples
            .chunks_exact(n as usize)
            .flat_map(|frame| [frame[0], frame[1]])
            .collect(),
    }
}

/// Streaming linear resampler for interleaved stereo
///
/// Keeps the last frame of the previous buffer so interpolation is
/// continuous across buffer boundaries.
#[derive(Debug, Clone)]
pub struct LinearResampler {
    from: u32,
    to: u32,
    /// Read position in the current buffer; -1 is the carried frame
    pos: f64,
    last: [f32; 2],
}

impl LinearResampler {
    pub fn new(from: u32, to: u32) -> Self {
        Self {
            from,
            to,
            pos: 0.0,
            last: [0.0; 2],
        }
    }

    pub fn input_rate(&self) -> u32 {
        self.from
    }

    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        if self.from == self.to || self.from == 0 {
            return input.to_vec();
        }
        let frames = input.len() / 2;
        if frames == 0 {
            return Vec::new();
        }

        let step = self.from as f64 / self.to as f64;
        let frame = |i: isize, last: [f32; 2]| -> [f32; 2] {
            if i < 0 {
                last
            } else {
                let i = i as usize * 2;
                [input[i], input[i + 1]]
            }
        };

        let mut output = Vec::with_capacity(((frames as f64 / step).ceil() as usize + 1) * 2);
        while self.pos < (frames - 1) as f64 {
            let i = self.pos.floor();
            let t = (self.pos - i) as f32;
            let a = frame(i as isize, self.last);
            let b = frame(i as isize + 1, self.last);
            output.push(a[0] + (b[0] - a[0]) * t);
            output.push(a[1] + (b[1] - a[1]) * t);
            self.pos += step;
        }

        self.pos -= frames as f64;
        self.last = frame(frames as isize - 1, self.last);
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_stereo() {
        assert_eq!(to_stereo(&[0.1, 0.2], 1), vec![0.1, 0.1, 0.2, 0.2]);
        assert_eq!(to_stereo(&[0.1, 0.2, 0.3, 0.4, 0.5, 0.6], 3), vec![0.1, 0.2, 0.4, 0.5]);
        assert!(to_stereo(&[0.1], 0).is_empty());
    }

    #[test]
    fn test_integer_formats_normalize() {
        assert_eq!(to_f32(&RawSamples::I16(vec![-32768, 0])), vec![-1.0, 0.0]);
        assert_eq!(to_f32(&RawSamples::U16(vec![0, 32768])), vec![-1.0, 0.0]);
    }

    #[test]
    fn test_resample_keeps_rate_over_many_buffers() {
        let mut resampler = LinearResampler::new(44_100, OUTPUT_SAMPLE_RATE);
        let buffer = vec![0.5f32; 441 * 2];
        let produced: usize = (0..100).map(|_| resampler.process(&buffer).len() / 2).sum();
        // One second of input
        assert!((produced as i64 - 48_000).abs() <= 2, "produced {}", produced);
    }

    #[test]
    fn test_resample_interpolates_across_buffers() {
        let mut resampler = LinearResampler::new(24_000, 48_000);
        let first = resampler.process(&[0.0, 0.0, 1.0, 1.0]);
        let second = resampler.process(&[2.0, 2.0, 3.0, 3.0]);
        let left: Vec<f32> = first.iter().chain(second.iter()).step_by(2).copied().collect();
        assert_eq!(left, vec![0.0, 0.5, 1.0, 1.5, 2.0, 2.5]);
    }

    #[test]
    fn test_same_rate_passes_through() {
        let mut resampler = LinearResampler::new(48_000, 48_000);
        assert_eq!(resampler.process(&[0.1, 0.2]), vec![0.1, 0.2]);
    }
}
