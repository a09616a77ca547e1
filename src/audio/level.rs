//! Monitoring levels

use super::tap::{AudioSource, RawSamples};
use serde::{Deserialize, Serialize};

/// Gain applied to RMS so speech reaches the upper half of a meter
pub const LEVEL_GAIN: f32 = 4.0;

/// Latest level per source, each in `[0, 1]`
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioLevels {
    pub system: f32,
    pub microphone: f32,
}

impl AudioLevels {
    pub fn get(&self, source: AudioSource) -> f32 {
        match source {
            AudioSource::System => self.system,
            AudioSource::Microphone => self.microphone,
        }
    }

    pub fn set(&mut self, source: AudioSource, level: f32) {
        match source {
            AudioSource::System => self.system = level,
            AudioSource::Microphone => self.microphone = level,
        }
    }
}

fn mean_square(values: impl Iterator<Item = f32>) -> f32 {
    let (sum, count) = values.fold((0.0f64, 0usize), |(sum, count), v| {
        (sum + (v as f64) * (v as f64), count + 1)
    });
    if count == 0 {
        return 0.0;
    }
    (sum / count as f64) as f32
}

/// RMS of a buffer relative to full scale, times [`LEVEL_GAIN`], clamped to 1
pub fn rms_level(samples: &RawSamples) -> f32 {
    let ms = match samples {
        RawSamples::F32(s) => mean_square(s.iter().copied()),
        RawSamples::I16(s) => mean_square(s.iter().map(|&v| v as f32 / 32768.0)),
        RawSamples::U16(s) => mean_square(s.iter().map(|&v| (v as f32 - 32768.0) / 32768.0)),
    };
    let level = ms.sqrt() * LEVEL_GAIN;
    if level.is_finite() {
        level.clamp(0.0, 1.0)
    } else {
        0.0
    }
}
