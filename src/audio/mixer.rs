//! Two-source mixer
//!
//! System audio and microphone share the container's single audio track.
//! Each source is queued on a common 48 kHz frame timeline; mixed audio is
//! released once every source has covered it, or once the leading source
//! is more than [`MIX_LATENCY`] ahead of a lagging one.

use super::convert::OUTPUT_SAMPLE_RATE;
use super::tap::AudioSource;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// How far one source may run ahead before the other is treated as silent
pub const MIX_LATENCY: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct SourceQueue {
    /// Timeline frame of the first queued frame
    start: i64,
    /// Interleaved stereo
    samples: VecDeque<f32>,
}

impl SourceQueue {
    fn frames(&self) -> i64 {
        (self.samples.len() / 2) as i64
    }

    fn end(&self) -> i64 {
        self.start + self.frames()
    }
}

/// Mixes interleaved 48 kHz stereo from the enabled sources
#[derive(Debug)]
pub struct Mixer {
    queues: HashMap<AudioSource, SourceQueue>,
    /// Media time of timeline frame 0
    base: Option<Duration>,
    /// Next timeline frame to release
    cursor: i64,
}

fn frames_in(duration: Duration) -> i64 {
    (duration.as_secs_f64() * OUTPUT_SAMPLE_RATE as f64).round() as i64
}

impl Mixer {
    pub fn new(sources: &[AudioSource]) -> Self {
        Self {
            queues: sources.iter().map(|&s| (s, SourceQueue::default())).collect(),
            base: None,
            cursor: 0,
        }
    }

    fn timeline_frame(&self, pts: Duration) -> i64 {
        match self.base {
            Some(base) if pts >= base => frames_in(pts - base),
            Some(base) => -frames_in(base - pts),
            None => 0,
        }
    }

    fn pts_of(&self, frame: i64) -> Duration {
        let base = self.base.unwrap_or_default();
        base + Duration::from_nanos((frame.max(0) as u128 * 1_000_000_000 / OUTPUT_SAMPLE_RATE as u128) as u64)
    }

    /// Queue stereo samples captured at `pts`
    pub fn push(&mut self, source: AudioSource, pts: Duration, stereo: &[f32]) {
        if self.base.is_none() {
            self.base = Some(pts);
        }
        let start = self.timeline_frame(pts);
        let Some(queue) = self.queues.get_mut(&source) else {
            return;
        };
        if queue.samples.is_empty() {
            queue.start = start;
        }
        queue.samples.extend(stereo.iter().copied());
    }

    /// Release mixed audio that is ready
    pub fn pull(&mut self) -> Option<(Duration, Vec<f32>)> {
        self.release(false)
    }

    /// Release everything still queued
    pub fn flush(&mut self) -> Option<(Duration, Vec<f32>)> {
        self.release(true)
    }

    fn release(&mut self, flush: bool) -> Option<(Duration, Vec<f32>)> {
        let queued = || self.queues.values().filter(|q| !q.samples.is_empty());
        let leader = queued().map(SourceQueue::end).max()?;
        let earliest = queued().map(|q| q.start).min().unwrap_or(self.cursor);

        // Skip gaps where no source has audio
        if earliest > self.cursor {
            self.cursor = earliest;
        }

        let window_end = if flush {
            leader
        } else {
            let lagging = self
                .queues
                .values()
                .map(|q| if q.samples.is_empty() { self.cursor } else { q.end() })
                .min()
                .unwrap_or(self.cursor);
            lagging.max(leader - frames_in(MIX_LATENCY))
        };

        let frames = window_end - self.cursor;
        if frames <= 0 {
            return None;
        }

        let mut mixed = vec![0.0f32; frames as usize * 2];
        for queue in self.queues.values_mut() {
            // Late samples behind the cursor are discarded
            if queue.start < self.cursor {
                let stale = ((self.cursor - queue.start).min(queue.frames()) * 2) as usize;
                queue.samples.drain(..stale);
                queue.start = self.cursor;
            }
            if queue.samples.is_empty() || queue.start >= window_end {
                continue;
            }

            let offset = (queue.start - self.cursor) as usize;
            let take = (window_end - queue.start).min(queue.frames()) as usize;
            for (i, sample) in queue.samples.drain(..take * 2).enumerate() {
                mixed[offset * 2 + i] += sample;
            }
            queue.start += take as i64;
        }

        for sample in mixed.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }

        let pts = self.pts_of(self.cursor);
        self.cursor = window_end;
        Some((pts, mixed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_single_source_passes_through() {
        let mut mixer = Mixer::new(&[AudioSource::Microphone]);
        mixer.push(AudioSource::Microphone, ms(1000), &[0.5; 960]);
        let (pts, samples) = mixer.pull().unwrap();
        assert_eq!(pts, ms(1000));
        assert_eq!(samples.len(), 960);
        assert!(mixer.pull().is_none());

        mixer.push(AudioSource::Microphone, ms(1010), &[0.5; 960]);
        assert_eq!(mixer.pull().unwrap().0, ms(1010));
    }

    #[test]
    fn test_waits_for_both_sources() {
        let mut mixer = Mixer::new(&[AudioSource::System, AudioSource::Microphone]);
        mixer.push(AudioSource::System, ms(0), &[0.25; 960]);
        assert!(mixer.pull().is_none());

        mixer.push(AudioSource::Microphone, ms(0), &[0.5; 960]);
        let (pts, samples) = mixer.pull().unwrap();
        assert_eq!(pts, ms(0));
        assert_eq!(samples.len(), 960);
        assert!(samples.iter().all(|&s| (s - 0.75).abs() < 1e-6));
    }

    #[test]
    fn test_silent_source_does_not_stall() {
        let mut mixer = Mixer::new(&[AudioSource::System, AudioSource::Microphone]);
        // 150ms of system audio, nothing from the microphone
        for i in 0..15 {
            mixer.push(AudioSource::System, ms(i * 10), &[0.1; 960]);
        }
        let (pts, samples) = mixer.pull().unwrap();
        assert_eq!(pts, ms(0));
        // Everything except the last 100ms is released
        assert_eq!(samples.len() / 2, 2400);
    }

    #[test]
    fn test_sum_is_clipped_and_flush_drains() {
        let mut mixer = Mixer::new(&[AudioSource::System, AudioSource::Microphone]);
        mixer.push(AudioSource::System, ms(0), &[0.9; 960]);
        mixer.push(AudioSource::Microphone, ms(5), &[0.9; 960]);

        let (_, first) = mixer.pull().unwrap();
        // First 5ms only carry system audio
        assert!((first[0] - 0.9).abs() < 1e-6);
        assert_eq!(first[first.len() - 1], 1.0);

        let (pts, rest) = mixer.flush().unwrap();
        assert_eq!(pts, ms(10));
        assert_eq!(rest.len() / 2, 240);
        assert!(mixer.flush().is_none());
    }
}
