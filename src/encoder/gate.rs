//! Pause/resume forwarding gate
//!
//! The controller flips the gate; the writer thread consults it for every
//! sample. Pausing is keyframe-gated: the request takes effect on the first
//! video frame that opens a new GOP, so the container never ends a segment
//! mid-GOP. On resume, the first video frame is placed on the slot the
//! withheld frame would have used, which is itself a GOP boundary, and the
//! paused gap is folded into an offset subtracted from every later
//! timestamp.

use super::types::FrameRate;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Gate phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatePhase {
    Open,
    /// Pause requested, waiting for the next GOP boundary
    PausePending,
    Paused,
    /// Resume requested, waiting for the next video frame
    Resuming,
    Closed,
}

/// Verdict for one sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Forward at this output timestamp
    Forward(Duration),
    Withhold,
}

#[derive(Debug)]
struct GateInner {
    phase: GatePhase,
    fps: u32,
    gop: u64,
    /// Excluded media time subtracted from anchor-relative timestamps
    offset: Duration,
    /// Last forwarded video output timestamp
    last_video: Option<Duration>,
    /// Output slot of the first withheld frame
    withheld_slot: Option<Duration>,
    /// Anchor-relative time where audio stops for the current pause
    audio_cut: Option<Duration>,
    /// Anchor-relative time of the first resumed video frame
    resumed_at: Option<Duration>,
    paused_media: Duration,
}

impl GateInner {
    fn slot(&self, out: Duration) -> u64 {
        (out.as_secs_f64() * self.fps as f64).round() as u64
    }

    fn gop_index(&self, out: Duration) -> u64 {
        self.slot(out) / self.gop
    }

    fn boundary(&self, index: u64) -> Duration {
        Duration::from_secs_f64((index * self.gop) as f64 / self.fps as f64)
    }
}

/// Shared pause/resume gate for one encoder session
#[derive(Debug, Clone)]
pub struct ForwardGate {
    inner: Arc<Mutex<GateInner>>,
}

impl ForwardGate {
    pub fn new(frame_rate: FrameRate) -> Self {
        Self {
            inner: Arc::new(Mutex::new(GateInner {
                phase: GatePhase::Open,
                fps: frame_rate.fps(),
                gop: frame_rate.keyframe_interval() as u64,
                offset: Duration::ZERO,
                last_video: None,
                withheld_slot: None,
                audio_cut: None,
                resumed_at: None,
                paused_media: Duration::ZERO,
            })),
        }
    }

    pub fn phase(&self) -> GatePhase {
        self.inner.lock().phase
    }

    /// Media time excluded from the container so far
    pub fn paused_media(&self) -> Duration {
        self.inner.lock().paused_media
    }

    /// Current timestamp offset
    pub fn offset(&self) -> Duration {
        self.inner.lock().offset
    }

    /// Ask forwarding to stop at the next GOP boundary
    ///
    /// Returns false if the gate is not open.
    pub fn request_pause(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.phase {
            GatePhase::Open => {
                inner.phase = GatePhase::PausePending;
                true
            }
            GatePhase::Resuming => {
                inner.phase = GatePhase::Paused;
                true
            }
            _ => false,
        }
    }

    /// Resume forwarding
    ///
    /// Returns false if the gate was not pausing or paused.
    pub fn resume(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.phase {
            GatePhase::PausePending => {
                inner.phase = GatePhase::Open;
                true
            }
            GatePhase::Paused => {
                inner.phase = GatePhase::Resuming;
                true
            }
            _ => false,
        }
    }

    /// Withhold everything from now on
    pub fn close(&self) {
        self.inner.lock().phase = GatePhase::Closed;
    }

    /// Decide a video frame at an anchor-relative timestamp
    pub fn admit_video(&self, rel: Duration) -> Admission {
        let mut inner = self.inner.lock();
        let out = rel.saturating_sub(inner.offset);

        match inner.phase {
            GatePhase::Open => {
                inner.last_video = Some(out);
                Admission::Forward(out)
            }
            GatePhase::PausePending => {
                let index = inner.gop_index(out);
                let crossed = match inner.last_video {
                    Some(last) => index > inner.gop_index(last),
                    None => true,
                };
                if !crossed {
                    inner.last_video = Some(out);
                    return Admission::Forward(out);
                }

                let slot = inner.boundary(index);
                inner.withheld_slot = Some(slot);
                inner.audio_cut = Some(slot + inner.offset);
                inner.phase = GatePhase::Paused;
                tracing::debug!("Forwarding paused at GOP boundary {:?}", slot);
                Admission::Withhold
            }
            GatePhase::Paused | GatePhase::Closed => Admission::Withhold,
            GatePhase::Resuming => {
                let slot = inner.withheld_slot.unwrap_or(out);
                let new_offset = rel.saturating_sub(slot).max(inner.offset);
                let gap = new_offset - inner.offset;

                inner.paused_media += gap;
                inner.offset = new_offset;
                inner.resumed_at = Some(rel);
                inner.withheld_slot = None;
                inner.audio_cut = None;
                inner.phase = GatePhase::Open;

                let out = rel - new_offset;
                inner.last_video = Some(out);
                tracing::debug!("Forwarding resumed at {:?} after {:?} paused", out, gap);
                Admission::Forward(out)
            }
        }
    }

    /// Decide an audio buffer at an anchor-relative timestamp
    pub fn admit_audio(&self, rel: Duration) -> Admission {
        let inner = self.inner.lock();

        match inner.phase {
            GatePhase::Open | GatePhase::PausePending => {
                if inner.resumed_at.is_some_and(|resumed| rel < resumed) || rel < inner.offset {
                    return Admission::Withhold;
                }
                Admission::Forward(rel - inner.offset)
            }
            GatePhase::Paused | GatePhase::Resuming => match inner.audio_cut {
                Some(cut) if rel < cut && rel >= inner.offset => {
                    Admission::Forward(rel - inner.offset)
                }
                _ => Admission::Withhold,
            },
            GatePhase::Closed => Admission::Withhold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    /// Feed frames every `step` ms from `from` to `to` (exclusive)
    fn feed(gate: &ForwardGate, from: u64, to: u64, step: u64) -> Vec<Option<Duration>> {
        (from..to)
            .step_by(step as usize)
            .map(|t| match gate.admit_video(ms(t)) {
                Admission::Forward(out) => Some(out),
                Admission::Withhold => None,
            })
            .collect()
    }

    #[test]
    fn test_open_gate_forwards_unchanged() {
        let gate = ForwardGate::new(FrameRate::Fps30);
        assert_eq!(gate.admit_video(ms(500)), Admission::Forward(ms(500)));
        assert_eq!(gate.admit_audio(ms(510)), Admission::Forward(ms(510)));
    }

    #[test]
    fn test_pause_waits_for_gop_boundary() {
        let gate = ForwardGate::new(FrameRate::Fps30);
        assert!(feed(&gate, 0, 1500, 100).iter().all(Option::is_some));

        assert!(gate.request_pause());
        assert_eq!(gate.phase(), GatePhase::PausePending);

        // Still inside the first GOP
        assert!(feed(&gate, 1500, 2000, 100).iter().all(Option::is_some));
        // 2.0s opens the second GOP
        assert_eq!(gate.admit_video(ms(2000)), Admission::Withhold);
        assert_eq!(gate.phase(), GatePhase::Paused);
        assert!(feed(&gate, 2100, 5000, 100).iter().all(Option::is_none));
    }

    #[test]
    fn test_resume_lands_on_withheld_slot() {
        let gate = ForwardGate::new(FrameRate::Fps30);
        feed(&gate, 0, 1900, 100);
        gate.request_pause();
        feed(&gate, 1900, 5000, 100);

        assert!(gate.resume());
        assert_eq!(gate.phase(), GatePhase::Resuming);
        assert_eq!(gate.admit_video(ms(5000)), Admission::Forward(ms(2000)));
        assert_eq!(gate.admit_video(ms(5100)), Admission::Forward(ms(2100)));
        assert_eq!(gate.offset(), ms(3000));
        assert_eq!(gate.paused_media(), ms(3000));
    }

    #[test]
    fn test_timestamps_never_regress_across_pauses() {
        let gate = ForwardGate::new(FrameRate::Fps30);
        let mut forwarded = Vec::new();

        forwarded.extend(feed(&gate, 0, 2500, 33));
        gate.request_pause();
        forwarded.extend(feed(&gate, 2500, 7000, 33));
        gate.resume();
        forwarded.extend(feed(&gate, 7000, 9000, 33));
        gate.request_pause();
        forwarded.extend(feed(&gate, 9000, 12000, 33));
        gate.resume();
        forwarded.extend(feed(&gate, 12000, 13000, 33));

        let out: Vec<Duration> = forwarded.into_iter().flatten().collect();
        assert!(out.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_audio_follows_video_cut() {
        let gate = ForwardGate::new(FrameRate::Fps30);
        feed(&gate, 0, 1900, 100);
        gate.request_pause();
        feed(&gate, 1900, 2100, 100);

        // Audio captured before the boundary still drains
        assert_eq!(gate.admit_audio(ms(1950)), Admission::Forward(ms(1950)));
        assert_eq!(gate.admit_audio(ms(2500)), Admission::Withhold);

        gate.resume();
        // Withheld until the first resumed video frame
        assert_eq!(gate.admit_audio(ms(4950)), Admission::Withhold);
        gate.admit_video(ms(5000));
        assert_eq!(gate.admit_audio(ms(4990)), Admission::Withhold);
        assert_eq!(gate.admit_audio(ms(5050)), Admission::Forward(ms(2050)));
    }

    #[test]
    fn test_resume_before_boundary_cancels_pause() {
        let gate = ForwardGate::new(FrameRate::Fps30);
        feed(&gate, 0, 1000, 100);
        gate.request_pause();
        assert!(gate.resume());
        assert_eq!(gate.phase(), GatePhase::Open);
        assert_eq!(gate.admit_video(ms(2000)), Admission::Forward(ms(2000)));
        assert_eq!(gate.paused_media(), Duration::ZERO);
    }

    #[test]
    fn test_closed_gate_withholds_everything() {
        let gate = ForwardGate::new(FrameRate::Fps60);
        gate.close();
        assert!(!gate.request_pause());
        assert_eq!(gate.admit_video(ms(0)), Admission::Withhold);
        assert_eq!(gate.admit_audio(ms(0)), Admission::Withhold);
    }
}
