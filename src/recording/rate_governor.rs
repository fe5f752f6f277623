//! Video and audio cadences derived from one virtual clock

/// Work due after one virtual clock step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Emissions {
    pub video_frames: u32,
    pub audio_chunks: u32,
}

/// Two phase-locked accumulators fed by the same virtual delta.
///
/// Both subtract their interval instead of resetting, so fractional remainders carry over and
/// the streams never drift apart.
#[derive(Debug, Clone)]
pub struct RateGovernor {
    video_interval: f64,
    audio_interval: f64,
    video_acc: f64,
    audio_acc: f64,
    elapsed: f64,
}

impl RateGovernor {
    /// `capture_fps` is the rate frames are captured at (output fps times the oversample
    /// multiplier). The first frame is due immediately.
    pub fn new(capture_fps: f64, audio_chunk_rate: f64) -> Self {
        let video_interval = 1000.0 / capture_fps.max(f64::MIN_POSITIVE);
        Self {
            video_interval,
            audio_interval: 1000.0 / audio_chunk_rate.max(f64::MIN_POSITIVE),
            video_acc: video_interval,
            audio_acc: 0.0,
            elapsed: 0.0,
        }
    }

    /// Preferred virtual step for a driver loop, fine enough for both cadences
    pub fn tick_interval(&self) -> f64 {
        self.video_interval.min(self.audio_interval).min(1.0)
    }

    pub fn video_interval(&self) -> f64 {
        self.video_interval
    }

    pub fn audio_interval(&self) -> f64 {
        self.audio_interval
    }

    /// Virtual milliseconds advanced so far
    pub fn elapsed(&self) -> f64 {
        self.elapsed
    }

    pub fn advance(&mut self, delta_ms: f64) -> Emissions {
        let delta = delta_ms.max(0.0);
        self.elapsed += delta;
        self.audio_acc += delta;
        self.video_acc += delta;

        let mut emissions = Emissions::default();
        while self.audio_acc >= self.audio_interval {
            self.audio_acc -= self.audio_interval;
            emissions.audio_chunks += 1;
        }
        while self.video_acc >= self.video_interval {
            self.video_acc -= self.video_interval;
            emissions.video_frames += 1;
        }
        emissions
    }
}
