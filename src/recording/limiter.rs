//! Wall clock cap on encoded frames per second

use std::time::{Duration, Instant};

pub struct FrameLimiter {
    interval: Option<Duration>,
    next: Option<Instant>,
}

impl FrameLimiter {
    /// `fps_cap == 0` disables the limiter
    pub fn new(fps_cap: u32) -> Self {
        Self {
            interval: (fps_cap > 0).then(|| Duration::from_secs_f64(1.0 / fps_cap as f64)),
            next: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.interval.is_some()
    }

    /// Sleep until the next frame slot
    pub fn sync(&mut self) {
        let Some(interval) = self.interval else {
            return;
        };
        let now = Instant::now();
        let next = match self.next {
            Some(next) if next > now => {
                spin_sleep::sleep(next - now);
                next
            }
            // running late, don't try to catch up
            _ => now,
        };
        self.next = Some(next + interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_limiter_never_sleeps() {
        let mut limiter = FrameLimiter::new(0);
        assert!(!limiter.is_enabled());
        let start = Instant::now();
        for _ in 0..1000 {
            limiter.sync();
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn caps_frame_rate() {
        let mut limiter = FrameLimiter::new(100);
        let start = Instant::now();
        for _ in 0..11 {
            limiter.sync();
        }
        // first call passes immediately, ten intervals follow
        assert!(start.elapsed() >= Duration::from_millis(95));
    }
}
