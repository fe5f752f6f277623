//! Recording progress, shared with whoever displays it
//!
//! `RecordingProgress` is a set of atomics a UI can poll. `ProgressReporter` lives on the
//! render thread and prints the scrapeable progress line.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use atomic_float::AtomicF64;

use crate::utils::format_duration;

const STEP_PERCENT: u32 = 5;
const UNKNOWN_TOTAL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct RecordingProgress {
    pub frames: Arc<AtomicU64>,
    /// Virtual milliseconds recorded
    pub recorded_ms: Arc<AtomicF64>,
    /// Expected length in virtual milliseconds, 0 when unknown
    pub total_ms: Arc<AtomicF64>,
    pub is_cancelled: Arc<AtomicBool>,
    pub is_complete: Arc<AtomicBool>,
    fps_history: Arc<Mutex<VecDeque<(Instant, u64)>>>,
}

impl Default for RecordingProgress {
    fn default() -> Self {
        Self {
            frames: Arc::new(AtomicU64::new(0)),
            recorded_ms: Arc::new(AtomicF64::new(0.0)),
            total_ms: Arc::new(AtomicF64::new(0.0)),
            is_cancelled: Arc::new(AtomicBool::new(false)),
            is_complete: Arc::new(AtomicBool::new(false)),
            fps_history: Arc::new(Mutex::new(VecDeque::new())),
        }
    }
}

impl RecordingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fraction done, 0 when the length is unknown
    pub fn progress(&self) -> f32 {
        let total = self.total_ms.load(Ordering::Relaxed);
        if total <= 0.0 {
            return 0.0;
        }
        (self.recorded_ms.load(Ordering::Relaxed) / total).clamp(0.0, 1.0) as f32
    }

    pub fn cancel(&self) {
        self.is_cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.is_cancelled.load(Ordering::Relaxed)
    }

    /// Sliding window frames per second and ETA in seconds
    pub fn get_performance_stats(&self) -> Option<(f64, u64)> {
        let current = self.frames.load(Ordering::Relaxed);
        if current == 0 {
            return None;
        }

        let mut history = self.fps_history.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        history.push_back((now, current));

        // Keep last 1.5s for a smooth window
        while history.len() > 2 && now.duration_since(history.front()?.0).as_secs_f64() > 1.5 {
            history.pop_front();
        }

        let (start_time, start_frame) = history.front()?;
        let (end_time, end_frame) = history.back()?;
        let dt = end_time.duration_since(*start_time).as_secs_f64();
        if dt < 0.1 {
            return None;
        }

        let fps = (end_frame - start_frame) as f64 / dt;
        let total = self.total_ms.load(Ordering::Relaxed);
        let remaining_ms = (total - self.recorded_ms.load(Ordering::Relaxed)).max(0.0);
        let frame_ms = self.recorded_ms.load(Ordering::Relaxed) / current as f64;
        let eta = if fps > 0.1 && frame_ms > 0.0 {
            (remaining_ms / frame_ms / fps) as u64
        } else {
            0
        };
        Some((fps, eta))
    }
}

/// Emits `Progress: <pct>%, Speed: <x>x, ETA: <h:mm:ss>` every 5% of the recording
pub struct ProgressReporter {
    progress: RecordingProgress,
    last_step: u32,
    last_log: Instant,
    last_logged_ms: f64,
}

impl ProgressReporter {
    pub fn new(progress: RecordingProgress) -> Self {
        Self {
            progress,
            last_step: 0,
            last_log: Instant::now(),
            last_logged_ms: 0.0,
        }
    }

    pub fn progress(&self) -> &RecordingProgress {
        &self.progress
    }

    /// Record one emitted frame at virtual time `recorded_ms`
    pub fn frame(&mut self, recorded_ms: f64) {
        self.progress.frames.fetch_add(1, Ordering::Relaxed);
        self.progress.recorded_ms.store(recorded_ms, Ordering::Relaxed);
        if let Some(line) = self.line(recorded_ms, Instant::now()) {
            tracing::info!("{line}");
        }
    }

    fn line(&mut self, recorded_ms: f64, now: Instant) -> Option<String> {
        let total = self.progress.total_ms.load(Ordering::Relaxed);
        let real = now.duration_since(self.last_log).as_secs_f64();

        if total <= 0.0 {
            if now.duration_since(self.last_log) < UNKNOWN_TOTAL_INTERVAL {
                return None;
            }
            let speed = speed(recorded_ms - self.last_logged_ms, real);
            self.mark(recorded_ms, now);
            return Some(format!(
                "Progress: {}, Speed: {speed:.2}x",
                format_duration(recorded_ms / 1000.0)
            ));
        }

        let percent = ((recorded_ms / total) * 100.0).clamp(0.0, 100.0);
        let step = percent as u32 / STEP_PERCENT;
        if step <= self.last_step {
            return None;
        }
        self.last_step = step;

        let speed = speed(recorded_ms - self.last_logged_ms, real);
        let eta = if speed > 0.0 {
            (total - recorded_ms).max(0.0) / 1000.0 / speed
        } else {
            0.0
        };
        self.mark(recorded_ms, now);
        Some(format!(
            "Progress: {}%, Speed: {speed:.2}x, ETA: {}",
            step * STEP_PERCENT,
            format_duration(eta)
        ))
    }

    fn mark(&mut self, recorded_ms: f64, now: Instant) {
        self.last_log = now;
        self.last_logged_ms = recorded_ms;
    }
}

/// Virtual time recorded per unit of wall clock time
fn speed(virtual_ms: f64, real_secs: f64) -> f64 {
    if real_secs <= 0.0 {
        return 0.0;
    }
    virtual_ms / 1000.0 / real_secs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logs_once_per_five_percent() {
        let progress = RecordingProgress::new();
        progress.total_ms.store(10_000.0, Ordering::Relaxed);
        let mut reporter = ProgressReporter::new(progress.clone());
        let start = reporter.last_log;

        let mut lines = Vec::new();
        for i in 1..=600u32 {
            let t = i as f64 * 1000.0 / 60.0;
            let now = start + Duration::from_millis(i as u64 * 8);
            if let Some(line) = reporter.line(t, now) {
                lines.push(line);
            }
        }
        assert_eq!(lines.len(), 20);
        assert!(lines[0].starts_with("Progress: 5%, Speed: 2.08x, ETA: 0:00:0"), "{}", lines[0]);
        assert!(lines[19].starts_with("Progress: 100%"), "{}", lines[19]);
        assert!(lines[19].ends_with("ETA: 0:00:00"));
    }

    #[test]
    fn unknown_length_logs_by_wall_clock() {
        let mut reporter = ProgressReporter::new(RecordingProgress::new());
        let start = reporter.last_log;
        assert!(reporter.line(500.0, start + Duration::from_millis(200)).is_none());
        let line = reporter
            .line(2000.0, start + Duration::from_millis(1000))
            .expect("line after a second");
        assert_eq!(line, "Progress: 0:00:02, Speed: 2.00x");
    }

    #[test]
    fn fraction_done() {
        let progress = RecordingProgress::new();
        assert_eq!(progress.progress(), 0.0);
        progress.total_ms.store(2000.0, Ordering::Relaxed);
        progress.recorded_ms.store(500.0, Ordering::Relaxed);
        assert!((progress.progress() - 0.25).abs() < 1e-6);
        assert!(progress.get_performance_stats().is_none());
    }
}
