//! Recording driver
//!
//! A `RecordingPipeline` owns everything one recording needs: the readback pool and its worker,
//! both encoder writers, the audio chunk pool, the shared failure slot and the temp directory.
//! The driver calls [`advance`](RecordingPipeline::advance) once per simulation tick with the
//! virtual time step and finally [`stop`](RecordingPipeline::stop) or
//! [`abort`](RecordingPipeline::abort).

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::audio::{AudioChunk, AudioChunkPool, AudioMixer};
use super::capability::EncoderCatalog;
use super::ffmpeg_args;
use super::limiter::FrameLimiter;
use super::motion_blur::MotionBlurAccumulator;
use super::muxer::{self, Muxer};
use super::progress::{ProgressReporter, RecordingProgress};
use super::rate_governor::{Emissions, RateGovernor};
use super::readback::{CaptureLayout, GpuReadbackPool, PoolStats, ReadbackDevice};
use super::readback_worker::{ReadbackWorker, VideoFrame, WorkerReport};
use super::stream_writer::{StreamWriter, WriterStats};
use super::{RecordingPaths, RecordingPlan};
use crate::error::{CaptureError, ConfigError, FailureSlot, RecordingError, StreamKind};
use crate::settings::codecs::EncoderOptions;
use crate::utils::timestamp_name;

/// How long each outstanding copy gets to finish when a recording is aborted
const DISCARD_TIMEOUT: Duration = Duration::from_secs(1);

/// Draws the scene at a given virtual time into the device's render target
pub trait FrameRenderer<D: ReadbackDevice> {
    fn draw(&mut self, device: &mut D, virtual_time_ms: f64) -> Result<(), CaptureError>;
}

/// What a finished recording produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingSummary {
    /// Final container, `None` when the remux failed
    pub output: Option<PathBuf>,
    /// Frames written to the video encoder
    pub video_frames: u64,
    /// Frames captured, including motion blur sub-frames
    pub captured_frames: u64,
    pub audio_chunks: u64,
    /// Sub-frames of an incomplete blur window dropped at stop
    pub dropped_sub_frames: u64,
    pub remux_warning: Option<String>,
}

pub struct RecordingPipeline<D: ReadbackDevice, M: AudioMixer> {
    plan: RecordingPlan,
    paths: RecordingPaths,
    layout: CaptureLayout,
    pool: GpuReadbackPool<D>,
    governor: RateGovernor,
    mixer: M,
    audio_pool: AudioChunkPool,
    video: StreamWriter<VideoFrame<D::Buffer>>,
    audio: StreamWriter<AudioChunk>,
    worker: Option<JoinHandle<WorkerReport>>,
    report: WorkerReport,
    failure: FailureSlot,
    reporter: ProgressReporter,
    limiter: FrameLimiter,
    captured: u64,
    audio_chunks: u64,
    finished: bool,
}

impl<D: ReadbackDevice, M: AudioMixer> RecordingPipeline<D, M> {
    /// Validate the capture device against the plan, check the encoders exist, spawn both
    /// encoders and start the readback worker. `name` defaults to a local timestamp.
    pub fn start(plan: RecordingPlan, device: D, mixer: M, name: Option<&str>) -> Result<Self, RecordingError> {
        let layout = device.layout();
        if (layout.width, layout.height) != (plan.width, plan.height) {
            return Err(RecordingError::config(
                "capture device",
                ConfigError::Invalid(format!(
                    "device renders {}x{} but the recording is {}x{}",
                    layout.width, layout.height, plan.width, plan.height
                )),
            ));
        }

        let catalog = EncoderCatalog::query(&plan.ffmpeg)?;
        catalog.require(StreamKind::Video, plan.video_codec.codec())?;
        catalog.require(StreamKind::Audio, plan.audio_codec.codec())?;

        let name = name.map_or_else(timestamp_name, str::to_string);
        let paths = plan.paths(&name);
        fs::create_dir_all(&paths.temp_dir).map_err(|e| {
            RecordingError::startup(
                StreamKind::Video,
                format!("failed to create {}: {e}", paths.temp_dir.display()),
            )
        })?;

        match Self::launch(plan, paths.clone(), layout, device, mixer) {
            Ok(pipeline) => Ok(pipeline),
            Err(e) => {
                muxer::cleanup(&paths);
                Err(e)
            }
        }
    }

    fn launch(
        plan: RecordingPlan,
        paths: RecordingPaths,
        layout: CaptureLayout,
        device: D,
        mixer: M,
    ) -> Result<Self, RecordingError> {
        let failure = FailureSlot::new();
        let pool = GpuReadbackPool::new(device, plan.video_buffers)?;

        let mut video = StreamWriter::new(
            StreamKind::Video,
            ffmpeg_args::video_launch(&plan, &layout, &paths),
            plan.video_buffers,
            failure.clone(),
        );
        video.start()?;
        let mut audio = StreamWriter::new(
            StreamKind::Audio,
            ffmpeg_args::audio_launch(&plan, &paths),
            plan.audio_buffers,
            failure.clone(),
        );
        audio.start()?;

        let video_queue = video
            .queue()
            .ok_or_else(|| RecordingError::startup(StreamKind::Video, "video writer is not streaming"))?;
        let blur = plan
            .motion_blur
            .clone()
            .map(|weights| MotionBlurAccumulator::new(weights, layout.frame_len()));
        let worker = ReadbackWorker::new(
            pool.queue(),
            video_queue,
            layout,
            plan.pixel_format,
            blur,
            failure.clone(),
        )
        .spawn()
        .map_err(|e| {
            RecordingError::startup(StreamKind::Video, format!("failed to start readback worker: {e}"))
        })?;

        let audio_pool = AudioChunkPool::new(plan.audio_buffers, plan.audio.chunk_len());
        let governor = RateGovernor::new(plan.capture_fps(), plan.audio.chunk_rate as f64);
        let limiter = FrameLimiter::new(plan.encoding_fps_cap);

        tracing::info!(
            output = %paths.output.display(),
            width = plan.width,
            height = plan.height,
            fps = plan.fps,
            oversample = plan.oversample(),
            video = plan.video_codec.codec(),
            audio = plan.audio_codec.codec(),
            "recording started"
        );

        Ok(Self {
            plan,
            paths,
            layout,
            pool,
            governor,
            mixer,
            audio_pool,
            video,
            audio,
            worker: Some(worker),
            report: WorkerReport::default(),
            failure,
            reporter: ProgressReporter::new(RecordingProgress::new()),
            limiter,
            captured: 0,
            audio_chunks: 0,
            finished: false,
        })
    }

    pub fn plan(&self) -> &RecordingPlan {
        &self.plan
    }

    pub fn paths(&self) -> &RecordingPaths {
        &self.paths
    }

    pub fn layout(&self) -> CaptureLayout {
        self.layout
    }

    /// Shared progress handle for a UI
    pub fn progress(&self) -> RecordingProgress {
        self.reporter.progress().clone()
    }

    /// Expected length of the recording, enables percentages and ETA in progress lines
    pub fn set_expected_duration(&self, virtual_ms: f64) {
        self.reporter
            .progress()
            .total_ms
            .store(virtual_ms.max(0.0), Ordering::Relaxed);
    }

    /// Virtual step a driver loop should use
    pub fn tick_interval(&self) -> f64 {
        self.governor.tick_interval()
    }

    /// Virtual milliseconds advanced so far
    pub fn elapsed_ms(&self) -> f64 {
        self.governor.elapsed()
    }

    pub fn frames_captured(&self) -> u64 {
        self.captured
    }

    /// Output frames completed so far (captured frames divided by the oversample multiplier)
    pub fn frames_emitted(&self) -> u64 {
        self.captured / self.plan.oversample() as u64
    }

    pub fn audio_chunks(&self) -> u64 {
        self.audio_chunks
    }

    pub fn video_stats(&self) -> Arc<WriterStats> {
        self.video.stats()
    }

    pub fn audio_stats(&self) -> Arc<WriterStats> {
        self.audio.stats()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn audio_pool_stats(&self) -> PoolStats {
        self.audio_pool.stats()
    }

    /// Advance the virtual clock by `delta_ms`, producing every audio chunk and frame now due
    pub fn advance<R: FrameRenderer<D>>(&mut self, delta_ms: f64, renderer: &mut R) -> Result<Emissions, RecordingError> {
        self.check()?;
        let due = self.governor.advance(delta_ms);
        for _ in 0..due.audio_chunks {
            self.push_audio()?;
        }
        for _ in 0..due.video_frames {
            self.capture(renderer)?;
        }
        self.check()?;
        Ok(due)
    }

    fn push_audio(&mut self) -> Result<(), RecordingError> {
        let Some(mut chunk) = self.audio_pool.take(&self.failure) else {
            return Err(self.escalate(RecordingError::stream(
                StreamKind::Audio,
                "audio chunk pool is unavailable",
            )));
        };
        self.mixer.fill(chunk.samples_mut());
        self.audio.push(chunk).map_err(|e| self.escalate(e))?;
        self.audio_chunks += 1;
        Ok(())
    }

    fn capture<R: FrameRenderer<D>>(&mut self, renderer: &mut R) -> Result<(), RecordingError> {
        let virtual_time = self.captured as f64 * self.governor.video_interval();

        let mut frame = match self.pool.begin_frame() {
            Ok(frame) => frame,
            Err(e) => return Err(self.escalate(e.into())),
        };
        if let Err(e) = renderer.draw(frame.device(), virtual_time) {
            drop(frame);
            return Err(self.escalate(e.into()));
        }
        frame.end().map_err(|e| self.escalate(e.into()))?;
        self.captured += 1;

        let oversample = self.plan.oversample() as u64;
        if self.captured % oversample == 0 {
            let emitted = self.captured / oversample;
            self.reporter
                .frame(emitted as f64 * 1000.0 / self.plan.fps as f64);
            self.limiter.sync();
        }
        Ok(())
    }

    /// Prefer the first recorded failure over a follow-up error it caused
    fn escalate(&self, error: RecordingError) -> RecordingError {
        match self.failure.take() {
            Some(first) => {
                tracing::debug!(secondary = %error, "follow-up failure");
                first
            }
            None => error,
        }
    }

    fn check(&self) -> Result<(), RecordingError> {
        if !self.failure.is_tripped() {
            return Ok(());
        }
        Err(self.failure.take().unwrap_or_else(|| {
            RecordingError::stream(StreamKind::Video, "recording has already failed")
        }))
    }

    fn join_worker(&mut self) {
        if let Some(handle) = self.worker.take() {
            match handle.join() {
                Ok(report) => self.report = report,
                Err(_) => self.failure.record(RecordingError::stream(
                    StreamKind::Video,
                    "readback worker panicked",
                )),
            }
        }
    }

    /// Drain everything, stop both encoders and remux. Incomplete motion blur windows are
    /// dropped.
    pub fn stop(mut self) -> Result<RecordingSummary, RecordingError> {
        let result = self.finish();
        if result.is_err() {
            self.shutdown();
        }
        self.finished = true;
        result
    }

    fn finish(&mut self) -> Result<RecordingSummary, RecordingError> {
        self.check()?;
        tracing::info!(
            frames = self.frames_emitted(),
            audio_chunks = self.audio_chunks,
            "stopping recording"
        );

        self.pool.finish();
        self.join_worker();
        self.check()?;

        let video = self.video.finish();
        if let Err(e) = video {
            return Err(self.escalate(e));
        }
        let audio = self.audio.finish();
        if let Err(e) = audio {
            return Err(self.escalate(e));
        }
        self.check()?;

        let progress = self.reporter.progress();
        progress.is_complete.store(true, Ordering::Relaxed);

        let (output, remux_warning) = match Muxer::new(&self.plan.ffmpeg).finalize(&self.paths, self.plan.container) {
            Ok(path) => (Some(path), None),
            Err(e) => (None, Some(e.to_string())),
        };

        Ok(RecordingSummary {
            output,
            video_frames: self.report.emitted,
            captured_frames: self.report.captured,
            audio_chunks: self.audio_chunks,
            dropped_sub_frames: self.report.dropped_sub_frames,
            remux_warning,
        })
    }

    /// Cancel the recording: queues are closed and drained, outstanding copies are waited
    /// for, encoders are killed and the temp directory is removed
    pub fn abort(mut self) {
        tracing::info!("aborting recording");
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.reporter.progress().cancel();

        self.pool.close();
        self.video.abort();
        self.audio.abort();
        self.join_worker();
        let discarded = self.pool.discard_in_flight(DISCARD_TIMEOUT);
        if discarded > 0 {
            tracing::debug!(discarded, "discarded in-flight readbacks");
        }
        muxer::cleanup(&self.paths);
    }
}

impl<D: ReadbackDevice, M: AudioMixer> Drop for RecordingPipeline<D, M> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::host_readback::HostReadback;
    use crate::recording::pixel_format::PixelFormat;
    use crate::settings::RecordingSettings;

    fn plan(dir: &std::path::Path) -> RecordingPlan {
        let mut settings = RecordingSettings::default();
        settings.frame_width = 64;
        settings.frame_height = 32;
        settings.output_dir = dir.to_path_buf();
        settings.ffmpeg_path = Some(dir.join("missing-ffmpeg"));
        settings.plan().expect("plan")
    }

    #[test]
    fn mismatched_device_is_a_config_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let device = HostReadback::new(32, 32, PixelFormat::Bgra);
        let err = RecordingPipeline::start(plan(dir.path()), device, |_: &mut [f32]| {}, Some("take"))
            .err()
            .expect("config error");
        assert!(err.is_config());
    }

    #[test]
    fn missing_ffmpeg_is_a_startup_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let device = HostReadback::new(64, 32, PixelFormat::Bgra);
        let err = RecordingPipeline::start(plan(dir.path()), device, |_: &mut [f32]| {}, Some("take"))
            .err()
            .expect("startup failure");
        assert!(err.is_startup());
        assert!(!dir.path().join("take_temp").exists());
        assert!(!dir.path().join("take.mp4").exists());
    }
}
