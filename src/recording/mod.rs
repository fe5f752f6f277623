//! Offline capture and encode pipeline
//!
//! Frames are read back from the capture device, optionally blended, converted and streamed to
//! one ffmpeg process; mixed audio goes to a second one. Both elementary streams are remuxed into
//! the final container when the recording stops.

pub mod audio;
pub mod blend_weights;
pub mod capability;
pub mod ffmpeg_args;
pub mod ffmpeg_log;
pub mod host_readback;
pub mod limiter;
pub mod motion_blur;
pub mod muxer;
pub mod named_pipe;
pub mod pipeline;
pub mod pixel_format;
pub mod progress;
pub mod rate_governor;
pub mod readback;
pub mod readback_worker;
pub mod stream_writer;
#[cfg(feature = "vulkan")]
pub mod vulkan_readback;

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::settings::codecs::{AudioCodecOptions, VideoCodecOptions};

use self::audio::AudioFormat;
use self::blend_weights::BlendWeights;
use self::pixel_format::PixelFormat;
use self::stream_writer::PipeTransport;

/// Output container of the final file and of both intermediates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    Mp4,
    Mkv,
    Mov,
}

impl Container {
    pub fn parse(name: &str) -> Result<Self, ConfigError> {
        match name.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "mp4" => Ok(Container::Mp4),
            "mkv" => Ok(Container::Mkv),
            "mov" => Ok(Container::Mov),
            other => Err(ConfigError::UnsupportedContainer(other.to_string())),
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Container::Mp4 => "mp4",
            Container::Mkv => "mkv",
            Container::Mov => "mov",
        }
    }

    /// Whether remuxing should move the index to the front
    pub fn faststart(self) -> bool {
        self == Container::Mp4
    }
}

/// Validated, immutable description of one recording
#[derive(Debug, Clone)]
pub struct RecordingPlan {
    pub ffmpeg: PathBuf,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Wall clock cap on emitted frames per second, 0 for none
    pub encoding_fps_cap: u32,
    pub video_codec: VideoCodecOptions,
    pub video_args: Vec<String>,
    pub pixel_format: PixelFormat,
    pub video_filters: String,
    pub audio_codec: AudioCodecOptions,
    pub audio_args: Vec<String>,
    pub audio_filters: String,
    pub audio: AudioFormat,
    pub container: Container,
    pub output_dir: PathBuf,
    pub show_ffmpeg_logs: bool,
    /// Blend weights when motion blur is on; their count is the oversample multiplier
    pub motion_blur: Option<BlendWeights>,
    pub video_buffers: usize,
    pub audio_buffers: usize,
    pub transport: PipeTransport,
    pub startup_timeout: Duration,
    pub startup_probe: Duration,
}

impl RecordingPlan {
    /// Sub-frames captured per emitted frame
    pub fn oversample(&self) -> usize {
        self.motion_blur.as_ref().map_or(1, |w| w.len().max(1))
    }

    /// Rate the capture device is driven at
    pub fn capture_fps(&self) -> f64 {
        self.fps as f64 * self.oversample() as f64
    }

    pub fn paths(&self, name: &str) -> RecordingPaths {
        RecordingPaths::new(&self.output_dir, name, self.container)
    }
}

/// Where a recording's intermediates and final file live
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingPaths {
    pub temp_dir: PathBuf,
    pub video: PathBuf,
    pub audio: PathBuf,
    pub output: PathBuf,
}

impl RecordingPaths {
    pub fn new(output_dir: &Path, name: &str, container: Container) -> Self {
        let ext = container.extension();
        let temp_dir = output_dir.join(format!("{name}_temp"));
        Self {
            video: temp_dir.join(format!("video.{ext}")),
            audio: temp_dir.join(format!("audio.{ext}")),
            output: output_dir.join(format!("{name}.{ext}")),
            temp_dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_names() {
        assert_eq!(Container::parse("MP4"), Ok(Container::Mp4));
        assert_eq!(Container::parse(".mkv"), Ok(Container::Mkv));
        assert_eq!(
            Container::parse("avi"),
            Err(ConfigError::UnsupportedContainer("avi".into()))
        );
        assert!(Container::Mp4.faststart());
        assert!(!Container::Mov.faststart());
    }

    #[test]
    fn temp_layout() {
        let paths = RecordingPaths::new(Path::new("videos"), "take1", Container::Mkv);
        assert_eq!(paths.temp_dir, Path::new("videos/take1_temp"));
        assert_eq!(paths.video, Path::new("videos/take1_temp/video.mkv"));
        assert_eq!(paths.audio, Path::new("videos/take1_temp/audio.mkv"));
        assert_eq!(paths.output, Path::new("videos/take1.mkv"));
    }
}
