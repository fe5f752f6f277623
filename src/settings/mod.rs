//! Recording settings, persisted as TOML
//!
//! Every section has serde defaults so a partial file (or none at all) still loads.
//! [`RecordingSettings::plan`] validates everything and produces the immutable
//! [`RecordingPlan`] a recording runs from.

pub mod codecs;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{ConfigError, RecordingError};
use crate::recording::audio::AudioFormat;
use crate::recording::blend_weights::{BlendFunction, BlendWeights};
use crate::recording::ffmpeg_args::detect_hw_encoder;
use crate::recording::pixel_format::PixelFormat;
use crate::recording::stream_writer::PipeTransport;
use crate::recording::{Container, RecordingPlan};

use self::codecs::{
    AacSettings, AudioCodecOptions, CustomCodecSettings, EncoderOptions, FlacSettings,
    Mp3Settings, NvencOptions, NvencSettings, OpusSettings, QsvOptions, QsvSettings,
    SvtAv1Settings, VideoCodecOptions, X26xOptions, X26xSettings,
};

const CONFIG_FILE: &str = "recording.toml";
const MAX_OVERSAMPLE: i64 = 1024;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("no configuration directory available on this system")]
    NoConfigDir,
    #[error("failed to read {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("failed to write {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionBlurSettings {
    pub enabled: bool,
    pub oversample_multiplier: i64,
    /// Index into the blend curve catalogue, unknown ids fall back to flat
    pub blend_function_id: i64,
    pub gauss_weights_mult: f64,
    /// Space separated weights overriding the curve; must have one weight per sub-frame
    pub manual_weights: String,
}

impl Default for MotionBlurSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            oversample_multiplier: 16,
            blend_function_id: 27,
            gauss_weights_mult: 1.5,
            manual_weights: String::new(),
        }
    }
}

impl MotionBlurSettings {
    /// `None` when blur is off or the multiplier is 1
    pub fn weights(&self) -> Result<Option<BlendWeights>, ConfigError> {
        if !self.enabled {
            return Ok(None);
        }
        if !(1..=MAX_OVERSAMPLE).contains(&self.oversample_multiplier) {
            return Err(ConfigError::OutOfRange {
                param: "oversample multiplier",
                min: 1,
                max: MAX_OVERSAMPLE,
                value: self.oversample_multiplier,
            });
        }
        let count = self.oversample_multiplier as usize;
        if count == 1 {
            return Ok(None);
        }
        if !self.manual_weights.trim().is_empty() {
            return BlendWeights::from_manual(&self.manual_weights, count).map(Some);
        }
        Ok(Some(BlendWeights::from_curve(
            BlendFunction::from_id(self.blend_function_id),
            count,
            self.gauss_weights_mult,
        )))
    }
}

/// Buffering and process plumbing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub video_buffers: usize,
    pub audio_buffers: usize,
    pub audio_chunk_rate: u32,
    pub sample_rate: u32,
    pub channels: u16,
    pub transport: PipeTransport,
    pub startup_timeout_ms: u64,
    pub startup_probe_ms: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            video_buffers: 10,
            audio_buffers: 2000,
            audio_chunk_rate: 1000,
            sample_rate: 48_000,
            channels: 2,
            transport: PipeTransport::Auto,
            startup_timeout_ms: 10_000,
            startup_probe_ms: 150,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingSettings {
    /// ffmpeg binary, looked up on `PATH` when unset
    pub ffmpeg_path: Option<PathBuf>,
    pub frame_width: u32,
    pub frame_height: u32,
    pub fps: u32,
    pub encoding_fps_cap: u32,

    /// Video codec name, `auto` or `custom`
    pub encoder: String,
    pub libx264: X26xSettings,
    pub libx265: X26xSettings,
    pub h264_nvenc: NvencSettings,
    pub hevc_nvenc: NvencSettings,
    pub av1_nvenc: NvencSettings,
    pub h264_qsv: QsvSettings,
    pub hevc_qsv: QsvSettings,
    pub libsvtav1: SvtAv1Settings,
    pub custom_video: CustomCodecSettings,
    pub pixel_format: String,
    pub video_filters: String,

    pub audio_codec: String,
    pub aac: AacSettings,
    pub libmp3lame: Mp3Settings,
    pub libopus: OpusSettings,
    pub flac: FlacSettings,
    pub custom_audio: CustomCodecSettings,
    pub audio_filters: String,

    pub output_dir: PathBuf,
    pub container: String,
    pub show_ffmpeg_logs: bool,
    pub motion_blur: MotionBlurSettings,
    pub pipeline: PipelineSettings,
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            frame_width: 1920,
            frame_height: 1080,
            fps: 60,
            encoding_fps_cap: 0,
            encoder: "libx264".into(),
            libx264: X26xSettings {
                profile: "high".into(),
                ..Default::default()
            },
            libx265: X26xSettings {
                crf: 18,
                preset: "fast".into(),
                ..Default::default()
            },
            h264_nvenc: NvencSettings {
                profile: "high".into(),
                ..Default::default()
            },
            hevc_nvenc: NvencSettings::default(),
            av1_nvenc: NvencSettings::default(),
            h264_qsv: QsvSettings::default(),
            hevc_qsv: QsvSettings::default(),
            libsvtav1: SvtAv1Settings::default(),
            custom_video: CustomCodecSettings::default(),
            pixel_format: "yuv420p".into(),
            video_filters: String::new(),
            audio_codec: "aac".into(),
            aac: AacSettings::default(),
            libmp3lame: Mp3Settings::default(),
            libopus: OpusSettings::default(),
            flac: FlacSettings::default(),
            custom_audio: CustomCodecSettings::default(),
            audio_filters: String::new(),
            output_dir: PathBuf::from("videos"),
            container: "mp4".into(),
            show_ffmpeg_logs: false,
            motion_blur: MotionBlurSettings::default(),
            pipeline: PipelineSettings::default(),
        }
    }
}

impl RecordingSettings {
    fn config_path() -> Result<PathBuf, SettingsError> {
        ProjectDirs::from("rs", "", "replay-recorder")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
            .ok_or(SettingsError::NoConfigDir)
    }

    /// Load the user's settings, writing defaults on first run. A broken file is reported and
    /// replaced by defaults in memory.
    pub fn new_or_load() -> Result<Self, SettingsError> {
        let path = Self::config_path()?;
        if !path.exists() {
            let settings = Self::default();
            settings.save_to_file(&path)?;
            tracing::info!(path = %path.display(), "wrote default recording settings");
            return Ok(settings);
        }
        match Self::load_from(&path) {
            Ok(settings) => Ok(settings),
            Err(e @ SettingsError::Parse { .. }) => {
                tracing::warn!(error = %e, "using default recording settings");
                Ok(Self::default())
            }
            Err(e) => Err(e),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, SettingsError> {
        let text = fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), SettingsError> {
        let text = toml::to_string_pretty(self)?;
        let write_err = |source| SettingsError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        fs::write(path, text).map_err(write_err)
    }

    pub fn ffmpeg(&self) -> PathBuf {
        self.ffmpeg_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("ffmpeg"))
    }

    /// Option set of the named video encoder
    pub fn video_options(&self, encoder: &str) -> Result<VideoCodecOptions, ConfigError> {
        let x26x = |codec, settings: &X26xSettings| X26xOptions {
            codec,
            settings: settings.clone(),
        };
        let nvenc = |codec, settings: &NvencSettings| NvencOptions {
            codec,
            settings: settings.clone(),
        };
        let qsv = |codec, settings: &QsvSettings| QsvOptions {
            codec,
            settings: settings.clone(),
        };
        Ok(match encoder {
            "libx264" => x26x("libx264", &self.libx264).into(),
            "libx265" => x26x("libx265", &self.libx265).into(),
            "h264_nvenc" => nvenc("h264_nvenc", &self.h264_nvenc).into(),
            "hevc_nvenc" => nvenc("hevc_nvenc", &self.hevc_nvenc).into(),
            "av1_nvenc" => nvenc("av1_nvenc", &self.av1_nvenc).into(),
            "h264_qsv" => qsv("h264_qsv", &self.h264_qsv).into(),
            "hevc_qsv" => qsv("hevc_qsv", &self.hevc_qsv).into(),
            "libsvtav1" => self.libsvtav1.clone().into(),
            "custom" => VideoCodecOptions::from(self.custom_video.clone()),
            other => return Err(ConfigError::UnknownEncoder(other.to_string())),
        })
    }

    /// Option set of the named audio encoder
    pub fn audio_options(&self, codec: &str) -> Result<AudioCodecOptions, ConfigError> {
        Ok(match codec {
            "aac" => self.aac.clone().into(),
            "libmp3lame" | "mp3" => self.libmp3lame.clone().into(),
            "libopus" | "opus" => self.libopus.clone().into(),
            "flac" => self.flac.clone().into(),
            "custom" => AudioCodecOptions::from(self.custom_audio.clone()),
            other => return Err(ConfigError::UnknownEncoder(other.to_string())),
        })
    }

    /// Validate everything and resolve `auto` encoders. Nothing is spawned except the hardware
    /// probe behind `encoder = "auto"`.
    pub fn plan(&self) -> Result<RecordingPlan, RecordingError> {
        if self.frame_width == 0 || self.frame_height == 0 {
            return Err(RecordingError::config(
                "frame size",
                ConfigError::Invalid(format!(
                    "{}x{} is not a valid frame size",
                    self.frame_width, self.frame_height
                )),
            ));
        }
        if self.fps == 0 {
            return Err(RecordingError::config(
                "fps",
                ConfigError::Invalid("fps must be positive".into()),
            ));
        }

        let ffmpeg = self.ffmpeg();
        let mut encoder = self.encoder.trim().to_ascii_lowercase();
        if encoder == "auto" {
            encoder = detect_hw_encoder(&ffmpeg).to_string();
        }
        let video_context = format!("video encoder {encoder}");
        let video_codec = self
            .video_options(&encoder)
            .map_err(|e| RecordingError::config(&video_context, e))?;
        let video_args = video_codec
            .ffmpeg_args()
            .map_err(|e| RecordingError::config(&video_context, e))?;

        let mut pixel_format = PixelFormat::from_ffmpeg_name(&self.pixel_format).ok_or_else(|| {
            RecordingError::config(
                "pixel format",
                ConfigError::UnknownPixelFormat(self.pixel_format.clone()),
            )
        })?;
        if let Some(forced) = video_codec.forced_pixel_format() {
            if forced != pixel_format {
                tracing::info!(
                    encoder = %encoder,
                    "using pixel format {} instead of {}",
                    forced.ffmpeg_name(),
                    pixel_format.ffmpeg_name()
                );
                pixel_format = forced;
            }
        }

        let audio_name = self.audio_codec.trim().to_ascii_lowercase();
        let audio_context = format!("audio encoder {audio_name}");
        let audio_codec = self
            .audio_options(&audio_name)
            .map_err(|e| RecordingError::config(&audio_context, e))?;
        let audio_args = audio_codec
            .ffmpeg_args()
            .map_err(|e| RecordingError::config(&audio_context, e))?;

        let p = &self.pipeline;
        let audio = AudioFormat::new(p.sample_rate, p.channels, p.audio_chunk_rate)
            .map_err(|e| RecordingError::config("audio format", e))?;
        let container = Container::parse(&self.container)
            .map_err(|e| RecordingError::config("container", e))?;
        let motion_blur = self
            .motion_blur
            .weights()
            .map_err(|e| RecordingError::config("motion blur", e))?;

        Ok(RecordingPlan {
            ffmpeg,
            width: self.frame_width,
            height: self.frame_height,
            fps: self.fps,
            encoding_fps_cap: self.encoding_fps_cap,
            video_codec,
            video_args,
            pixel_format,
            video_filters: self.video_filters.trim().to_string(),
            audio_codec,
            audio_args,
            audio_filters: self.audio_filters.trim().to_string(),
            audio,
            container,
            output_dir: self.output_dir.clone(),
            show_ffmpeg_logs: self.show_ffmpeg_logs,
            motion_blur,
            video_buffers: p.video_buffers.max(1),
            audio_buffers: p.audio_buffers.max(1),
            transport: p.transport,
            startup_timeout: Duration::from_millis(p.startup_timeout_ms),
            startup_probe: Duration::from_millis(p.startup_probe_ms),
        })
    }
}
