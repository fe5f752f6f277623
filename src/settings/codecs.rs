//! Per-codec encoder option sets
//!
//! Every set validates its rate control, quality range, preset and profile against a small
//! allow-list and turns them into ffmpeg arguments. Validation never spawns anything.

use enum_dispatch::enum_dispatch;
use serde_derive::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::recording::pixel_format::PixelFormat;

#[enum_dispatch]
pub trait EncoderOptions {
    /// Name passed to `-c:v` / `-c:a`
    fn codec(&self) -> &str;

    /// Validated codec specific arguments
    fn ffmpeg_args(&self) -> Result<Vec<String>, ConfigError>;

    /// Pixel format the encoder insists on, overriding the configured one
    fn forced_pixel_format(&self) -> Option<PixelFormat> {
        None
    }
}

#[enum_dispatch(EncoderOptions)]
#[derive(Debug, Clone, PartialEq)]
pub enum VideoCodecOptions {
    X26x(X26xOptions),
    Nvenc(NvencOptions),
    Qsv(QsvOptions),
    SvtAv1(SvtAv1Settings),
    Custom(CustomCodecSettings),
}

#[enum_dispatch(EncoderOptions)]
#[derive(Debug, Clone, PartialEq)]
pub enum AudioCodecOptions {
    Aac(AacSettings),
    Mp3(Mp3Settings),
    Opus(OpusSettings),
    Flac(FlacSettings),
    Custom(CustomCodecSettings),
}

const X26X_PRESETS: &[&str] = &[
    "ultrafast", "superfast", "veryfast", "faster", "fast", "medium", "slow", "slower",
    "veryslow", "placebo",
];
const X264_PROFILES: &[&str] = &["baseline", "main", "high"];
const X265_PROFILES: &[&str] = &["main", "main10", "main12"];
const NVENC_PRESETS: &[&str] = &["slow", "medium", "fast", "p1", "p2", "p3", "p4", "p5", "p6", "p7"];
const NVENC_H264_PROFILES: &[&str] = &["baseline", "main", "high"];
const NVENC_HEVC_PROFILES: &[&str] = &["main", "main10"];
const NVENC_AV1_PROFILES: &[&str] = &["main"];
const QSV_PRESETS: &[&str] = &["veryfast", "faster", "fast", "medium", "slow", "slower", "veryslow"];

fn check_range(param: &'static str, value: i64, min: i64, max: i64) -> Result<String, ConfigError> {
    if (min..=max).contains(&value) {
        Ok(value.to_string())
    } else {
        Err(ConfigError::OutOfRange {
            param,
            min,
            max,
            value,
        })
    }
}

fn check_bitrate(bitrate: &str) -> Result<String, ConfigError> {
    let bitrate = bitrate.trim();
    if bitrate.is_empty() {
        return Err(ConfigError::EmptyBitrate);
    }
    Ok(bitrate.to_string())
}

fn check_preset(preset: &str, allowed: &[&str]) -> Result<String, ConfigError> {
    let preset = preset.trim().to_ascii_lowercase();
    if allowed.contains(&preset.as_str()) {
        Ok(preset)
    } else {
        Err(ConfigError::InvalidPreset(preset))
    }
}

/// Empty profile means "encoder default"
fn push_profile(args: &mut Vec<String>, profile: &str, allowed: &[&str]) -> Result<(), ConfigError> {
    let profile = profile.trim().to_ascii_lowercase();
    if profile.is_empty() {
        return Ok(());
    }
    if !allowed.contains(&profile.as_str()) {
        return Err(ConfigError::InvalidProfile(profile));
    }
    args.push("-profile:v".into());
    args.push(profile);
    Ok(())
}

fn push_extra(args: &mut Vec<String>, extra: &str) {
    args.extend(extra.split_whitespace().map(str::to_string));
}

fn rate_control(value: &str) -> String {
    value.trim().to_ascii_lowercase()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct X26xSettings {
    pub rate_control: String,
    pub bitrate: String,
    pub crf: i64,
    pub profile: String,
    pub preset: String,
    pub additional_options: String,
}

impl Default for X26xSettings {
    fn default() -> Self {
        Self {
            rate_control: "crf".into(),
            bitrate: "10M".into(),
            crf: 14,
            profile: String::new(),
            preset: "faster".into(),
            additional_options: String::new(),
        }
    }
}

/// libx264 or libx265
#[derive(Debug, Clone, PartialEq)]
pub struct X26xOptions {
    pub codec: &'static str,
    pub settings: X26xSettings,
}

impl EncoderOptions for X26xOptions {
    fn codec(&self) -> &str {
        self.codec
    }

    fn ffmpeg_args(&self) -> Result<Vec<String>, ConfigError> {
        let s = &self.settings;
        let mut args = Vec::new();
        match rate_control(&s.rate_control).as_str() {
            "vbr" => args.extend(["-b:v".into(), check_bitrate(&s.bitrate)?]),
            "cbr" => {
                let b = check_bitrate(&s.bitrate)?;
                for flag in ["-b:v", "-minrate", "-maxrate", "-bufsize"] {
                    args.extend([flag.to_string(), b.clone()]);
                }
            }
            "crf" => args.extend(["-crf".into(), check_range("CRF", s.crf, 0, 51)?]),
            other => return Err(ConfigError::InvalidRateControl(other.into())),
        }

        let profiles = if self.codec == "libx265" {
            X265_PROFILES
        } else {
            X264_PROFILES
        };
        push_profile(&mut args, &s.profile, profiles)?;
        args.extend(["-preset".into(), check_preset(&s.preset, X26X_PRESETS)?]);
        push_extra(&mut args, &s.additional_options);
        Ok(args)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NvencSettings {
    pub rate_control: String,
    pub bitrate: String,
    pub cqp: i64,
    pub cq: i64,
    pub profile: String,
    pub preset: String,
    pub additional_options: String,
}

impl Default for NvencSettings {
    fn default() -> Self {
        Self {
            rate_control: "cq".into(),
            bitrate: "10M".into(),
            cqp: 24,
            cq: 22,
            profile: String::new(),
            preset: "slow".into(),
            additional_options: String::new(),
        }
    }
}

/// h264_nvenc, hevc_nvenc or av1_nvenc
#[derive(Debug, Clone, PartialEq)]
pub struct NvencOptions {
    pub codec: &'static str,
    pub settings: NvencSettings,
}

impl EncoderOptions for NvencOptions {
    fn codec(&self) -> &str {
        self.codec
    }

    fn ffmpeg_args(&self) -> Result<Vec<String>, ConfigError> {
        let s = &self.settings;
        let mut args: Vec<String> = Vec::new();
        match rate_control(&s.rate_control).as_str() {
            "vbr" => args.extend(["-rc".into(), "vbr".into(), "-b:v".into(), check_bitrate(&s.bitrate)?]),
            "cbr" => args.extend(["-rc".into(), "cbr".into(), "-b:v".into(), check_bitrate(&s.bitrate)?]),
            "cqp" => args.extend(["-rc".into(), "constqp".into(), "-qp".into(), check_range("CQP", s.cqp, 0, 51)?]),
            "cq" => args.extend([
                "-rc".into(),
                "vbr".into(),
                "-b:v".into(),
                "400M".into(),
                "-cq".into(),
                check_range("CQ", s.cq, 0, 51)?,
            ]),
            other => return Err(ConfigError::InvalidRateControl(other.into())),
        }

        let profiles = match self.codec {
            "hevc_nvenc" => NVENC_HEVC_PROFILES,
            "av1_nvenc" => NVENC_AV1_PROFILES,
            _ => NVENC_H264_PROFILES,
        };
        push_profile(&mut args, &s.profile, profiles)?;
        args.extend(["-preset".into(), check_preset(&s.preset, NVENC_PRESETS)?]);
        push_extra(&mut args, &s.additional_options);
        Ok(args)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QsvSettings {
    pub rate_control: String,
    pub bitrate: String,
    pub quality: i64,
    pub preset: String,
    pub additional_options: String,
}

impl Default for QsvSettings {
    fn default() -> Self {
        Self {
            rate_control: "icq".into(),
            bitrate: "10M".into(),
            quality: 15,
            preset: "slow".into(),
            additional_options: String::new(),
        }
    }
}

/// h264_qsv or hevc_qsv
#[derive(Debug, Clone, PartialEq)]
pub struct QsvOptions {
    pub codec: &'static str,
    pub settings: QsvSettings,
}

impl EncoderOptions for QsvOptions {
    fn codec(&self) -> &str {
        self.codec
    }

    fn ffmpeg_args(&self) -> Result<Vec<String>, ConfigError> {
        let s = &self.settings;
        let mut args: Vec<String> = Vec::new();
        match rate_control(&s.rate_control).as_str() {
            "vbr" => args.extend(["-b:v".into(), check_bitrate(&s.bitrate)?]),
            "cbr" => {
                let b = check_bitrate(&s.bitrate)?;
                args.extend(["-b:v".into(), b.clone(), "-maxrate".into(), b]);
            }
            "icq" => args.extend(["-global_quality".into(), check_range("ICQ", s.quality, 1, 51)?]),
            other => return Err(ConfigError::InvalidRateControl(other.into())),
        }
        args.extend(["-preset".into(), check_preset(&s.preset, QSV_PRESETS)?]);
        push_extra(&mut args, &s.additional_options);
        Ok(args)
    }

    // QSV only takes nv12 input reliably
    fn forced_pixel_format(&self) -> Option<PixelFormat> {
        Some(PixelFormat::Nv12)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SvtAv1Settings {
    pub rate_control: String,
    pub bitrate: String,
    pub crf: i64,
    pub preset: i64,
    pub additional_options: String,
}

impl Default for SvtAv1Settings {
    fn default() -> Self {
        Self {
            rate_control: "crf".into(),
            bitrate: "10M".into(),
            crf: 30,
            preset: 8,
            additional_options: String::new(),
        }
    }
}

impl EncoderOptions for SvtAv1Settings {
    fn codec(&self) -> &str {
        "libsvtav1"
    }

    fn ffmpeg_args(&self) -> Result<Vec<String>, ConfigError> {
        let mut args: Vec<String> = Vec::new();
        match rate_control(&self.rate_control).as_str() {
            "vbr" => args.extend(["-b:v".into(), check_bitrate(&self.bitrate)?]),
            "crf" => args.extend(["-crf".into(), check_range("CRF", self.crf, 0, 63)?]),
            other => return Err(ConfigError::InvalidRateControl(other.into())),
        }
        args.extend(["-preset".into(), check_range("preset", self.preset, 0, 13)?]);
        push_extra(&mut args, &self.additional_options);
        Ok(args)
    }
}

/// Any codec ffmpeg knows, with raw arguments
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomCodecSettings {
    pub codec: String,
    pub options: String,
}

impl EncoderOptions for CustomCodecSettings {
    fn codec(&self) -> &str {
        self.codec.trim()
    }

    fn ffmpeg_args(&self) -> Result<Vec<String>, ConfigError> {
        if self.codec.trim().is_empty() {
            return Err(ConfigError::Invalid("custom encoder needs a codec name".into()));
        }
        let mut args = Vec::new();
        push_extra(&mut args, &self.options);
        Ok(args)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AacSettings {
    pub bitrate: String,
    pub additional_options: String,
}

impl Default for AacSettings {
    fn default() -> Self {
        Self {
            bitrate: "192k".into(),
            additional_options: String::new(),
        }
    }
}

impl EncoderOptions for AacSettings {
    fn codec(&self) -> &str {
        "aac"
    }

    fn ffmpeg_args(&self) -> Result<Vec<String>, ConfigError> {
        let mut args = vec!["-b:a".to_string(), check_bitrate(&self.bitrate)?];
        push_extra(&mut args, &self.additional_options);
        Ok(args)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Mp3Settings {
    pub rate_control: String,
    pub bitrate: String,
    pub quality: i64,
    pub additional_options: String,
}

impl Default for Mp3Settings {
    fn default() -> Self {
        Self {
            rate_control: "cbr".into(),
            bitrate: "320k".into(),
            quality: 0,
            additional_options: String::new(),
        }
    }
}

impl EncoderOptions for Mp3Settings {
    fn codec(&self) -> &str {
        "libmp3lame"
    }

    fn ffmpeg_args(&self) -> Result<Vec<String>, ConfigError> {
        let mut args: Vec<String> = match rate_control(&self.rate_control).as_str() {
            "cbr" => vec!["-b:a".into(), check_bitrate(&self.bitrate)?],
            "abr" => vec!["-abr".into(), "1".into(), "-b:a".into(), check_bitrate(&self.bitrate)?],
            "vbr" => vec!["-q:a".into(), check_range("quality", self.quality, 0, 9)?],
            other => return Err(ConfigError::InvalidRateControl(other.into())),
        };
        push_extra(&mut args, &self.additional_options);
        Ok(args)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpusSettings {
    pub rate_control: String,
    pub bitrate: String,
    pub additional_options: String,
}

impl Default for OpusSettings {
    fn default() -> Self {
        Self {
            rate_control: "vbr".into(),
            bitrate: "192k".into(),
            additional_options: String::new(),
        }
    }
}

impl EncoderOptions for OpusSettings {
    fn codec(&self) -> &str {
        "libopus"
    }

    fn ffmpeg_args(&self) -> Result<Vec<String>, ConfigError> {
        let mut args: Vec<String> = match rate_control(&self.rate_control).as_str() {
            "vbr" => vec!["-b:a".into(), check_bitrate(&self.bitrate)?],
            "cbr" => vec!["-vbr".into(), "off".into(), "-b:a".into(), check_bitrate(&self.bitrate)?],
            other => return Err(ConfigError::InvalidRateControl(other.into())),
        };
        push_extra(&mut args, &self.additional_options);
        Ok(args)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlacSettings {
    pub compression_level: i64,
    pub additional_options: String,
}

impl Default for FlacSettings {
    fn default() -> Self {
        Self {
            compression_level: 12,
            additional_options: String::new(),
        }
    }
}

impl EncoderOptions for FlacSettings {
    fn codec(&self) -> &str {
        "flac"
    }

    fn ffmpeg_args(&self) -> Result<Vec<String>, ConfigError> {
        let mut args = vec![
            "-compression_level".to_string(),
            check_range("compression level", self.compression_level, 0, 12)?,
            "-sample_fmt".into(),
            "s32".into(),
            "-bits_per_raw_sample".into(),
            "24".into(),
        ];
        push_extra(&mut args, &self.additional_options);
        Ok(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn x264(rate_control: &str) -> VideoCodecOptions {
        VideoCodecOptions::from(X26xOptions {
            codec: "libx264",
            settings: X26xSettings {
                rate_control: rate_control.into(),
                profile: "high".into(),
                ..Default::default()
            },
        })
    }

    #[test]
    fn x264_rate_control_modes() {
        assert_eq!(
            x264("crf").ffmpeg_args().expect("crf"),
            ["-crf", "14", "-profile:v", "high", "-preset", "faster"]
        );
        assert_eq!(
            x264("CBR").ffmpeg_args().expect("cbr"),
            [
                "-b:v", "10M", "-minrate", "10M", "-maxrate", "10M", "-bufsize", "10M",
                "-profile:v", "high", "-preset", "faster"
            ]
        );
        assert_eq!(
            x264("qp").ffmpeg_args(),
            Err(ConfigError::InvalidRateControl("qp".into()))
        );
        assert_eq!(x264("crf").codec(), "libx264");
    }

    #[test]
    fn x265_rejects_x264_profiles() {
        let options = X26xOptions {
            codec: "libx265",
            settings: X26xSettings {
                profile: "high".into(),
                ..Default::default()
            },
        };
        assert_eq!(
            options.ffmpeg_args(),
            Err(ConfigError::InvalidProfile("high".into()))
        );
    }

    #[test]
    fn quality_ranges_are_enforced() {
        let nvenc = NvencOptions {
            codec: "hevc_nvenc",
            settings: NvencSettings {
                rate_control: "cqp".into(),
                cqp: 52,
                ..Default::default()
            },
        };
        assert!(matches!(
            nvenc.ffmpeg_args(),
            Err(ConfigError::OutOfRange { param: "CQP", max: 51, value: 52, .. })
        ));

        let flac = FlacSettings {
            compression_level: 13,
            ..Default::default()
        };
        assert!(flac.ffmpeg_args().is_err());
    }

    #[test]
    fn nvenc_constant_quality_uses_vbr_ceiling() {
        let nvenc = NvencOptions {
            codec: "h264_nvenc",
            settings: NvencSettings::default(),
        };
        assert_eq!(
            nvenc.ffmpeg_args().expect("cq"),
            ["-rc", "vbr", "-b:v", "400M", "-cq", "22", "-preset", "slow"]
        );
    }

    #[test]
    fn unknown_preset_is_rejected() {
        let qsv = QsvOptions {
            codec: "h264_qsv",
            settings: QsvSettings {
                preset: "p7".into(),
                ..Default::default()
            },
        };
        assert_eq!(qsv.ffmpeg_args(), Err(ConfigError::InvalidPreset("p7".into())));
        assert_eq!(qsv.forced_pixel_format(), Some(PixelFormat::Nv12));
    }

    #[test]
    fn audio_codecs() {
        let aac = AudioCodecOptions::from(AacSettings::default());
        assert_eq!(aac.codec(), "aac");
        assert_eq!(aac.ffmpeg_args().expect("aac"), ["-b:a", "192k"]);

        let opus = OpusSettings {
            rate_control: "cbr".into(),
            ..Default::default()
        };
        assert_eq!(
            opus.ffmpeg_args().expect("opus"),
            ["-vbr", "off", "-b:a", "192k"]
        );

        let mp3 = Mp3Settings {
            rate_control: "vbr".into(),
            quality: 2,
            ..Default::default()
        };
        assert_eq!(mp3.ffmpeg_args().expect("mp3"), ["-q:a", "2"]);

        let custom = CustomCodecSettings::default();
        assert!(custom.ffmpeg_args().is_err());
    }
}
