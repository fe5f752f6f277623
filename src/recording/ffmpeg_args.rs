//! ffmpeg command lines for the two encoders, plus hardware encoder detection

use std::path::Path;
use std::process::{Command, Stdio};

use super::readback::CaptureLayout;
use super::stream_writer::LaunchSpec;
use super::{RecordingPaths, RecordingPlan};
use crate::settings::codecs::EncoderOptions;

/// Hardware encoders tried by `encoder = "auto"`, in priority order
const HW_CANDIDATES: [&str; 2] = ["h264_nvenc", "h264_qsv"];
const SOFTWARE_FALLBACK: &str = "libx264";

/// Placeholder swapped for the pipe path when the encoder is spawned
const INPUT_PLACEHOLDER: &str = "-";

/// A `Command` for an ffmpeg style binary, without a console window on Windows
pub fn encoder_command(program: &Path) -> Command {
    #[allow(unused_mut)]
    let mut cmd = Command::new(program);
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }
    cmd
}

/// Pick the first hardware H.264 encoder that survives a test encode, else libx264
pub fn detect_hw_encoder(ffmpeg: &Path) -> &'static str {
    for codec in HW_CANDIDATES {
        if test_encoder(ffmpeg, codec) {
            tracing::info!(codec, "detected hardware encoder");
            return codec;
        }
    }
    tracing::info!("no hardware encoder detected, using {SOFTWARE_FALLBACK}");
    SOFTWARE_FALLBACK
}

/// Run a one-shot encode of a synthetic source to see whether `codec` actually works
fn test_encoder(ffmpeg: &Path, codec: &str) -> bool {
    encoder_command(ffmpeg)
        .args(["-hide_banner", "-loglevel", "error"])
        .args(["-f", "lavfi", "-i", "nullsrc=s=1280x720:d=0.1"])
        .args(["-c:v", codec, "-f", "null", "-"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Raw video encoder reading frames of the plan's output pixel format
pub fn video_launch(plan: &RecordingPlan, layout: &CaptureLayout, paths: &RecordingPaths) -> LaunchSpec {
    let mut args: Vec<String> = vec![
        "-y".into(),
        "-hide_banner".into(),
        "-f".into(),
        "rawvideo".into(),
        "-vcodec".into(),
        "rawvideo".into(),
        "-s".into(),
        format!("{}x{}", plan.width, plan.height),
        "-pix_fmt".into(),
        plan.pixel_format.ffmpeg_name().into(),
        "-r".into(),
        plan.fps.to_string(),
        "-i".into(),
    ];
    let input_index = args.len();
    args.push(INPUT_PLACEHOLDER.into());
    args.push("-an".into());

    // rows of a bottom-up capture are flipped here and nowhere else
    let mut filters: Vec<&str> = Vec::new();
    if layout.bottom_up {
        filters.push("vflip");
    }
    let extra = plan.video_filters.trim();
    if !extra.is_empty() {
        filters.push(extra);
    }
    if !filters.is_empty() {
        args.push("-vf".into());
        args.push(filters.join(","));
    }

    args.extend([
        "-c:v".into(),
        plan.video_codec.codec().to_string(),
        "-color_range".into(),
        "1".into(),
        "-colorspace".into(),
        "1".into(),
        "-color_trc".into(),
        "1".into(),
        "-color_primaries".into(),
        "1".into(),
        "-movflags".into(),
        "+write_colr".into(),
    ]);
    args.extend(plan.video_args.iter().cloned());
    args.push(paths.video.to_string_lossy().into_owned());

    launch(plan, paths, args, input_index)
}

/// Interleaved f32 PCM encoder
pub fn audio_launch(plan: &RecordingPlan, paths: &RecordingPaths) -> LaunchSpec {
    let sample_format = if cfg!(target_endian = "big") {
        "f32be"
    } else {
        "f32le"
    };
    let mut args: Vec<String> = vec![
        "-y".into(),
        "-hide_banner".into(),
        "-f".into(),
        sample_format.into(),
        "-acodec".into(),
        format!("pcm_{sample_format}"),
        "-ar".into(),
        plan.audio.sample_rate.to_string(),
        "-ac".into(),
        plan.audio.channels.to_string(),
        "-i".into(),
    ];
    let input_index = args.len();
    args.push(INPUT_PLACEHOLDER.into());
    args.extend(["-nostats".into(), "-vn".into()]);

    let filters = plan.audio_filters.trim();
    if !filters.is_empty() {
        args.extend(["-af".into(), filters.to_string()]);
    }
    args.extend([
        "-c:a".into(),
        plan.audio_codec.codec().to_string(),
        "-strict".into(),
        "-2".into(),
    ]);
    args.extend(plan.audio_args.iter().cloned());
    args.push(paths.audio.to_string_lossy().into_owned());

    launch(plan, paths, args, input_index)
}

fn launch(plan: &RecordingPlan, paths: &RecordingPaths, args: Vec<String>, input_index: usize) -> LaunchSpec {
    LaunchSpec {
        program: plan.ffmpeg.clone(),
        args,
        input_index: Some(input_index),
        transport: plan.transport,
        pipe_dir: paths.temp_dir.clone(),
        show_logs: plan.show_ffmpeg_logs,
        startup_timeout: plan.startup_timeout,
        startup_probe: plan.startup_probe,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::pixel_format::PixelFormat;
    use crate::settings::RecordingSettings;

    fn plan() -> RecordingPlan {
        let mut settings = RecordingSettings::default();
        settings.frame_width = 1280;
        settings.frame_height = 720;
        settings.pixel_format = "nv12".into();
        settings.output_dir = "out".into();
        settings.plan().expect("valid plan")
    }

    fn layout(bottom_up: bool) -> CaptureLayout {
        CaptureLayout {
            width: 1280,
            height: 720,
            format: PixelFormat::Bgra,
            bottom_up,
        }
    }

    #[test]
    fn video_prefix_and_codec_options() {
        let plan = plan();
        let paths = plan.paths("take");
        let spec = video_launch(&plan, &layout(false), &paths);

        let expected_prefix = [
            "-y", "-hide_banner", "-f", "rawvideo", "-vcodec", "rawvideo", "-s", "1280x720",
            "-pix_fmt", "nv12", "-r", "60", "-i", "-", "-an", "-c:v", "libx264",
        ];
        assert_eq!(&spec.args[..expected_prefix.len()], &expected_prefix);
        assert_eq!(spec.input_index, Some(13));
        assert!(!spec.args.iter().any(|a| a == "-vf"));

        let video = paths.video.to_string_lossy().into_owned();
        let tail = &spec.args[spec.args.len() - 8..];
        assert_eq!(
            tail,
            ["+write_colr", "-crf", "14", "-profile:v", "high", "-preset", "faster", video.as_str()]
        );
    }

    #[test]
    fn bottom_up_capture_adds_a_single_flip() {
        let mut plan = plan();
        plan.video_filters = "scale=640:-2".into();
        let spec = video_launch(&plan, &layout(true), &plan.paths("take"));
        let vf = spec.args.iter().position(|a| a == "-vf").expect("-vf");
        assert_eq!(spec.args[vf + 1], "vflip,scale=640:-2");
        assert_eq!(spec.args.iter().filter(|a| a.contains("vflip")).count(), 1);
    }

    #[test]
    fn audio_prefix() {
        let plan = plan();
        let paths = plan.paths("take");
        let spec = audio_launch(&plan, &paths);
        let fmt = if cfg!(target_endian = "big") { "f32be" } else { "f32le" };
        let acodec = format!("pcm_{fmt}");
        let expected = [
            "-y", "-hide_banner", "-f", fmt, "-acodec", &acodec, "-ar", "48000", "-ac", "2", "-i",
            "-", "-nostats", "-vn", "-c:a", "aac", "-strict", "-2", "-b:a", "192k",
        ];
        let mut expected: Vec<String> = expected.iter().map(|s| s.to_string()).collect();
        expected.push(paths.audio.to_string_lossy().into_owned());
        assert_eq!(spec.args, expected);
        assert_eq!(spec.input_index, Some(11));
        assert_eq!(spec.pipe_dir, paths.temp_dir);
    }
}
