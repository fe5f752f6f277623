//! Headless recorder: renders a test pattern and a tone into a video file

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use replay_recorder::error::RecordingError;
use replay_recorder::recording::host_readback::HostReadback;
use replay_recorder::recording::pipeline::{RecordingPipeline, RecordingSummary};
use replay_recorder::recording::pixel_format::PixelFormat;
use replay_recorder::settings::RecordingSettings;
use replay_recorder::synthetic::{TestPatternRenderer, ToneMixer};
use replay_recorder::utils::format_duration;

#[derive(Debug, Parser)]
#[command(name = "replay-recorder", version, about = "Record a synthetic scene to video through ffmpeg")]
struct Cli {
    /// Settings file, defaults to the user's config directory
    #[arg(long)]
    config: Option<PathBuf>,
    /// Output directory
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// File name without extension, defaults to a timestamp
    #[arg(long)]
    name: Option<String>,
    /// Virtual seconds to record
    #[arg(short, long, default_value_t = 5.0)]
    duration: f64,
    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
    #[arg(long)]
    fps: Option<u32>,
    /// Video encoder name, or `auto`
    #[arg(long)]
    encoder: Option<String>,
    /// Sub-frames blended per output frame, 1 turns motion blur off
    #[arg(long)]
    motion_blur: Option<i64>,
    #[arg(long)]
    ffmpeg: Option<PathBuf>,
    /// Tone frequency in Hz, 0 for silence
    #[arg(long, default_value_t = 440.0)]
    tone: f64,
    /// Print ffmpeg's own log lines
    #[arg(long)]
    ffmpeg_logs: bool,
}

impl Cli {
    fn settings(&self) -> Result<RecordingSettings, Box<dyn std::error::Error>> {
        let mut settings = match &self.config {
            Some(path) => RecordingSettings::load_from(path)?,
            None => RecordingSettings::new_or_load()?,
        };
        if let Some(output) = &self.output {
            settings.output_dir = output.clone();
        }
        if let Some(width) = self.width {
            settings.frame_width = width;
        }
        if let Some(height) = self.height {
            settings.frame_height = height;
        }
        if let Some(fps) = self.fps {
            settings.fps = fps;
        }
        if let Some(encoder) = &self.encoder {
            settings.encoder = encoder.clone();
        }
        if let Some(multiplier) = self.motion_blur {
            settings.motion_blur.enabled = multiplier > 1;
            settings.motion_blur.oversample_multiplier = multiplier;
        }
        if let Some(ffmpeg) = &self.ffmpeg {
            settings.ffmpeg_path = Some(ffmpeg.clone());
        }
        settings.show_ffmpeg_logs |= self.ffmpeg_logs;
        Ok(settings)
    }
}

fn record(cli: &Cli, settings: &RecordingSettings) -> Result<RecordingSummary, RecordingError> {
    let plan = settings.plan()?;
    let device = HostReadback::new(plan.width, plan.height, PixelFormat::Bgra);
    let mixer = if cli.tone > 0.0 {
        ToneMixer::new(cli.tone, plan.audio.sample_rate, plan.audio.channels)
    } else {
        ToneMixer::silent(plan.audio.sample_rate, plan.audio.channels)
    };
    let frames = (cli.duration.max(0.0) * plan.fps as f64).round() as u64;

    let mut pipeline = RecordingPipeline::start(plan, device, mixer, cli.name.as_deref())?;
    pipeline.set_expected_duration(cli.duration * 1000.0);
    let tick = pipeline.tick_interval();
    let mut renderer = TestPatternRenderer::default();
    while pipeline.frames_emitted() < frames {
        pipeline.advance(tick, &mut renderer)?;
    }
    pipeline.stop()
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let settings = match cli.settings() {
        Ok(settings) => settings,
        Err(error) => {
            tracing::error!(%error, "failed to load settings");
            return ExitCode::FAILURE;
        }
    };

    match record(&cli, &settings) {
        Ok(summary) => {
            if let Some(warning) = &summary.remux_warning {
                tracing::warn!(%warning, "intermediate streams could not be combined");
            }
            tracing::info!(
                output = ?summary.output,
                frames = summary.video_frames,
                length = %format_duration(summary.video_frames as f64 / settings.fps.max(1) as f64),
                "recording finished"
            );
            ExitCode::SUCCESS
        }
        Err(error) => {
            tracing::error!(%error, "recording failed");
            ExitCode::FAILURE
        }
    }
}
