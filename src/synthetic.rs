//! Test pattern source for headless recordings
//!
//! A scrolling bar over a gradient and a sine tone. Used by the CLI to exercise the whole
//! pipeline without a scene.

use std::f64::consts::TAU;

use rayon::prelude::*;

use crate::error::CaptureError;
use crate::recording::audio::AudioMixer;
use crate::recording::host_readback::HostReadback;
use crate::recording::pipeline::FrameRenderer;
use crate::recording::pixel_format::PixelFormat;
use crate::recording::readback::ReadbackDevice;

/// Seconds the bar takes to cross the frame
const BAR_PERIOD: f64 = 2.0;

pub struct TestPatternRenderer {
    background: [u8; 3],
    bar: [u8; 3],
}

impl Default for TestPatternRenderer {
    fn default() -> Self {
        Self {
            background: [16, 16, 24],
            bar: [230, 120, 40],
        }
    }
}

impl TestPatternRenderer {
    pub fn new(background: [u8; 3], bar: [u8; 3]) -> Self {
        Self { background, bar }
    }

    /// Left edge of the bar at `virtual_time_ms`
    pub fn bar_position(width: u32, virtual_time_ms: f64) -> u32 {
        let phase = (virtual_time_ms / 1000.0 / BAR_PERIOD).fract();
        (phase * width as f64) as u32
    }
}

fn write_pixel(format: PixelFormat, [r, g, b]: [u8; 3], out: &mut [u8]) {
    match format {
        PixelFormat::Bgra => out.copy_from_slice(&[b, g, r, 255]),
        PixelFormat::Rgba => out.copy_from_slice(&[r, g, b, 255]),
        PixelFormat::Argb => out.copy_from_slice(&[255, r, g, b]),
        PixelFormat::Rgb24 => out.copy_from_slice(&[r, g, b]),
        PixelFormat::Bgr24 => out.copy_from_slice(&[b, g, r]),
        _ => {}
    }
}

fn bytes_per_pixel(format: PixelFormat) -> Option<usize> {
    match format {
        PixelFormat::Bgra | PixelFormat::Rgba | PixelFormat::Argb => Some(4),
        PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(3),
        _ => None,
    }
}

impl FrameRenderer<HostReadback> for TestPatternRenderer {
    fn draw(&mut self, device: &mut HostReadback, virtual_time_ms: f64) -> Result<(), CaptureError> {
        let layout = device.layout();
        let bpp = bytes_per_pixel(layout.format).ok_or_else(|| {
            CaptureError::Submit(format!(
                "test pattern cannot draw into {}",
                layout.format.ffmpeg_name()
            ))
        })?;

        let width = layout.width as usize;
        let height = layout.height.max(1) as usize;
        let bar_width = (width / 16).max(1);
        let bar_start = Self::bar_position(layout.width, virtual_time_ms) as usize;
        let (background, bar) = (self.background, self.bar);

        device
            .frame_mut()
            .par_chunks_mut(width * bpp)
            .enumerate()
            .for_each(|(y, row)| {
                let shade = (y * 64 / height) as u8;
                let bg = background.map(|c| c.saturating_add(shade));
                for (x, pixel) in row.chunks_exact_mut(bpp).enumerate() {
                    let in_bar = (x + width - bar_start) % width < bar_width;
                    write_pixel(layout.format, if in_bar { bar } else { bg }, pixel);
                }
            });
        Ok(())
    }
}

/// Sine tone on every channel
pub struct ToneMixer {
    frequency: f64,
    amplitude: f32,
    sample_rate: u32,
    channels: usize,
    phase: f64,
}

impl ToneMixer {
    pub fn new(frequency: f64, sample_rate: u32, channels: u16) -> Self {
        Self {
            frequency,
            amplitude: 0.2,
            sample_rate,
            channels: channels.max(1) as usize,
            phase: 0.0,
        }
    }

    pub fn silent(sample_rate: u32, channels: u16) -> Self {
        Self {
            amplitude: 0.0,
            ..Self::new(0.0, sample_rate, channels)
        }
    }
}

impl AudioMixer for ToneMixer {
    fn fill(&mut self, samples: &mut [f32]) {
        let step = TAU * self.frequency / self.sample_rate as f64;
        for frame in samples.chunks_exact_mut(self.channels) {
            let value = self.amplitude * self.phase.sin() as f32;
            frame.fill(value);
            self.phase = (self.phase + step) % TAU;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bar_moves_across_the_frame() {
        assert_eq!(TestPatternRenderer::bar_position(100, 0.0), 0);
        assert_eq!(TestPatternRenderer::bar_position(100, 1000.0), 50);
        assert_eq!(TestPatternRenderer::bar_position(100, 2000.0), 0);
    }

    #[test]
    fn draws_bgra_pattern() {
        let mut device = HostReadback::new(32, 4, PixelFormat::Bgra);
        let mut renderer = TestPatternRenderer::new([0, 0, 0], [10, 20, 30]);
        renderer.draw(&mut device, 0.0).expect("draw");
        let frame = device.frame();
        assert_eq!(&frame[0..4], &[30, 20, 10, 255]);
        assert_eq!(&frame[4..8], &[30, 20, 10, 255]);
        // outside the two pixel wide bar
        assert_eq!(&frame[8..12], &[0, 0, 0, 255]);
    }

    #[test]
    fn rejects_planar_targets() {
        let mut device = HostReadback::new(16, 16, PixelFormat::Yuv420p);
        let err = TestPatternRenderer::default()
            .draw(&mut device, 0.0)
            .expect_err("planar target");
        assert!(matches!(err, CaptureError::Submit(_)));
    }

    #[test]
    fn tone_fills_every_channel() {
        let mut mixer = ToneMixer::new(440.0, 48_000, 2);
        let mut samples = vec![0.0f32; 96];
        mixer.fill(&mut samples);
        assert_eq!(samples[0], 0.0);
        for frame in samples.chunks_exact(2) {
            assert_eq!(frame[0], frame[1]);
            assert!(frame[0].abs() <= 0.2);
        }
        assert!(samples[2] > 0.0);

        let mut silent = ToneMixer::silent(48_000, 2);
        let mut quiet = vec![1.0f32; 8];
        silent.fill(&mut quiet);
        assert!(quiet.iter().all(|s| *s == 0.0));
    }
}
