//! Offline replay recorder
//!
//! Captures rendered frames and mixed audio on a virtual clock and streams both to ffmpeg,
//! producing a single muxed video file. See [`recording::pipeline::RecordingPipeline`].

pub mod error;
pub mod recording;
pub mod settings;
pub mod synthetic;
pub mod utils;
