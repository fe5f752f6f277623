//! Encoder capability list of the ffmpeg binary, queried once per recording

use std::path::Path;
use std::process::Stdio;

use rustc_hash::FxHashSet;

use super::ffmpeg_args::encoder_command;
use crate::error::{RecordingError, StreamKind};

#[derive(Debug, Clone, Default)]
pub struct EncoderCatalog {
    video: FxHashSet<String>,
    audio: FxHashSet<String>,
}

impl EncoderCatalog {
    /// Run `ffmpeg -hide_banner -encoders` and parse the result
    pub fn query(ffmpeg: &Path) -> Result<Self, RecordingError> {
        let output = encoder_command(ffmpeg)
            .args(["-hide_banner", "-encoders"])
            .stdin(Stdio::null())
            .output()
            .map_err(|e| {
                let reason = if e.kind() == std::io::ErrorKind::NotFound {
                    format!("ffmpeg not found at {}", ffmpeg.display())
                } else {
                    format!("failed to run {}: {e}", ffmpeg.display())
                };
                RecordingError::startup(StreamKind::Video, reason)
            })?;

        if !output.status.success() {
            return Err(RecordingError::startup(
                StreamKind::Video,
                format!("`{} -encoders` exited with {}", ffmpeg.display(), output.status),
            ));
        }

        let catalog = Self::parse(&String::from_utf8_lossy(&output.stdout));
        tracing::debug!(
            video = catalog.video.len(),
            audio = catalog.audio.len(),
            "queried encoder capabilities"
        );
        Ok(catalog)
    }

    /// Parse the encoder table. Rows start after the `------` separator; the first flag
    /// column is `V` or `A` and experimental encoders (`X` in the fourth column) are skipped.
    pub fn parse(listing: &str) -> Self {
        let mut catalog = Self::default();
        let rows = listing
            .lines()
            .skip_while(|line| !line.trim_start().starts_with("------"))
            .skip(1);

        for row in rows {
            let mut fields = row.split_whitespace();
            let (Some(flags), Some(name)) = (fields.next(), fields.next()) else {
                continue;
            };
            let flags = flags.as_bytes();
            if flags.len() < 6 || flags.get(3) == Some(&b'X') {
                continue;
            }
            match flags[0] {
                b'V' => catalog.video.insert(name.to_string()),
                b'A' => catalog.audio.insert(name.to_string()),
                _ => false,
            };
        }
        catalog
    }

    pub fn has_video(&self, codec: &str) -> bool {
        self.video.contains(codec)
    }

    pub fn has_audio(&self, codec: &str) -> bool {
        self.audio.contains(codec)
    }

    /// Fail with a startup error naming `codec` when the binary lacks it
    pub fn require(&self, stream: StreamKind, codec: &str) -> Result<(), RecordingError> {
        let present = match stream {
            StreamKind::Video => self.has_video(codec),
            StreamKind::Audio => self.has_audio(codec),
        };
        if present {
            Ok(())
        } else {
            Err(RecordingError::startup(
                stream,
                format!("ffmpeg does not provide the {stream} encoder `{codec}`"),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
Encoders:
 V..... = Video
 A..... = Audio
 S..... = Subtitle
 ..X... = Experimental
 ------
 V....D libx264              libx264 H.264 / AVC / MPEG-4 AVC (codec h264)
 V....D h264_nvenc           NVIDIA NVENC H.264 encoder (codec h264)
 V..X.D vc2                  SMPTE VC-2 (codec dirac)
 A....D aac                  AAC (Advanced Audio Coding)
 A..X.D opus                 Opus (Opus Interactive Audio Codec)
 A....D libopus              libopus Opus (codec opus)
 S..... srt                  SubRip subtitle
";

    #[test]
    fn parses_encoder_table() {
        let catalog = EncoderCatalog::parse(LISTING);
        assert!(catalog.has_video("libx264"));
        assert!(catalog.has_video("h264_nvenc"));
        assert!(!catalog.has_video("vc2"));
        assert!(catalog.has_audio("aac"));
        assert!(catalog.has_audio("libopus"));
        assert!(!catalog.has_audio("opus"));
        assert!(!catalog.has_video("srt") && !catalog.has_audio("srt"));
        // legend rows above the separator are not encoders
        assert!(!catalog.has_video("="));
    }

    #[test]
    fn missing_codec_is_named() {
        let catalog = EncoderCatalog::parse(LISTING);
        assert!(catalog.require(StreamKind::Video, "libx264").is_ok());
        let err = catalog
            .require(StreamKind::Audio, "libmp3lame")
            .expect_err("missing codec");
        assert!(err.is_startup());
        assert!(err.to_string().contains("libmp3lame"));
    }

    #[cfg(unix)]
    #[test]
    fn missing_binary_is_a_startup_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = EncoderCatalog::query(&dir.path().join("ffmpeg")).expect_err("no binary");
        assert!(err.is_startup());
    }
}
