//! Final remux of the two elementary streams
//!
//! Stream copy only, no re-encode. The intermediates and their temp directory are removed
//! whether or not the remux worked.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use super::ffmpeg_args::encoder_command;
use super::{Container, RecordingPaths};
use crate::error::RemuxError;

pub struct Muxer {
    ffmpeg: PathBuf,
}

impl Muxer {
    pub fn new(ffmpeg: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
        }
    }

    pub fn args(video: &Path, audio: &Path, output: &Path, container: Container) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-y".into(),
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-i".into(),
            video.to_string_lossy().into_owned(),
            "-i".into(),
            audio.to_string_lossy().into_owned(),
            "-c:v".into(),
            "copy".into(),
            "-c:a".into(),
            "copy".into(),
        ];
        if container.faststart() {
            args.extend(["-movflags".into(), "+faststart".into()]);
        }
        args.push(output.to_string_lossy().into_owned());
        args
    }

    /// Combine `video` and `audio` into `output`
    pub fn remux(
        &self,
        video: &Path,
        audio: &Path,
        output: &Path,
        container: Container,
    ) -> Result<(), RemuxError> {
        tracing::info!(output = %output.display(), "muxing streams");
        let result = encoder_command(&self.ffmpeg)
            .args(Self::args(video, audio, output, container))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .output()
            .map_err(RemuxError::Spawn)?;

        if !result.status.success() {
            return Err(RemuxError::Failed {
                status: result.status.to_string(),
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }
        if !output.exists() {
            return Err(RemuxError::MissingOutput(output.to_path_buf()));
        }
        Ok(())
    }

    /// Remux, then remove the intermediates and the temp directory regardless of the outcome
    pub fn finalize(&self, paths: &RecordingPaths, container: Container) -> Result<PathBuf, RemuxError> {
        let result = self.remux(&paths.video, &paths.audio, &paths.output, container);
        cleanup(paths);
        match result {
            Ok(()) => {
                tracing::info!(output = %paths.output.display(), "recording saved");
                Ok(paths.output.clone())
            }
            Err(e) => {
                tracing::warn!(error = %e, "remux failed");
                Err(e)
            }
        }
    }
}

/// Remove intermediate files and the temp directory, logging what could not be removed
pub fn cleanup(paths: &RecordingPaths) {
    for file in [&paths.video, &paths.audio] {
        remove_logged(file, fs::remove_file(file));
    }
    remove_logged(&paths.temp_dir, fs::remove_dir_all(&paths.temp_dir));
}

fn remove_logged(path: &Path, result: std::io::Result<()>) {
    if let Err(e) = result {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove intermediate");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(dir: &Path) -> RecordingPaths {
        let paths = RecordingPaths::new(dir, "take", Container::Mp4);
        fs::create_dir_all(&paths.temp_dir).expect("temp dir");
        fs::write(&paths.video, b"video").expect("video");
        fs::write(&paths.audio, b"audio").expect("audio");
        paths
    }

    #[test]
    fn faststart_only_for_mp4() {
        let mp4 = Muxer::args(Path::new("v.mp4"), Path::new("a.mp4"), Path::new("o.mp4"), Container::Mp4);
        assert_eq!(
            mp4,
            [
                "-y", "-hide_banner", "-loglevel", "error", "-i", "v.mp4", "-i", "a.mp4", "-c:v",
                "copy", "-c:a", "copy", "-movflags", "+faststart", "o.mp4"
            ]
        );
        let mkv = Muxer::args(Path::new("v.mkv"), Path::new("a.mkv"), Path::new("o.mkv"), Container::Mkv);
        assert!(!mkv.iter().any(|a| a == "+faststart"));
    }

    #[test]
    fn failed_remux_still_cleans_up() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = layout(dir.path());
        let muxer = Muxer::new(dir.path().join("missing-ffmpeg"));

        let err = muxer.finalize(&paths, Container::Mp4).expect_err("remux fails");
        assert!(matches!(err, RemuxError::Spawn(_)));
        assert!(!paths.temp_dir.exists());
        assert!(!paths.output.exists());
    }
}
