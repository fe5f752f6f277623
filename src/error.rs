//! Error types for the recording pipeline
//!
//! Startup and configuration failures surface synchronously from `RecordingPipeline::start`.
//! Failures on the writer and readback threads land in a [`FailureSlot`] that the render
//! thread checks on every tick.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;

/// Which of the two elementary streams an error belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Video,
    Audio,
}

impl StreamKind {
    pub fn label(&self) -> &'static str {
        match self {
            StreamKind::Video => "video",
            StreamKind::Audio => "audio",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Descriptive configuration failures, detected before any subprocess is spawned
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("invalid rate control value: {0}")]
    InvalidRateControl(String),
    #[error("{param} out of range [{min}-{max}]: {value}")]
    OutOfRange {
        param: &'static str,
        min: i64,
        max: i64,
        value: i64,
    },
    #[error("invalid profile: {0}")]
    InvalidProfile(String),
    #[error("invalid preset: {0}")]
    InvalidPreset(String),
    #[error("bitrate must not be empty")]
    EmptyBitrate,
    #[error("unknown pixel format: {0}")]
    UnknownPixelFormat(String),
    #[error("unsupported container: {0}")]
    UnsupportedContainer(String),
    #[error("unknown encoder: {0}")]
    UnknownEncoder(String),
    #[error("failed to parse blend weight: {0}")]
    InvalidWeight(String),
    #[error("expected {expected} blend weights, got {actual}")]
    WeightCount { expected: usize, actual: usize },
    #[error("{0}")]
    Invalid(String),
}

/// GPU or device side failures while capturing frames
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CaptureError {
    #[error("failed to allocate readback buffer: {0}")]
    Allocation(String),
    #[error("failed to issue readback copy: {0}")]
    Submit(String),
    #[error("failed to map readback buffer: {0}")]
    Map(String),
    #[error("fence failure: {0}")]
    Fence(String),
    #[error("readback pool is closed")]
    PoolClosed,
    #[error("buffer is {0}, expected Ready")]
    NotReady(&'static str),
}

/// Pixel conversion failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversionError {
    #[error("{which} buffer too small: need {required} bytes, have {actual}")]
    BufferTooSmall {
        which: &'static str,
        required: usize,
        actual: usize,
    },
    #[error("frame dimensions must be non-zero ({width}x{height})")]
    EmptyFrame { width: u32, height: u32 },
}

/// Remux failures are reported as warnings, never as fatal errors
#[derive(Debug, Error)]
pub enum RemuxError {
    #[error("failed to run ffmpeg for remux: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("remux exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("remux produced no output at {0}")]
    MissingOutput(PathBuf),
}

/// Top level error taxonomy of a recording
#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("{stream} encoder failed to start: {reason}")]
    Startup { stream: StreamKind, reason: String },
    #[error("{context}: {source}")]
    Config {
        context: String,
        #[source]
        source: ConfigError,
    },
    #[error("{stream} stream failed: {reason}")]
    Stream { stream: StreamKind, reason: String },
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

impl RecordingError {
    pub fn config(context: impl Into<String>, source: ConfigError) -> Self {
        RecordingError::Config {
            context: context.into(),
            source,
        }
    }

    pub fn startup(stream: StreamKind, reason: impl Into<String>) -> Self {
        RecordingError::Startup {
            stream,
            reason: reason.into(),
        }
    }

    pub fn stream(stream: StreamKind, reason: impl Into<String>) -> Self {
        RecordingError::Stream {
            stream,
            reason: reason.into(),
        }
    }

    pub fn is_startup(&self) -> bool {
        matches!(self, RecordingError::Startup { .. })
    }

    pub fn is_config(&self) -> bool {
        matches!(self, RecordingError::Config { .. })
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, RecordingError::Stream { .. })
    }
}

#[derive(Default)]
struct FailureInner {
    error: Mutex<Option<RecordingError>>,
    tripped: AtomicBool,
}

/// First-failure-wins error slot shared between the render thread and worker threads
#[derive(Clone, Default)]
pub struct FailureSlot {
    inner: Arc<FailureInner>,
}

impl FailureSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `error` unless an earlier failure is already recorded
    pub fn record(&self, error: RecordingError) {
        let mut slot = self
            .inner
            .error
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.inner.tripped.swap(true, Ordering::AcqRel) {
            tracing::debug!(error = %error, "suppressing secondary failure");
            return;
        }
        tracing::error!(error = %error, "recording failed");
        *slot = Some(error);
    }

    pub fn is_tripped(&self) -> bool {
        self.inner.tripped.load(Ordering::Acquire)
    }

    /// Take the recorded failure. The slot stays tripped afterwards.
    pub fn take(&self) -> Option<RecordingError> {
        self.inner
            .error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl fmt::Debug for FailureSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailureSlot")
            .field("tripped", &self.is_tripped())
            .finish()
    }
}
