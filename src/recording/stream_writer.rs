//! Encoder subprocess fed from a bounded queue
//!
//! One `StreamWriter` owns one ffmpeg process, the write end of its input pipe and a writer
//! thread. Producers push payloads into a bounded channel (blocking when it is full) and the
//! writer thread performs the blocking pipe writes in FIFO order.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{Child, ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, SendTimeoutError, Sender};
use serde_derive::{Deserialize, Serialize};

use super::ffmpeg_args::encoder_command;
use super::ffmpeg_log::{self, EncoderLog};
use super::named_pipe::NamedPipe;
use crate::error::{FailureSlot, RecordingError, StreamKind};

const FINISH_TIMEOUT: Duration = Duration::from_secs(1);
const PROBE_INTERVAL: Duration = Duration::from_millis(5);

/// Something the writer thread can put on an encoder pipe
pub trait Payload: Send + 'static {
    /// Bytes written by [`write_to`](Payload::write_to)
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write_to(&self, sink: &mut dyn Write) -> io::Result<()>;

    /// Give the payload's storage back to its pool. Called after writing, and for payloads
    /// discarded after a failure.
    fn recycle(self);
}

impl Payload for Vec<u8> {
    fn len(&self) -> usize {
        Vec::len(self)
    }

    fn write_to(&self, sink: &mut dyn Write) -> io::Result<()> {
        sink.write_all(self)
    }

    fn recycle(self) {}
}

/// Message types for the writer thread
enum WriterMessage<P> {
    Payload(P),
    Finish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    NotStarted,
    Starting,
    Streaming,
    Draining,
    Stopped,
}

/// How encoder input reaches the subprocess
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipeTransport {
    /// Named pipe where supported, stdin otherwise
    #[default]
    Auto,
    Stdin,
    NamedPipe,
}

impl PipeTransport {
    pub fn resolve(self) -> PipeTransport {
        match self {
            PipeTransport::Auto if cfg!(unix) => PipeTransport::NamedPipe,
            PipeTransport::Auto => PipeTransport::Stdin,
            PipeTransport::NamedPipe if !cfg!(unix) => {
                tracing::warn!("named pipes are not supported here, falling back to stdin");
                PipeTransport::Stdin
            }
            other => other,
        }
    }
}

/// Immutable launch configuration of one encoder process
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Position in `args` of the input placeholder, replaced by the pipe path or `-`
    pub input_index: Option<usize>,
    pub transport: PipeTransport,
    /// Where a named pipe is created
    pub pipe_dir: PathBuf,
    pub show_logs: bool,
    /// How long the encoder gets to open its input
    pub startup_timeout: Duration,
    /// With stdin transport, how long to watch for an immediate exit
    pub startup_probe: Duration,
}

/// Counters shared between the producer side and the writer thread
#[derive(Debug, Default)]
pub struct WriterStats {
    pushes: AtomicU64,
    writes: AtomicU64,
    bytes: AtomicU64,
}

impl WriterStats {
    /// Payloads accepted by `push`
    pub fn pushes(&self) -> u64 {
        self.pushes.load(Ordering::Relaxed)
    }

    /// Payloads fully written to the pipe
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

/// Cloneable producer handle onto a streaming writer's queue
pub struct StreamQueue<P> {
    kind: StreamKind,
    sender: Sender<WriterMessage<P>>,
    stats: Arc<WriterStats>,
}

impl<P> Clone for StreamQueue<P> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            sender: self.sender.clone(),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<P: Payload> StreamQueue<P> {
    /// Enqueue a payload, blocking while the queue is full
    pub fn push(&self, payload: P) -> Result<(), RecordingError> {
        match self.sender.send(WriterMessage::Payload(payload)) {
            Ok(()) => {
                self.stats.pushes.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(crossbeam_channel::SendError(message)) => {
                if let WriterMessage::Payload(payload) = message {
                    payload.recycle();
                }
                Err(RecordingError::stream(self.kind, "writer thread has stopped"))
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sender.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sender.is_empty()
    }
}

pub struct StreamWriter<P: Payload> {
    kind: StreamKind,
    launch: LaunchSpec,
    capacity: usize,
    state: WriterState,
    queue: Option<StreamQueue<P>>,
    writer_thread: Option<JoinHandle<bool>>,
    child: Option<Child>,
    log: EncoderLog,
    log_thread: Option<JoinHandle<()>>,
    pipe: Option<NamedPipe>,
    stats: Arc<WriterStats>,
    failure: FailureSlot,
}

impl<P: Payload> StreamWriter<P> {
    /// `capacity` bounds the queue; failures on the writer thread are recorded in `failure`
    pub fn new(kind: StreamKind, launch: LaunchSpec, capacity: usize, failure: FailureSlot) -> Self {
        Self {
            kind,
            launch,
            capacity: capacity.max(1),
            state: WriterState::NotStarted,
            queue: None,
            writer_thread: None,
            child: None,
            log: EncoderLog::default(),
            log_thread: None,
            pipe: None,
            stats: Arc::new(WriterStats::default()),
            failure,
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    pub fn stats(&self) -> Arc<WriterStats> {
        Arc::clone(&self.stats)
    }

    pub fn log(&self) -> &EncoderLog {
        &self.log
    }

    /// Spawn the encoder, open its input and start the writer thread
    pub fn start(&mut self) -> Result<(), RecordingError> {
        if self.state != WriterState::NotStarted {
            return Err(RecordingError::startup(self.kind, "writer was already started"));
        }
        self.state = WriterState::Starting;
        match self.spawn() {
            Ok(()) => {
                self.state = WriterState::Streaming;
                tracing::debug!(stream = %self.kind, "encoder streaming");
                Ok(())
            }
            Err(e) => {
                self.kill_child();
                self.join_log();
                self.pipe = None;
                self.state = WriterState::Stopped;
                Err(e)
            }
        }
    }

    fn spawn(&mut self) -> Result<(), RecordingError> {
        let kind = self.kind;
        let transport = self.launch.transport.resolve();

        let input = match transport {
            PipeTransport::NamedPipe => {
                let pipe = NamedPipe::create(&self.launch.pipe_dir, kind.label()).map_err(|e| {
                    RecordingError::startup(kind, format!("failed to create named pipe: {e}"))
                })?;
                let path = pipe.path().to_string_lossy().into_owned();
                self.pipe = Some(pipe);
                path
            }
            _ => "-".to_string(),
        };

        let mut args = self.launch.args.clone();
        if let Some(slot) = self.launch.input_index.and_then(|i| args.get_mut(i)) {
            *slot = input;
        }

        let program = &self.launch.program;
        let mut cmd = encoder_command(program);
        cmd.args(&args)
            .stdin(if transport == PipeTransport::Stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let command = format!("{} {}", program.display(), args.join(" "));
        tracing::debug!(stream = %kind, %command, "spawning encoder");

        let mut child = cmd.spawn().map_err(|e| {
            let reason = if e.kind() == io::ErrorKind::NotFound {
                format!("encoder binary not found: {}", program.display())
            } else {
                format!("failed to spawn {}: {e}", program.display())
            };
            RecordingError::startup(kind, reason)
        })?;

        if let Some(stderr) = child.stderr.take() {
            let (log, handle) = ffmpeg_log::monitor(kind, stderr, self.launch.show_logs);
            self.log = log;
            self.log_thread = handle;
        }

        self.child = Some(child);
        let sink = self.open_input()?;

        let (sender, receiver) = crossbeam_channel::bounded(self.capacity);
        let stats = Arc::clone(&self.stats);
        let failure = self.failure.clone();
        let log = self.log.clone();
        let handle = thread::Builder::new()
            .name(format!("{kind}-writer"))
            .spawn(move || writer_thread_fn(kind, sink, receiver, stats, failure, log))
            .map_err(|e| RecordingError::startup(kind, format!("failed to start writer thread: {e}")))?;

        self.writer_thread = Some(handle);
        self.queue = Some(StreamQueue {
            kind,
            sender,
            stats: Arc::clone(&self.stats),
        });
        Ok(())
    }

    fn open_input(&mut self) -> Result<Box<dyn Write + Send>, RecordingError> {
        let kind = self.kind;
        let timeout = self.launch.startup_timeout;
        let probe = self.launch.startup_probe;
        let attempt: Result<Box<dyn Write + Send>, String> = match (&self.pipe, self.child.as_mut()) {
            (_, None) => Err("encoder process is gone".to_string()),
            (Some(pipe), Some(child)) => match pipe.open_writer(child, timeout) {
                Ok(file) => Ok(Box::new(file)),
                Err(e) => Err(e.to_string()),
            },
            (None, Some(child)) => match probe_exit(child, probe) {
                Ok(Some(status)) => Err(format!("encoder exited during startup ({status})")),
                Ok(None) => match child.stdin.take() {
                    Some(stdin) => Ok(Box::new(stdin)),
                    None => Err("encoder stdin is not available".to_string()),
                },
                Err(e) => Err(format!("failed to poll encoder: {e}")),
            },
        };
        attempt.map_err(|reason| RecordingError::startup(kind, self.explain(&reason)))
    }

    /// Attach the encoder's own diagnosis, waiting briefly for stderr to be drained
    fn explain(&mut self, reason: &str) -> String {
        if let Some(child) = self.child.as_mut() {
            let _ = child.kill();
            let _ = child.wait();
        }
        self.join_log();
        match self.log.diagnosis() {
            Some(line) => format!("{reason}: {line}"),
            None => reason.to_string(),
        }
    }

    /// Producer handle for another thread. `None` unless streaming.
    pub fn queue(&self) -> Option<StreamQueue<P>> {
        match self.state {
            WriterState::Streaming => self.queue.clone(),
            _ => None,
        }
    }

    /// Enqueue a payload, blocking while the queue is full
    pub fn push(&self, payload: P) -> Result<(), RecordingError> {
        match (&self.queue, self.state) {
            (Some(queue), WriterState::Streaming) => queue.push(payload),
            (_, state) => {
                payload.recycle();
                Err(RecordingError::stream(
                    self.kind,
                    format!("cannot push while {state:?}"),
                ))
            }
        }
    }

    /// Drain the queue, close the pipe and wait for the encoder to exit.
    ///
    /// Every other [`StreamQueue`] handle must be dropped first or the drain never completes.
    pub fn finish(&mut self) -> Result<(), RecordingError> {
        match self.state {
            WriterState::Streaming => {}
            WriterState::NotStarted => {
                self.state = WriterState::Stopped;
                return Ok(());
            }
            _ => return Ok(()),
        }
        self.state = WriterState::Draining;
        tracing::debug!(stream = %self.kind, queued = self.queue.as_ref().map_or(0, |q| q.len()), "draining");

        if let Some(queue) = self.queue.take() {
            let _ = queue.sender.send(WriterMessage::Finish);
        }
        let healthy = self.join_writer();

        let status = match self.child.take() {
            Some(mut child) => child.wait().map(Some),
            None => Ok(None),
        };
        self.join_log();
        self.pipe = None;
        self.state = WriterState::Stopped;

        let status = status.map_err(|e| {
            RecordingError::stream(self.kind, format!("failed to wait for encoder: {e}"))
        })?;
        if let Some(status) = status.filter(|s| !s.success()) {
            let reason = self.with_diagnosis(format!("encoder exited with {status}"));
            return Err(RecordingError::stream(self.kind, reason));
        }
        if !healthy {
            let reason = self.with_diagnosis("pipe write failed".to_string());
            return Err(RecordingError::stream(self.kind, reason));
        }

        tracing::debug!(
            stream = %self.kind,
            writes = self.stats.writes(),
            bytes = self.stats.bytes(),
            "encoder finished"
        );
        Ok(())
    }

    /// Stop without waiting for the encoder to finish its output
    pub fn abort(&mut self) {
        if matches!(self.state, WriterState::Stopped | WriterState::NotStarted) {
            self.state = WriterState::Stopped;
            return;
        }
        self.state = WriterState::Draining;
        // killing first makes pending writes fail fast so the queue drains
        self.kill_child();
        if let Some(queue) = self.queue.take() {
            if let Err(SendTimeoutError::Timeout(_)) =
                queue.sender.send_timeout(WriterMessage::Finish, FINISH_TIMEOUT)
            {
                tracing::warn!(stream = %self.kind, "writer queue did not drain during abort");
            }
        }
        self.join_writer();
        self.join_log();
        self.pipe = None;
        self.state = WriterState::Stopped;
        tracing::debug!(stream = %self.kind, "encoder aborted");
    }

    fn with_diagnosis(&self, reason: String) -> String {
        match self.log.diagnosis() {
            Some(line) => format!("{reason}: {line}"),
            None => reason,
        }
    }

    fn join_writer(&mut self) -> bool {
        match self.writer_thread.take() {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                self.failure
                    .record(RecordingError::stream(self.kind, "writer thread panicked"));
                false
            }),
            None => true,
        }
    }

    fn join_log(&mut self) {
        if let Some(handle) = self.log_thread.take() {
            let _ = handle.join();
        }
    }

    fn kill_child(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl<P: Payload> Drop for StreamWriter<P> {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Watch for an encoder that exits right away. `Some(status)` if it did.
fn probe_exit(child: &mut Child, probe: Duration) -> io::Result<Option<ExitStatus>> {
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if start.elapsed() >= probe {
            return Ok(None);
        }
        thread::sleep(PROBE_INTERVAL);
    }
}

/// Writer thread function - performs the blocking pipe writes.
///
/// After the first failed write it keeps consuming and recycling payloads without writing, so
/// producers blocked on the queue or on pooled storage are never stranded. Returns whether every
/// write succeeded.
fn writer_thread_fn<P: Payload>(
    kind: StreamKind,
    mut sink: Box<dyn Write + Send>,
    receiver: Receiver<WriterMessage<P>>,
    stats: Arc<WriterStats>,
    failure: FailureSlot,
    log: EncoderLog,
) -> bool {
    let mut healthy = true;
    loop {
        match receiver.recv() {
            Ok(WriterMessage::Payload(payload)) => {
                if healthy {
                    let len = payload.len() as u64;
                    match payload.write_to(&mut *sink) {
                        Ok(()) => {
                            stats.writes.fetch_add(1, Ordering::Relaxed);
                            stats.bytes.fetch_add(len, Ordering::Relaxed);
                        }
                        Err(e) => {
                            healthy = false;
                            let reason = match log.diagnosis() {
                                Some(line) => format!("pipe write failed ({e}): {line}"),
                                None => format!("pipe write failed: {e}"),
                            };
                            failure.record(RecordingError::stream(kind, reason));
                        }
                    }
                }
                payload.recycle();
            }
            // Finish or every sender gone
            Ok(WriterMessage::Finish) | Err(_) => break,
        }
    }

    if healthy {
        if let Err(e) = sink.flush() {
            healthy = false;
            failure.record(RecordingError::stream(kind, format!("pipe flush failed: {e}")));
        }
    }
    // closing the pipe signals end of input
    drop(sink);
    healthy
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::Path;

    fn launch(script: &str, out: &Path, dir: &Path, transport: PipeTransport) -> LaunchSpec {
        LaunchSpec {
            program: PathBuf::from("sh"),
            args: vec![
                "-c".into(),
                script.into(),
                "sh".into(),
                "INPUT".into(),
                out.to_string_lossy().into_owned(),
            ],
            input_index: Some(3),
            transport,
            pipe_dir: dir.to_path_buf(),
            show_logs: false,
            startup_timeout: Duration::from_secs(10),
            startup_probe: Duration::from_millis(200),
        }
    }

    const COPY: &str = "if [ \"$1\" = - ]; then cat > \"$2\"; else cat \"$1\" > \"$2\"; fi";

    fn frames() -> Vec<Vec<u8>> {
        (0..50u8).map(|i| vec![i; 1000 + i as usize]).collect()
    }

    fn round_trip(transport: PipeTransport) {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("out.bin");
        let failure = FailureSlot::new();
        let mut writer = StreamWriter::new(
            StreamKind::Video,
            launch(COPY, &out, dir.path(), transport),
            4,
            failure.clone(),
        );
        assert_eq!(writer.state(), WriterState::NotStarted);

        writer.start().expect("start");
        assert_eq!(writer.state(), WriterState::Streaming);
        let queue = writer.queue().expect("queue");
        for frame in frames() {
            queue.push(frame).expect("push");
        }
        drop(queue);
        writer.finish().expect("finish");
        assert_eq!(writer.state(), WriterState::Stopped);

        let expected: Vec<u8> = frames().concat();
        assert_eq!(std::fs::read(&out).expect("output"), expected);
        let stats = writer.stats();
        assert_eq!((stats.pushes(), stats.writes()), (50, 50));
        assert_eq!(stats.bytes(), expected.len() as u64);
        assert!(!failure.is_tripped());
    }

    #[test]
    fn writes_in_order_over_named_pipe() {
        round_trip(PipeTransport::NamedPipe);
    }

    #[test]
    fn writes_in_order_over_stdin() {
        round_trip(PipeTransport::Stdin);
    }

    #[test]
    fn immediate_exit_is_a_startup_failure() {
        for transport in [PipeTransport::NamedPipe, PipeTransport::Stdin] {
            let dir = tempfile::tempdir().expect("tempdir");
            let out = dir.path().join("out.bin");
            let script = "echo 'Unknown encoder foo' >&2; exit 1";
            let mut writer: StreamWriter<Vec<u8>> = StreamWriter::new(
                StreamKind::Audio,
                launch(script, &out, dir.path(), transport),
                4,
                FailureSlot::new(),
            );
            let err = writer.start().expect_err("startup failure");
            assert!(err.is_startup(), "{err}");
            assert!(err.to_string().contains("Unknown encoder foo"), "{err}");
            assert_eq!(writer.state(), WriterState::Stopped);
            assert!(writer.push(vec![1, 2, 3]).is_err());
            assert_eq!(writer.stats().pushes(), 0);
        }
    }

    #[test]
    fn missing_binary_is_a_startup_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut spec = launch(COPY, &dir.path().join("out"), dir.path(), PipeTransport::Stdin);
        spec.program = dir.path().join("no-such-ffmpeg");
        let mut writer: StreamWriter<Vec<u8>> =
            StreamWriter::new(StreamKind::Video, spec, 4, FailureSlot::new());
        let err = writer.start().expect_err("missing binary");
        assert!(err.to_string().contains("not found"), "{err}");
    }

    #[test]
    fn crash_mid_stream_is_a_stream_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("out.bin");
        let script = "head -c 1000 \"$1\" > /dev/null; echo 'Conversion failed!' >&2; exit 1";
        let failure = FailureSlot::new();
        let mut writer = StreamWriter::new(
            StreamKind::Video,
            launch(script, &out, dir.path(), PipeTransport::NamedPipe),
            2,
            failure.clone(),
        );
        writer.start().expect("start");

        // keeps accepting pushes after the crash, discarding them
        for _ in 0..64 {
            writer.push(vec![0u8; 64 * 1024]).expect("push");
        }
        let err = writer.finish().expect_err("stream failure");
        assert!(err.is_stream(), "{err}");
        assert!(failure.is_tripped());
        assert!(failure.take().expect("recorded").is_stream());
    }

    #[test]
    fn abort_stops_a_running_encoder() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("out.bin");
        let mut writer = StreamWriter::new(
            StreamKind::Audio,
            launch(COPY, &out, dir.path(), PipeTransport::Stdin),
            8,
            FailureSlot::new(),
        );
        writer.start().expect("start");
        writer.push(vec![7u8; 128]).expect("push");
        writer.abort();
        assert_eq!(writer.state(), WriterState::Stopped);
        assert!(writer.queue().is_none());
    }
}
