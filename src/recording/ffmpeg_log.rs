//! Encoder stderr monitoring
//!
//! Every encoder gets a thread that forwards its stderr to the log, keeps the last lines around
//! for diagnostics and remembers the first line that looks like a fatal encoder complaint.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crate::error::StreamKind;

const TAIL_LINES: usize = 20;

const ERROR_MARKERS: &[&str] = &[
    "error setting",
    "error initializing",
    "invalid",
    "incompatible",
    "not divisible",
    "exceeds",
    "failed",
    "no capable devices found",
    "does not support",
];

/// True when an encoder log line reports a failure worth surfacing
pub fn is_error_line(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    ERROR_MARKERS.iter().any(|marker| lower.contains(marker))
}

#[derive(Default)]
struct LogState {
    tail: VecDeque<String>,
    flagged: Option<String>,
}

/// Shared view of what an encoder printed so far
#[derive(Clone, Default)]
pub struct EncoderLog {
    state: Arc<Mutex<LogState>>,
}

impl EncoderLog {
    fn push(&self, line: String) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.flagged.is_none() && is_error_line(&line) {
            state.flagged = Some(line.clone());
        }
        if state.tail.len() == TAIL_LINES {
            state.tail.pop_front();
        }
        state.tail.push_back(line);
    }

    /// First flagged line
    pub fn flagged(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flagged
            .clone()
    }

    pub fn tail(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tail
            .iter()
            .cloned()
            .collect()
    }

    /// Best single line explaining a failure: the flagged line, else the last line printed
    pub fn diagnosis(&self) -> Option<String> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.flagged.clone().or_else(|| state.tail.back().cloned())
    }
}

/// Start forwarding `stderr` to the log. The thread ends when the encoder closes stderr.
pub fn monitor<R: Read + Send + 'static>(
    kind: StreamKind,
    stderr: R,
    show_logs: bool,
) -> (EncoderLog, Option<JoinHandle<()>>) {
    let log = EncoderLog::default();
    let shared = log.clone();
    let handle = thread::Builder::new()
        .name(format!("{kind}-encoder-log"))
        .spawn(move || {
            let mut reader = BufReader::new(stderr);
            let mut raw = Vec::new();
            loop {
                raw.clear();
                match reader.read_until(b'\n', &mut raw) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(stream = %kind, error = %e, "encoder stderr closed");
                        break;
                    }
                }
                // progress lines are separated by carriage returns
                let text = String::from_utf8_lossy(&raw);
                for line in text.split(['\r', '\n']).map(str::trim).filter(|l| !l.is_empty()) {
                    if is_error_line(line) {
                        tracing::warn!(stream = %kind, "{line}");
                    } else if show_logs {
                        tracing::info!(stream = %kind, "{line}");
                    } else {
                        tracing::debug!(stream = %kind, "{line}");
                    }
                    shared.push(line.to_string());
                }
            }
        });

    match handle {
        Ok(handle) => (log, Some(handle)),
        Err(e) => {
            tracing::warn!(stream = %kind, error = %e, "failed to start encoder log thread");
            (log, None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn flags_known_failure_lines() {
        assert!(is_error_line("[h264_nvenc @ 0x1] No capable devices found"));
        assert!(is_error_line("Error initializing output stream 0:0"));
        assert!(is_error_line("height not divisible by 2 (1920x1081)"));
        assert!(!is_error_line("frame=  120 fps= 60 q=-1.0 size=1024kB"));
    }

    #[test]
    fn keeps_tail_and_first_flagged_line() {
        let input = "Input #0, rawvideo\r\nframe=1\rframe=2\nInvalid argument\nlater failed line\nbye\n";
        let (log, handle) = monitor(StreamKind::Video, Cursor::new(input.as_bytes().to_vec()), false);
        handle.expect("log thread").join().expect("join");

        assert_eq!(log.flagged().as_deref(), Some("Invalid argument"));
        assert_eq!(log.diagnosis().as_deref(), Some("Invalid argument"));
        let tail = log.tail();
        assert_eq!(tail.first().map(String::as_str), Some("Input #0, rawvideo"));
        assert_eq!(tail.last().map(String::as_str), Some("bye"));
        assert_eq!(tail.len(), 6);
    }

    #[test]
    fn diagnosis_falls_back_to_last_line() {
        let (log, handle) = monitor(StreamKind::Audio, Cursor::new(b"one\ntwo\n".to_vec()), true);
        handle.expect("log thread").join().expect("join");
        assert_eq!(log.flagged(), None);
        assert_eq!(log.diagnosis().as_deref(), Some("two"));
    }
}
