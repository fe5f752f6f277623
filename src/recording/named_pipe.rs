//! Named pipe transport for encoder input
//!
//! The fifo is created before the encoder is spawned and opened for writing only once the
//! encoder has opened its read end. Opening is non-blocking so an encoder that dies during
//! startup is noticed instead of hanging the open forever.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, ExitStatus};
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipeOpenError {
    #[error("encoder exited before opening its input ({0})")]
    EncoderExited(ExitStatus),
    #[error("encoder did not open its input within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A fifo on disk, removed on drop
#[derive(Debug)]
pub struct NamedPipe {
    path: PathBuf,
}

impl NamedPipe {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for NamedPipe {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::debug!(path = %self.path.display(), error = %e, "failed to remove named pipe");
            }
        }
    }
}

#[cfg(unix)]
mod imp {
    use std::ffi::CString;
    use std::fs::{File, OpenOptions};
    use std::io;
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::io::AsRawFd;
    use std::path::Path;
    use std::process::Child;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::{NamedPipe, PipeOpenError};
    use crate::utils::random_hex;

    const OPEN_RETRY: Duration = Duration::from_millis(5);

    #[cfg(target_os = "linux")]
    const PIPE_SIZE: libc::c_int = 64 * 1024;

    pub fn create(dir: &Path, stem: &str) -> io::Result<NamedPipe> {
        let path = dir.join(format!("{stem}-{}.pipe", random_hex(8)));
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        // SAFETY: c_path is a valid NUL terminated string for the duration of the call
        let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(NamedPipe { path })
    }

    pub fn open_writer(
        pipe: &NamedPipe,
        child: &mut Child,
        timeout: Duration,
    ) -> Result<File, PipeOpenError> {
        let start = Instant::now();
        loop {
            let attempt = OpenOptions::new()
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(&pipe.path);
            match attempt {
                Ok(file) => {
                    set_blocking(&file)?;
                    #[cfg(target_os = "linux")]
                    raise_pipe_size(&file);
                    return Ok(file);
                }
                // no reader yet
                Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
                    if let Some(status) = child.try_wait()? {
                        return Err(PipeOpenError::EncoderExited(status));
                    }
                    if start.elapsed() >= timeout {
                        return Err(PipeOpenError::Timeout(timeout));
                    }
                    thread::sleep(OPEN_RETRY);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn set_blocking(file: &File) -> io::Result<()> {
        let fd = file.as_raw_fd();
        // SAFETY: fd is owned by `file` and stays open for both calls
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            if flags < 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn raise_pipe_size(file: &File) {
        // SAFETY: fd is owned by `file`
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETPIPE_SZ, PIPE_SIZE) };
        if rc < 0 {
            tracing::debug!(error = %io::Error::last_os_error(), "could not raise pipe buffer size");
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use std::fs::File;
    use std::io;
    use std::path::Path;
    use std::process::Child;
    use std::time::Duration;

    use super::{NamedPipe, PipeOpenError};

    pub fn create(_dir: &Path, _stem: &str) -> io::Result<NamedPipe> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "named pipes are only supported on unix",
        ))
    }

    pub fn open_writer(
        _pipe: &NamedPipe,
        _child: &mut Child,
        _timeout: Duration,
    ) -> Result<File, PipeOpenError> {
        Err(io::Error::from(io::ErrorKind::Unsupported).into())
    }
}

impl NamedPipe {
    /// Create a fifo named `<stem>-<random hex>.pipe` in `dir`
    pub fn create(dir: &Path, stem: &str) -> io::Result<Self> {
        imp::create(dir, stem)
    }

    /// Open the write end once `child` has opened the read end, then switch to blocking writes
    pub fn open_writer(&self, child: &mut Child, timeout: Duration) -> Result<File, PipeOpenError> {
        imp::open_writer(self, child, timeout)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::FileTypeExt;
    use std::process::{Command, Stdio};

    #[test]
    fn fifo_is_created_and_removed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = {
            let pipe = NamedPipe::create(dir.path(), "video").expect("mkfifo");
            let meta = std::fs::metadata(pipe.path()).expect("metadata");
            assert!(meta.file_type().is_fifo());
            let name = pipe.path().file_name().and_then(|n| n.to_str()).expect("name");
            assert!(name.starts_with("video-") && name.ends_with(".pipe"));
            pipe.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn writes_reach_the_reader() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("out.bin");
        let pipe = NamedPipe::create(dir.path(), "audio").expect("mkfifo");
        let mut child = Command::new("sh")
            .arg("-c")
            .arg("cat \"$1\" > \"$2\"")
            .arg("sh")
            .arg(pipe.path())
            .arg(&out)
            .stdin(Stdio::null())
            .spawn()
            .expect("spawn sh");

        let mut file = pipe
            .open_writer(&mut child, Duration::from_secs(10))
            .expect("open writer");
        file.write_all(b"hello fifo").expect("write");
        drop(file);

        assert!(child.wait().expect("wait").success());
        assert_eq!(std::fs::read(&out).expect("read"), b"hello fifo");
    }

    #[test]
    fn early_exit_is_detected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pipe = NamedPipe::create(dir.path(), "video").expect("mkfifo");
        let mut child = Command::new("sh")
            .arg("-c")
            .arg("exit 3")
            .spawn()
            .expect("spawn sh");

        let err = pipe
            .open_writer(&mut child, Duration::from_secs(10))
            .expect_err("encoder exited");
        assert!(matches!(err, PipeOpenError::EncoderExited(status) if status.code() == Some(3)));
    }
}
