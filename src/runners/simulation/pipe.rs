//! # Out-of-band error channel.
//!
//! A failing script's traceback cannot travel over the host's stdout (reserved for
//! control tokens), so the host writes it as one backslash-escaped line into a
//! named pipe after announcing `SCRIPT-ENCOUNTERED-ERROR`.
//!
//! The pipe is a single shared resource: it is deleted and re-made whenever a host
//! process is started so no stale reader or writer survives.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::unix::pipe;
use tracing::debug;

/// Named pipe carrying one error line per failed run.
#[derive(Debug, Clone)]
pub(crate) struct ErrorPipe {
    path: PathBuf,
}

impl ErrorPipe {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deletes any existing node at the path and creates a fresh FIFO.
    pub fn recreate(&self) -> io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed stale pipe"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let c_path = CString::new(self.path.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: `c_path` is a valid NUL-terminated string that outlives the call.
        let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    /// Reads one line, waiting at most `timeout` for the writer.
    ///
    /// The pipe is opened read-write so the open never blocks and the read can be
    /// abandoned on timeout.
    pub async fn read_line(&self, timeout: Duration) -> io::Result<String> {
        let rx = pipe::OpenOptions::new()
            .read_write(true)
            .open_receiver(&self.path)?;
        let mut reader = BufReader::new(rx);
        let mut line = String::new();
        match tokio::time::timeout(timeout, reader.read_line(&mut line)).await {
            Ok(read) => {
                read?;
                Ok(line)
            }
            Err(_elapsed) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "no error text arrived on the pipe",
            )),
        }
    }
}
