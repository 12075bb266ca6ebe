//! Human-readable diagnostics sink.
//!
//! The container can read or replace the writer a factory prints status
//! lines to (pool acquired/closed, match attempts, shutdown signal). It
//! defaults to stdout. Structured logging goes through `tracing` regardless.

use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

use parking_lot::Mutex;

/// Shared, replaceable line writer.
#[derive(Clone)]
pub struct LogWriter {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl LogWriter {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    pub fn new(writer: impl Write + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// Write one status line. Write failures are reported through `tracing`
    /// and otherwise ignored.
    pub fn line(&self, message: impl fmt::Display) {
        let mut writer = self.inner.lock();
        if let Err(err) = writeln!(writer, "{message}").and_then(|_| writer.flush()) {
            tracing::warn!(error = %err, "failed to write diagnostics line");
        }
    }

    /// Whether two writers share the same destination.
    pub fn same_as(&self, other: &LogWriter) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for LogWriter {
    fn default() -> Self {
        Self::stdout()
    }
}

impl fmt::Debug for LogWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogWriter").finish_non_exhaustive()
    }
}

/// In-memory writer whose contents can be read back.
#[derive(Clone, Debug, Default)]
pub struct CaptureBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl CaptureBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.bytes.lock()).into_owned()
    }

    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_string).collect()
    }
}

impl Write for CaptureBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
