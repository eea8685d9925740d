//! Streams the archive source into the decoder through an OS pipe.
//!
//! The decoder performs plain blocking reads on the read end of the pipe. Nothing can interrupt
//! such a read except the other side of the pipe going away, so the write end is owned by the
//! bridge and can be closed from two places:
//!
//! - the copy thread, once the source is exhausted or fails;
//! - the watchdog task, as soon as the run is cancelled.
//!
//! Closing is idempotent, whichever side gets there second does nothing.
//!
//! The copy runs on its own thread rather than on the runtime's blocking pool. A source such as a
//! terminal or a stalled socket can keep it inside `read` indefinitely, and a detached thread does
//! not hold up the run or the shutdown of the runtime.

use std::io::{self, PipeReader, PipeWriter, Read, Write};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{ExtractError, Result};
use crate::progress::{ProgressReporter, ReportingReader, StreamEnd};
use crate::source::OpenedSource;

/// Upper bound for the copy buffer, independent of the decoder chunk size.
const MAX_COPY_BUFFER: usize = 1024 * 1024;

/// The write end of the bridge pipe, shared between the copy task and the watchdog.
#[derive(Clone)]
pub struct PipeWriteEnd {
    inner: Arc<Mutex<Option<PipeWriter>>>,
}

impl PipeWriteEnd {
    fn new(writer: PipeWriter) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(writer))),
        }
    }

    /// Writes the whole buffer, failing with [`io::ErrorKind::BrokenPipe`] once the end has been
    /// closed.
    pub fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        match self.inner.lock().as_mut() {
            Some(writer) => writer.write_all(buf),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "archive pipe has been closed",
            )),
        }
    }

    /// Closes the write end. Returns false if it was already closed.
    pub fn close(&self) -> bool {
        self.inner.lock().take().is_some()
    }

    /// Returns true once the write end has been closed
    pub fn is_closed(&self) -> bool {
        self.inner.lock().is_none()
    }
}

/// Closes the write end when dropped, also while unwinding.
struct CloseOnDrop(PipeWriteEnd);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// How the copy task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    /// The whole source was written into the pipe
    Completed { bytes: u64 },
    /// The pipe went away first (cancellation, or the decoder stopped reading)
    Disconnected { bytes: u64 },
    /// Reading the source failed, the error is kept in the bridge's source error slot
    SourceFailed { bytes: u64 },
}

/// Holds the first error the copy task got from the source.
#[derive(Clone, Default)]
pub struct SourceErrorSlot {
    inner: Arc<Mutex<Option<io::Error>>>,
}

impl SourceErrorSlot {
    pub(crate) fn store(&self, err: io::Error) {
        self.inner.lock().get_or_insert(err);
    }

    /// Takes the recorded source error, if any
    pub fn take(&self) -> Option<io::Error> {
        self.inner.lock().take()
    }
}

/// The pipe between an archive source and the decoder.
pub struct StreamBridge {
    write_end: PipeWriteEnd,
    source_error: SourceErrorSlot,
    finished: CancellationToken,
}

impl StreamBridge {
    /// Creates the pipe. The returned read end is handed to the decoder.
    pub fn new() -> Result<(Self, PipeReader)> {
        let (reader, writer) = io::pipe().map_err(ExtractError::CreatePipe)?;
        let bridge = Self {
            write_end: PipeWriteEnd::new(writer),
            source_error: SourceErrorSlot::default(),
            finished: CancellationToken::new(),
        };
        Ok((bridge, reader))
    }

    /// Returns a handle to the write end
    pub fn write_end(&self) -> PipeWriteEnd {
        self.write_end.clone()
    }

    /// Returns a handle to the slot the copy task records source errors in
    pub fn source_error(&self) -> SourceErrorSlot {
        self.source_error.clone()
    }

    /// Starts copying `source` into the pipe on a dedicated thread.
    ///
    /// The write end is closed when the copy ends, for whatever reason, so the decoder observes
    /// the end of the stream. A source error is recorded before the close.
    pub fn spawn_copy<P>(
        &self,
        source: OpenedSource,
        reporter: P,
        chunk_size: usize,
    ) -> Result<CopyTask>
    where
        P: ProgressReporter + Send + 'static,
    {
        let write_end = self.write_end.clone();
        let source_error = self.source_error.clone();
        let finished = self.finished.clone().drop_guard();

        let handle = thread::Builder::new()
            .name("rattler-extract-copy".to_string())
            .spawn(move || {
                let _finished = finished;
                let close = CloseOnDrop(write_end);

                let mut reader = ReportingReader::start(source.reader, source.len, reporter);
                let outcome = copy_into_pipe(&mut reader, &close.0, chunk_size, &source_error);
                drop(close);

                let streamed = reader.streamed();
                reader.end(match outcome {
                    CopyOutcome::Completed { .. } => StreamEnd::Complete,
                    CopyOutcome::Disconnected { .. } => StreamEnd::Stopped,
                    CopyOutcome::SourceFailed { .. } => StreamEnd::Failed,
                });
                tracing::trace!(?outcome, streamed, "archive copy thread finished");
                outcome
            })
            .map_err(ExtractError::StartCopy)?;

        Ok(CopyTask { handle })
    }

    /// Starts the watchdog. When `cancel` fires before the copy task finishes the write end is
    /// closed, which unblocks any read the decoder is stuck in.
    pub fn spawn_watchdog(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let write_end = self.write_end.clone();
        let finished = self.finished.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("extraction cancelled, closing the archive pipe");
                    // Closing may have to wait for a pipe write that is in flight.
                    let _ = tokio::task::spawn_blocking(move || write_end.close()).await;
                }
                _ = finished.cancelled() => {}
            }
        })
    }

    /// Releases the watchdog once the run no longer needs it.
    pub fn finish(&self) {
        self.finished.cancel();
    }
}

/// The thread streaming the source into the pipe.
pub struct CopyTask {
    handle: thread::JoinHandle<CopyOutcome>,
}

impl CopyTask {
    /// Returns true once the copy has returned
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Collects the outcome of a copy that has already returned, without blocking.
    ///
    /// A copy that is still waiting on the source is detached and `None` is returned. Its write
    /// end is closed by then, so it ends at its next source read boundary at the latest.
    pub fn try_join(self) -> Option<thread::Result<CopyOutcome>> {
        if self.handle.is_finished() {
            Some(self.handle.join())
        } else {
            None
        }
    }
}

fn copy_into_pipe(
    source: &mut impl Read,
    write_end: &PipeWriteEnd,
    chunk_size: usize,
    source_error: &SourceErrorSlot,
) -> CopyOutcome {
    let mut buf = vec![0u8; chunk_size.clamp(1, MAX_COPY_BUFFER)];
    let mut bytes = 0u64;
    loop {
        let n = match source.read(&mut buf) {
            Ok(0) => return CopyOutcome::Completed { bytes },
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                source_error.store(err);
                return CopyOutcome::SourceFailed { bytes };
            }
        };

        if write_end.write_all(&buf[..n]).is_err() {
            return CopyOutcome::Disconnected { bytes };
        }
        bytes += n as u64;
    }
}
