//! Progress reporting for archive extraction
//!
//! Progress is measured in bytes moved from the archive source into the decoder. That is the only
//! quantity known up front (for regular files) without understanding the archive format.

#[cfg(feature = "progress")]
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Read};

/// How streaming the source into the decoder ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The whole source was handed to the decoder
    Complete,
    /// The decoder stopped reading, or the run was cancelled
    Stopped,
    /// Reading the source failed
    Failed,
}

/// Receives progress of the archive source while it is streamed into the decoder.
///
/// All methods are called from the blocking thread that copies the source.
pub trait ProgressReporter {
    /// Called once the source is open, with its size if it is known
    fn on_source_opened(&self, total_bytes: Option<u64>);

    /// Called with the total number of bytes streamed so far
    fn on_streamed(&self, streamed_bytes: u64);

    /// Called once, after the last byte was streamed
    fn on_stream_end(&self, end: StreamEnd);
}

/// A no-op progress reporter
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgressReporter;

impl ProgressReporter for NoProgressReporter {
    fn on_source_opened(&self, _total_bytes: Option<u64>) {}
    fn on_streamed(&self, _streamed_bytes: u64) {}
    fn on_stream_end(&self, _end: StreamEnd) {}
}

/// Drives an [`indicatif::ProgressBar`].
///
/// Sources of unknown size (standard input, caller supplied streams) leave the bar without a
/// length, so it renders as a spinner with a byte counter.
#[cfg(feature = "progress")]
pub struct IndicatifProgressReporter {
    progress_bar: ProgressBar,
}

#[cfg(feature = "progress")]
impl IndicatifProgressReporter {
    pub fn new(progress_bar: ProgressBar) -> Self {
        Self { progress_bar }
    }

    /// Creates a bar with the default byte oriented style
    pub fn with_default_style() -> Self {
        let progress_bar = ProgressBar::new(0);
        progress_bar.set_style(
            ProgressStyle::default_bar()
                .template("{prefix:.bold.dim} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}")
                .expect("progress template is valid")
                .progress_chars("#>-"),
        );
        Self { progress_bar }
    }

    /// The bar this reporter updates
    pub fn progress_bar(&self) -> &ProgressBar {
        &self.progress_bar
    }
}

#[cfg(feature = "progress")]
impl ProgressReporter for IndicatifProgressReporter {
    fn on_source_opened(&self, total_bytes: Option<u64>) {
        match total_bytes {
            Some(total) => self.progress_bar.set_length(total),
            None => self.progress_bar.unset_length(),
        }
    }

    fn on_streamed(&self, streamed_bytes: u64) {
        self.progress_bar.set_position(streamed_bytes);
    }

    fn on_stream_end(&self, end: StreamEnd) {
        match end {
            StreamEnd::Complete => self.progress_bar.finish_with_message("done"),
            StreamEnd::Stopped => self.progress_bar.abandon_with_message("stopped"),
            StreamEnd::Failed => self.progress_bar.abandon_with_message("failed to read archive"),
        }
    }
}

/// Counts the bytes pulled out of the source and forwards the running total to a reporter.
pub(crate) struct ReportingReader<R, P> {
    inner: R,
    reporter: P,
    streamed: u64,
}

impl<R: Read, P: ProgressReporter> ReportingReader<R, P> {
    /// Wraps `inner` and announces the source to `reporter`
    pub(crate) fn start(inner: R, total_bytes: Option<u64>, reporter: P) -> Self {
        reporter.on_source_opened(total_bytes);
        Self {
            inner,
            reporter,
            streamed: 0,
        }
    }

    pub(crate) fn streamed(&self) -> u64 {
        self.streamed
    }

    /// Reports how streaming ended and releases the source
    pub(crate) fn end(self, end: StreamEnd) {
        self.reporter.on_stream_end(end);
    }
}

impl<R: Read, P: ProgressReporter> Read for ReportingReader<R, P> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.streamed += n as u64;
            self.reporter.on_streamed(self.streamed);
        }
        Ok(n)
    }
}
