//! The extraction state machine.
//!
//! A [`Coordinator`] drives one run on a blocking thread: it opens the decoder on the bridge's
//! read end, applies the pending working directory change, walks the archive headers, filters
//! them through the [`PatternMatcher`] and hands included entries to the [`ExtractionSink`].
//!
//! ```text
//! Opening -> Scanning -> (Matching -> Extracting)* -> Draining -> Closed
//!    |           |                        |              ^
//!    +-> Failed  +-> Cancelled            +-> Failed     | always
//! ```
//!
//! Draining always runs, whatever ended the scan.

use std::io::Read;
use std::path::PathBuf;

use tokio_util::sync::CancellationToken;

use crate::bridge::{PipeWriteEnd, SourceErrorSlot};
use crate::decoder::{ArchiveDecoder, HeaderStatus, OpenArchive};
use crate::directory::DirectoryContext;
use crate::error::{ExtractError, Result};
use crate::pattern::PatternMatcher;
use crate::sink::{ExtractionSink, Severity};

/// Number of consecutive retry statuses after which the decoder is considered stuck
pub const MAX_CONSECUTIVE_RETRIES: usize = 1024;

/// The states of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    /// Creating the decoder and sink
    Opening,
    /// Advancing to the next header
    Scanning,
    /// Deciding whether the current entry is included
    Matching,
    /// Handing the current entry to the sink
    Extracting,
    /// Releasing the decoder, the pipe and the sink
    Draining,
    /// The run completed
    Closed,
    /// The run was cancelled
    Cancelled,
    /// The run failed
    Failed,
}

/// What a run did.
#[derive(Debug, Default)]
pub struct ExtractSummary {
    /// Number of entries handed to the sink successfully
    pub extracted: usize,
    /// Number of entries that were not extracted because no pattern included them, or because
    /// their path was unreadable
    pub skipped: usize,
    /// Number of per-entry warnings (decoder warnings and retries, sink warnings)
    pub warnings: usize,
    /// True if fast-read stopped the scan before the end of the archive
    pub stopped_early: bool,
    /// Patterns that did not match any entry
    pub unmatched_patterns: Vec<String>,
    /// Set when the original working directory could not be restored
    pub restore_error: Option<ExtractError>,
}

/// Settings of a single scan.
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// 0 is silent, 1 logs every extracted path, 2 also logs skipped paths
    pub verbosity: u8,
    /// Stop once every pattern has matched
    pub fast_read: bool,
    /// Read chunk size handed to the decoder
    pub chunk_size: usize,
    /// Directory to change into before the first entry is written
    pub chdir: Option<PathBuf>,
}

/// The byte stream a coordinator decodes, together with the bridge handles it needs to drain.
pub struct StreamInput {
    /// The read end the decoder consumes
    pub reader: Box<dyn Read + Send>,
    /// The write end, closed while draining. `None` if the reader is not fed by a bridge.
    pub write_end: Option<PipeWriteEnd>,
    /// Where the copy task records source read failures
    pub source_error: SourceErrorSlot,
}

impl StreamInput {
    /// Input that does not come through a bridge
    pub fn from_reader(reader: impl Read + Send + 'static) -> Self {
        Self {
            reader: Box::new(reader),
            write_end: None,
            source_error: SourceErrorSlot::default(),
        }
    }
}

/// Drives a single extraction run.
pub struct Coordinator<D, S> {
    decoder: D,
    sink: S,
    matcher: PatternMatcher,
    options: ScanOptions,
    cancel: CancellationToken,
    state: ScanState,
}

impl<D: OpenArchive, S: ExtractionSink> Coordinator<D, S> {
    /// Creates a coordinator for one run
    pub fn new(
        decoder: D,
        sink: S,
        matcher: PatternMatcher,
        options: ScanOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            decoder,
            sink,
            matcher,
            options,
            cancel,
            state: ScanState::Opening,
        }
    }

    /// Runs the scan to completion. Blocks the calling thread.
    ///
    /// The working directory is the same after this returns as before, whatever the outcome. A
    /// failure to restore it never replaces the result of the run, it is logged and recorded in
    /// [`ExtractSummary::restore_error`].
    pub fn run(mut self, input: StreamInput) -> Result<ExtractSummary> {
        let mut directory = DirectoryContext::capture(self.options.chdir.take())?;
        let mut summary = ExtractSummary::default();

        let result = self.scan(&mut directory, input, &mut summary);

        if let Err(err) = directory.restore() {
            tracing::error!("{err}");
            summary.restore_error = Some(err);
        }

        result.map(|()| summary)
    }

    fn transition(&mut self, next: ScanState) {
        tracing::trace!(from = ?self.state, to = ?next, "scan state");
        self.state = next;
    }

    fn scan(
        &mut self,
        directory: &mut DirectoryContext,
        input: StreamInput,
        summary: &mut ExtractSummary,
    ) -> Result<()> {
        let StreamInput {
            reader,
            write_end,
            source_error,
        } = input;

        self.transition(ScanState::Opening);
        let result = match self.decoder.open(reader, self.options.chunk_size) {
            Ok(mut decoder) => {
                tracing::debug!(
                    "opened {} archive ({} compression)",
                    decoder.format().name(),
                    decoder.compression().name()
                );
                let result = directory
                    .apply()
                    .and_then(|()| self.scan_entries(decoder.as_mut(), summary));
                // The read end goes first, a copy task blocked in a pipe write then fails instead
                // of holding on to the write end.
                drop(decoder);
                result
            }
            Err(err) => Err(ExtractError::DecodeOpen(err)),
        };

        self.transition(ScanState::Draining);
        if let Some(write_end) = &write_end {
            write_end.close();
        }
        let finished = self.sink.finish().map_err(ExtractError::FinishSink);

        // A decoder failure is usually a consequence of the source failing. A source that fails
        // on an entry boundary looks like a clean end of the archive to the decoder, so the slot
        // is checked after a complete scan too.
        let result = match result {
            Ok(()) if !summary.stopped_early => match source_error.take() {
                Some(err) => {
                    tracing::error!("archive source failed: {err}");
                    Err(ExtractError::ReadSource(err))
                }
                None => Ok(()),
            },
            Err(err @ (ExtractError::DecodeOpen(_) | ExtractError::DecodeFatal { .. })) => {
                Err(source_error.take().map(ExtractError::ReadSource).unwrap_or(err))
            }
            other => other,
        };

        let result = match (result, finished) {
            (Ok(()), finished) => finished,
            (Err(err), Err(finish_err)) => {
                tracing::warn!("{finish_err}");
                Err(err)
            }
            (Err(err), Ok(())) => Err(err),
        };

        let result = if self.cancel.is_cancelled() {
            Err(ExtractError::Cancelled)
        } else {
            result
        };

        match &result {
            Ok(()) => {
                self.transition(ScanState::Closed);
                summary.unmatched_patterns = self.matcher.unmatched().map(String::from).collect();
                for pattern in &summary.unmatched_patterns {
                    tracing::warn!("{pattern}: not found in archive");
                }
            }
            Err(ExtractError::Cancelled) => self.transition(ScanState::Cancelled),
            Err(_) => self.transition(ScanState::Failed),
        }
        result
    }

    fn scan_entries(
        &mut self,
        decoder: &mut dyn ArchiveDecoder,
        summary: &mut ExtractSummary,
    ) -> Result<()> {
        let mut cursor = decoder
            .entries()
            .map_err(|err| ExtractError::decode_fatal(err.to_string()))?;
        let mut retries = 0usize;

        loop {
            self.transition(ScanState::Scanning);
            if self.cancel.is_cancelled() {
                return Err(ExtractError::Cancelled);
            }
            if self.options.fast_read && self.matcher.all_satisfied() {
                tracing::debug!("every pattern has matched, stopping the scan");
                summary.stopped_early = true;
                return Ok(());
            }

            let mut entry = match cursor.next_entry() {
                HeaderStatus::Entry(entry) => {
                    retries = 0;
                    entry
                }
                HeaderStatus::Eof => return Ok(()),
                HeaderStatus::Fatal(message) => return Err(self.decode_failure(message)),
                HeaderStatus::Warning(message) => {
                    retries = 0;
                    tracing::warn!("{message}");
                    summary.warnings += 1;
                    continue;
                }
                HeaderStatus::Retry(message) => {
                    retries += 1;
                    if retries > MAX_CONSECUTIVE_RETRIES {
                        return Err(self.decode_failure(format!(
                            "giving up after {MAX_CONSECUTIVE_RETRIES} retries: {message}"
                        )));
                    }
                    tracing::warn!("{message}, retrying");
                    summary.warnings += 1;
                    continue;
                }
            };

            self.transition(ScanState::Matching);
            let descriptor = entry.descriptor().clone();
            if descriptor.path.is_empty() {
                tracing::warn!("skipping entry with an unreadable path name");
                summary.warnings += 1;
                summary.skipped += 1;
                continue;
            }
            if self.matcher.excluded(&descriptor.path) {
                if self.options.verbosity > 1 {
                    tracing::debug!("skipping {}", descriptor.path);
                }
                summary.skipped += 1;
                if let Err(err) = entry.skip_data() {
                    // The next header read reports the broken stream.
                    tracing::debug!("failed to skip {}: {err}", descriptor.path);
                }
                continue;
            }

            self.transition(ScanState::Extracting);
            if self.options.verbosity > 0 {
                tracing::info!("x {}", descriptor.path);
            }
            match self.sink.extract(&descriptor, &mut entry) {
                Ok(()) => summary.extracted += 1,
                Err(err) if err.severity() == Severity::Warning => {
                    tracing::warn!("{}: {err}", descriptor.path);
                    summary.warnings += 1;
                }
                Err(err) => {
                    if self.cancel.is_cancelled() {
                        return Err(ExtractError::Cancelled);
                    }
                    return Err(ExtractError::extract_fatal(descriptor.path, err));
                }
            }
        }
    }

    fn decode_failure(&self, message: String) -> ExtractError {
        if self.cancel.is_cancelled() {
            return ExtractError::Cancelled;
        }
        tracing::error!("error reading archive: {message}");
        ExtractError::decode_fatal(message)
    }
}
