//! Job configuration and run invocation

use std::io::Read;
use std::path::PathBuf;

use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use crate::{
    bridge::StreamBridge,
    coordinator::{Coordinator, ExtractSummary, ScanOptions, StreamInput},
    decoder::{AutoDecoder, OpenArchive},
    error::{ExtractError, Result},
    pattern::PatternMatcher,
    progress::{NoProgressReporter, ProgressReporter},
    sink::{DiskWriter, ExtractionSink, WriteOptions},
    source::ArchiveSource,
};

/// Default number of bytes the decoder reads at once
pub const DEFAULT_CHUNK_SIZE: usize = 262_144;

/// Largest accepted read chunk size
pub const MAX_CHUNK_SIZE: usize = 64 * 1024 * 1024;

/// Builder for configuring an extraction run
pub struct ExtractorBuilder<P: ProgressReporter = NoProgressReporter> {
    archive_path: Option<PathBuf>,
    reader: Option<Box<dyn Read + Send>>,
    verbosity: u8,
    sparse: bool,
    fast_read: bool,
    patterns: Vec<String>,
    chdir: Option<PathBuf>,
    chunk_size: usize,
    progress_reporter: P,
}

impl ExtractorBuilder<NoProgressReporter> {
    /// Create a new extractor builder
    pub fn new() -> Self {
        Self {
            archive_path: None,
            reader: None,
            verbosity: 0,
            sparse: false,
            fast_read: false,
            patterns: Vec::new(),
            chdir: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            progress_reporter: NoProgressReporter,
        }
    }
}

impl Default for ExtractorBuilder<NoProgressReporter> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: ProgressReporter> ExtractorBuilder<P> {
    /// Read the archive from a file. An empty path or `-` reads standard input.
    pub fn with_archive_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.archive_path = Some(path.into());
        self
    }

    /// Read the archive from a stream. Takes precedence over [`Self::with_archive_path`].
    pub fn with_reader(mut self, reader: impl Read + Send + 'static) -> Self {
        self.reader = Some(Box::new(reader));
        self
    }

    /// Log extracted entries (1) and skipped entries (2)
    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Write runs of zeros as holes
    pub fn with_sparse(mut self, sparse: bool) -> Self {
        self.sparse = sparse;
        self
    }

    /// Stop reading the archive once every pattern has matched an entry
    pub fn with_fast_read(mut self, fast_read: bool) -> Self {
        self.fast_read = fast_read;
        self
    }

    /// Only extract entries matching `pattern`. Can be called multiple times.
    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.patterns.push(pattern.into());
        self
    }

    /// Adds several inclusion patterns
    pub fn with_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.patterns.extend(patterns.into_iter().map(Into::into));
        self
    }

    /// Change into `dir` before extracting. The original directory is restored afterwards.
    pub fn with_chdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.chdir = Some(dir.into());
        self
    }

    /// Number of bytes read from the archive at once, between 1 and [`MAX_CHUNK_SIZE`]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Set a custom progress reporter
    pub fn with_progress_reporter<R: ProgressReporter>(self, reporter: R) -> ExtractorBuilder<R> {
        ExtractorBuilder {
            archive_path: self.archive_path,
            reader: self.reader,
            verbosity: self.verbosity,
            sparse: self.sparse,
            fast_read: self.fast_read,
            patterns: self.patterns,
            chdir: self.chdir,
            chunk_size: self.chunk_size,
            progress_reporter: reporter,
        }
    }

    /// Build the extractor
    pub fn build(self) -> Extractor<P> {
        let source = match (self.reader, self.archive_path) {
            (Some(reader), _) => ArchiveSource::Stream(reader),
            (None, Some(path)) => ArchiveSource::from_path(path),
            (None, None) => ArchiveSource::Stdin,
        };
        Extractor {
            source,
            verbosity: self.verbosity,
            sparse: self.sparse,
            fast_read: self.fast_read,
            patterns: self.patterns,
            chdir: self.chdir,
            chunk_size: self.chunk_size,
            progress_reporter: self.progress_reporter,
        }
    }
}

#[cfg(feature = "progress")]
impl ExtractorBuilder<NoProgressReporter> {
    /// Set an indicatif progress bar
    pub fn with_progress_bar(
        self,
        progress_bar: indicatif::ProgressBar,
    ) -> ExtractorBuilder<crate::progress::IndicatifProgressReporter> {
        self.with_progress_reporter(crate::progress::IndicatifProgressReporter::new(
            progress_bar,
        ))
    }
}

/// A configured extraction run. Consumed by [`Extractor::extract`].
pub struct Extractor<P: ProgressReporter = NoProgressReporter> {
    source: ArchiveSource,
    verbosity: u8,
    sparse: bool,
    fast_read: bool,
    patterns: Vec<String>,
    chdir: Option<PathBuf>,
    chunk_size: usize,
    progress_reporter: P,
}

impl Extractor<NoProgressReporter> {
    /// Shorthand for [`ExtractorBuilder::new`]
    pub fn builder() -> ExtractorBuilder<NoProgressReporter> {
        ExtractorBuilder::new()
    }
}

impl<P: ProgressReporter + Send + 'static> Extractor<P> {
    /// The archive source of this run
    pub fn source(&self) -> &ArchiveSource {
        &self.source
    }

    /// The policy the default disk writer uses for this run
    pub fn write_options(&self) -> WriteOptions {
        WriteOptions::default().with_sparse(self.sparse)
    }

    /// Extract the archive into the current (or configured) working directory.
    ///
    /// Cancelling `cancel` stops the run at the next entry boundary, or immediately if the
    /// decoder is waiting for input.
    pub async fn extract(self, cancel: CancellationToken) -> Result<ExtractSummary> {
        let sink = DiskWriter::new(self.write_options());
        self.extract_with(cancel, AutoDecoder, sink).await
    }

    /// Extract the archive with a custom decoder and sink.
    pub async fn extract_with<D, S>(
        self,
        cancel: CancellationToken,
        decoder: D,
        sink: S,
    ) -> Result<ExtractSummary>
    where
        D: OpenArchive + 'static,
        S: ExtractionSink + Send + 'static,
    {
        // Configuration problems surface before anything is opened.
        let matcher = PatternMatcher::new(&self.patterns)?;
        if !(1..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err(ExtractError::InvalidChunkSize(self.chunk_size));
        }

        tracing::debug!("extracting from {}", self.source.describe());
        let source = self.source.open()?;
        let (bridge, reader) = StreamBridge::new()?;
        let copy = bridge.spawn_copy(source, self.progress_reporter, self.chunk_size)?;
        let watchdog = bridge.spawn_watchdog(cancel.clone());

        let input = StreamInput {
            reader: Box::new(reader),
            write_end: Some(bridge.write_end()),
            source_error: bridge.source_error(),
        };
        let options = ScanOptions {
            verbosity: self.verbosity,
            fast_read: self.fast_read,
            chunk_size: self.chunk_size,
            chdir: self.chdir,
        };
        let coordinator = Coordinator::new(decoder, sink, matcher, options, cancel.clone());

        let joined = tokio::task::spawn_blocking(move || coordinator.run(input))
            .await
            .map_err(JoinError::try_into_panic);

        bridge.finish();
        if let Err(err) = watchdog.await {
            tracing::debug!("watchdog task failed: {err}");
        }

        let result = match joined {
            Ok(result) => result,
            Err(Err(_err)) => Err(ExtractError::Cancelled),
            Err(Ok(payload)) => std::panic::resume_unwind(payload),
        };

        // The write end is closed by now. A copy still blocked on the source (a terminal, a
        // stalled socket) is left behind, it cannot feed anything into the run any more.
        match copy.try_join() {
            Some(Ok(outcome)) => tracing::trace!(?outcome, "archive copy finished"),
            Some(Err(payload)) => std::panic::resume_unwind(payload),
            None => tracing::debug!("archive source is still blocked in a read, detaching the copy"),
        }

        result
    }
}
