//! Cancellable, pattern-filtered extraction of archive streams
//!
//! This crate extracts the entries of a (possibly compressed) archive to disk. The archive is
//! read from a file, standard input or any [`std::io::Read`] implementation. Its format and
//! compression are detected from the content.
//!
//! # Features
//!
//! - tar (v7, ustar, GNU, pax) and ZIP archives, compressed with gzip, bzip2, xz or zstd
//! - Inclusion patterns (shell globs) with an optional fast-read mode that stops as soon as every
//!   pattern has matched
//! - Cancellation through a [`CancellationToken`], even while the decoder is blocked on input
//! - A scoped working directory change that is always undone
//! - Safe defaults: no absolute paths, no `..`, no writing through or escaping via symlinks
//! - Progress reporting via `indicatif`
//!
//! # Examples
//!
//! ## Basic extraction
//!
//! ```no_run
//! use rattler_extract::ExtractorBuilder;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> rattler_extract::Result<()> {
//! let summary = ExtractorBuilder::new()
//!     .with_archive_path("archive.tar.gz")
//!     .with_chdir("output_dir")
//!     .build()
//!     .extract(CancellationToken::new())
//!     .await?;
//! println!("extracted {} entries", summary.extracted);
//! # Ok(())
//! # }
//! ```
//!
//! ## Selected entries only
//!
//! ```no_run
//! use rattler_extract::ExtractorBuilder;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> rattler_extract::Result<()> {
//! let cancel = CancellationToken::new();
//! ExtractorBuilder::new()
//!     .with_archive_path("-")
//!     .with_pattern("docs")
//!     .with_pattern("*.md")
//!     .with_fast_read(true)
//!     .build()
//!     .extract(cancel.clone())
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! [`CancellationToken`]: tokio_util::sync::CancellationToken

pub mod bridge;
pub mod coordinator;
pub mod decoder;
pub mod directory;
pub mod error;
pub mod extractor;
pub mod format;
pub mod pattern;
pub mod progress;
pub mod sink;
pub mod source;

pub use coordinator::{ExtractSummary, ScanState};
pub use decoder::{
    version_details, ArchiveDecoder, ArchiveEntry, AutoDecoder, DecodeError, EntryCursor,
    EntryDescriptor, EntryKind, HeaderStatus, OpenArchive,
};
pub use error::{ErrorKind, ExtractError, Result};
pub use extractor::{Extractor, ExtractorBuilder, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
pub use format::{ArchiveFormat, Compression};
pub use pattern::PatternMatcher;
pub use progress::{NoProgressReporter, ProgressReporter, StreamEnd};
pub use sink::{DiskWriter, ExtractionSink, Severity, SinkError, WriteOptions};
pub use source::ArchiveSource;

#[cfg(feature = "progress")]
pub use progress::IndicatifProgressReporter;
