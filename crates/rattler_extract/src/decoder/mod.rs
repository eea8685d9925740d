//! The archive decoder seam.
//!
//! The coordinator never parses archives itself. It asks an [`OpenArchive`] implementation to
//! turn the bridge's byte stream into an [`ArchiveDecoder`], then walks the entries with an
//! [`EntryCursor`]. Each step of the cursor produces a [`HeaderStatus`]: an entry, the end of the
//! archive, or one of three failure classes that the coordinator treats differently.
//!
//! An [`ArchiveEntry`] borrows the cursor, so it cannot outlive the next call to
//! [`EntryCursor::next_entry`].
//!
//! [`AutoDecoder`] is the default implementation. It recognises the compression filter and the
//! archive format from the content of the stream.

use std::io::{self, BufReader, Read};

use crate::extractor::MAX_CHUNK_SIZE;
use crate::format::{self, ArchiveFormat, Compression};

mod tar;
mod zip;

pub use self::tar::TarDecoder;
pub use self::zip::ZipDecoder;

/// Errors that can occur while opening an archive stream.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The stream is not in any supported format
    #[error("unrecognized archive format")]
    Unrecognized,

    /// Reading or decompressing the leading bytes failed
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The type of an archive entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// A regular file
    File,
    /// A directory
    Directory,
    /// A symbolic link, the target is in [`EntryDescriptor::link_target`]
    Symlink,
    /// A hard link to an entry that appeared earlier in the archive
    HardLink,
    /// Anything else (devices, FIFOs, ...), described by name
    Other(&'static str),
}

/// A run of data inside a sparse file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SparseRegion {
    /// Offset of the data in the file
    pub offset: u64,
    /// Number of data bytes at that offset
    pub length: u64,
}

/// The metadata of one archive entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryDescriptor {
    /// Path of the entry as stored in the archive. Empty if the decoder could not read it.
    pub path: String,
    /// What kind of filesystem object the entry describes
    pub kind: EntryKind,
    /// Size of the entry's data in bytes
    pub size: u64,
    /// Unix permission bits, if the archive records them
    pub mode: Option<u32>,
    /// Modification time in seconds since the unix epoch, if the archive records it
    pub mtime: Option<u64>,
    /// Target of a symbolic or hard link
    pub link_target: Option<String>,
    /// Data regions of a sparse file, empty for regular files
    pub sparse_regions: Vec<SparseRegion>,
}

impl EntryDescriptor {
    /// Describes a regular file
    pub fn file(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::File,
            size,
            mode: None,
            mtime: None,
            link_target: None,
            sparse_regions: Vec::new(),
        }
    }

    /// Describes a directory
    pub fn directory(path: impl Into<String>) -> Self {
        Self {
            kind: EntryKind::Directory,
            ..Self::file(path, 0)
        }
    }

    /// Describes a symbolic link
    pub fn symlink(path: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind: EntryKind::Symlink,
            link_target: Some(target.into()),
            ..Self::file(path, 0)
        }
    }

    /// Describes a hard link to an earlier entry
    pub fn hard_link(path: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind: EntryKind::HardLink,
            link_target: Some(target.into()),
            ..Self::file(path, 0)
        }
    }

    /// Sets the permission bits
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Sets the modification time
    pub fn with_mtime(mut self, mtime: u64) -> Self {
        self.mtime = Some(mtime);
        self
    }
}

/// One entry of an archive: its descriptor plus a reader over its data.
pub trait ArchiveEntry: Read {
    /// The entry's metadata
    fn descriptor(&self) -> &EntryDescriptor;

    /// Discards the entry's data without materializing it
    fn skip_data(&mut self) -> io::Result<()> {
        io::copy(self, &mut io::sink()).map(|_| ())
    }
}

/// The result of advancing to the next archive header.
pub enum HeaderStatus<'a> {
    /// The next entry
    Entry(Box<dyn ArchiveEntry + 'a>),
    /// The archive has no more entries
    Eof,
    /// The header could not be used but decoding can continue with the next one
    Warning(String),
    /// A transient failure, advancing again may succeed
    Retry(String),
    /// Decoding cannot continue
    Fatal(String),
}

impl std::fmt::Debug for HeaderStatus<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Entry(entry) => f.debug_tuple("Entry").field(&entry.descriptor().path).finish(),
            Self::Eof => f.write_str("Eof"),
            Self::Warning(msg) => f.debug_tuple("Warning").field(msg).finish(),
            Self::Retry(msg) => f.debug_tuple("Retry").field(msg).finish(),
            Self::Fatal(msg) => f.debug_tuple("Fatal").field(msg).finish(),
        }
    }
}

/// Walks the entries of an open archive in order.
pub trait EntryCursor {
    /// Advances to the next header
    fn next_entry(&mut self) -> HeaderStatus<'_>;
}

/// An opened archive.
pub trait ArchiveDecoder {
    /// The detected container format
    fn format(&self) -> ArchiveFormat;

    /// The detected compression filter
    fn compression(&self) -> Compression {
        Compression::None
    }

    /// Starts walking the entries. Can only be called once per decoder.
    fn entries(&mut self) -> io::Result<Box<dyn EntryCursor + '_>>;
}

/// Opens an archive stream.
pub trait OpenArchive: Send + Sync {
    /// Opens `input`, reading it in pieces of `chunk_size` bytes.
    fn open(
        &self,
        input: Box<dyn Read + Send>,
        chunk_size: usize,
    ) -> Result<Box<dyn ArchiveDecoder>, DecodeError>;
}

/// Opens any supported archive, detecting filter and format from the content.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoDecoder;

impl OpenArchive for AutoDecoder {
    fn open(
        &self,
        input: Box<dyn Read + Send>,
        chunk_size: usize,
    ) -> Result<Box<dyn ArchiveDecoder>, DecodeError> {
        let input = BufReader::with_capacity(chunk_size.clamp(1, MAX_CHUNK_SIZE), input);
        let (magic, input) = format::peek(input, format::COMPRESSION_MAGIC_LEN)?;
        let compression = Compression::detect(&magic);

        let decompressed: Box<dyn Read + Send> = match compression {
            Compression::None => Box::new(input),
            Compression::Gzip => Box::new(flate2::read::MultiGzDecoder::new(input)),
            Compression::Bzip2 => Box::new(bzip2::read::MultiBzDecoder::new(input)),
            Compression::Xz => Box::new(xz2::read::XzDecoder::new_multi_decoder(input)),
            Compression::Zstd => Box::new(zstd::stream::read::Decoder::new(input)?),
        };

        let (header, stream) = format::peek(decompressed, format::FORMAT_MAGIC_LEN)?;
        let format = ArchiveFormat::detect(&header).ok_or(DecodeError::Unrecognized)?;
        tracing::debug!(
            "detected {} archive ({} compression)",
            format.name(),
            compression.name()
        );

        let stream: Box<dyn Read + Send> = Box::new(stream);
        Ok(match format {
            ArchiveFormat::Tar => Box::new(TarDecoder::new(stream, compression)),
            ArchiveFormat::Zip => Box::new(ZipDecoder::new(stream, compression)),
            ArchiveFormat::Empty => Box::new(EmptyDecoder { compression }),
        })
    }
}

/// A stream without any bytes.
struct EmptyDecoder {
    compression: Compression,
}

struct EmptyCursor;

impl EntryCursor for EmptyCursor {
    fn next_entry(&mut self) -> HeaderStatus<'_> {
        HeaderStatus::Eof
    }
}

impl ArchiveDecoder for EmptyDecoder {
    fn format(&self) -> ArchiveFormat {
        ArchiveFormat::Empty
    }

    fn compression(&self) -> Compression {
        self.compression
    }

    fn entries(&mut self) -> io::Result<Box<dyn EntryCursor + '_>> {
        Ok(Box::new(EmptyCursor))
    }
}

/// Describes this library and the archive formats and filters it can decode.
pub fn version_details() -> String {
    let formats = ArchiveFormat::ALL
        .iter()
        .filter(|f| **f != ArchiveFormat::Empty)
        .map(ArchiveFormat::name)
        .collect::<Vec<_>>()
        .join(", ");
    let filters = Compression::ALL
        .iter()
        .map(Compression::name)
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "rattler_extract {} (formats: {formats}; filters: {filters})",
        env!("CARGO_PKG_VERSION")
    )
}
