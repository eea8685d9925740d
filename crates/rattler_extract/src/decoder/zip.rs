//! Sequential decoding of ZIP archives.
//!
//! The stream cannot seek, so the central directory is never consulted. Entries are read through
//! their local headers in the order they appear.

use std::io::{self, Read};

use zip::read::{read_zipfile_from_stream, ZipFile};

use super::{ArchiveDecoder, ArchiveEntry, EntryCursor, EntryDescriptor, EntryKind, HeaderStatus};
use crate::format::{ArchiveFormat, Compression};

type StreamFile<'a> = ZipFile<'a, Box<dyn Read + Send>>;

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// Decodes a ZIP stream through its local file headers.
pub struct ZipDecoder {
    reader: Box<dyn Read + Send>,
    compression: Compression,
}

impl ZipDecoder {
    /// Wraps a ZIP stream. `compression` records an outer filter that was removed.
    pub fn new(reader: Box<dyn Read + Send>, compression: Compression) -> Self {
        Self {
            reader,
            compression,
        }
    }
}

impl ArchiveDecoder for ZipDecoder {
    fn format(&self) -> ArchiveFormat {
        ArchiveFormat::Zip
    }

    fn compression(&self) -> Compression {
        self.compression
    }

    fn entries(&mut self) -> io::Result<Box<dyn EntryCursor + '_>> {
        Ok(Box::new(ZipCursor {
            reader: &mut self.reader,
            done: false,
        }))
    }
}

struct ZipCursor<'a> {
    reader: &'a mut Box<dyn Read + Send>,
    done: bool,
}

impl EntryCursor for ZipCursor<'_> {
    fn next_entry(&mut self) -> HeaderStatus<'_> {
        if self.done {
            return HeaderStatus::Eof;
        }
        match read_zipfile_from_stream(&mut *self.reader) {
            Ok(Some(file)) => {
                let name = file.name().to_string();
                match ZipEntry::new(file) {
                    Ok(entry) => HeaderStatus::Entry(Box::new(entry)),
                    // A stream that is really broken fails the next header read.
                    Err(err) => HeaderStatus::Warning(format!("{name}: cannot read link target: {err}")),
                }
            }
            Ok(None) => {
                self.done = true;
                HeaderStatus::Eof
            }
            Err(err) => {
                self.done = true;
                HeaderStatus::Fatal(err.to_string())
            }
        }
    }
}

struct ZipEntry<'a> {
    file: StreamFile<'a>,
    descriptor: EntryDescriptor,
}

impl<'a> ZipEntry<'a> {
    fn new(mut file: StreamFile<'a>) -> io::Result<Self> {
        let mode = file.unix_mode();
        let path = file.name().to_string();

        let (kind, link_target) = if file.is_dir() {
            (EntryKind::Directory, None)
        } else if mode.is_some_and(|m| m & S_IFMT == S_IFLNK) {
            // Symlinks store their target as the entry data.
            let mut target = String::new();
            file.read_to_string(&mut target)?;
            (EntryKind::Symlink, Some(target))
        } else {
            (EntryKind::File, None)
        };

        let descriptor = EntryDescriptor {
            path,
            kind,
            size: if kind == EntryKind::File { file.size() } else { 0 },
            mode: mode.map(|m| m & 0o7777),
            mtime: None,
            link_target,
            sparse_regions: Vec::new(),
        };
        Ok(Self { file, descriptor })
    }
}

impl Read for ZipEntry<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl ArchiveEntry for ZipEntry<'_> {
    fn descriptor(&self) -> &EntryDescriptor {
        &self.descriptor
    }
}
