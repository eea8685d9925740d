//! Sequential decoding of tar archives.

use std::io::{self, Read};

use tar::EntryType;

use super::{
    ArchiveDecoder, ArchiveEntry, EntryCursor, EntryDescriptor, EntryKind, HeaderStatus,
    SparseRegion,
};
use crate::format::{ArchiveFormat, Compression};

/// Decodes a (decompressed) tar stream.
pub struct TarDecoder {
    archive: tar::Archive<Box<dyn Read + Send>>,
    compression: Compression,
}

impl TarDecoder {
    /// Wraps an uncompressed tar stream. `compression` records the filter that was removed.
    pub fn new(reader: Box<dyn Read + Send>, compression: Compression) -> Self {
        Self {
            archive: tar::Archive::new(reader),
            compression,
        }
    }
}

impl ArchiveDecoder for TarDecoder {
    fn format(&self) -> ArchiveFormat {
        ArchiveFormat::Tar
    }

    fn compression(&self) -> Compression {
        self.compression
    }

    fn entries(&mut self) -> io::Result<Box<dyn EntryCursor + '_>> {
        Ok(Box::new(TarCursor {
            entries: self.archive.entries()?,
        }))
    }
}

struct TarCursor<'a> {
    entries: tar::Entries<'a, Box<dyn Read + Send>>,
}

impl EntryCursor for TarCursor<'_> {
    fn next_entry(&mut self) -> HeaderStatus<'_> {
        loop {
            return match self.entries.next() {
                None => HeaderStatus::Eof,
                // The tar reader stops for good after an error, so every error is fatal.
                Some(Err(err)) => HeaderStatus::Fatal(err.to_string()),
                Some(Ok(entry)) => {
                    if entry.header().entry_type() == EntryType::XGlobalHeader {
                        continue;
                    }
                    let descriptor = describe(&entry);
                    HeaderStatus::Entry(Box::new(TarEntry { entry, descriptor }))
                }
            };
        }
    }
}

struct TarEntry<'a> {
    entry: tar::Entry<'a, Box<dyn Read + Send>>,
    descriptor: EntryDescriptor,
}

impl Read for TarEntry<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.entry.read(buf)
    }
}

impl ArchiveEntry for TarEntry<'_> {
    fn descriptor(&self) -> &EntryDescriptor {
        &self.descriptor
    }
}

fn describe(entry: &tar::Entry<'_, Box<dyn Read + Send>>) -> EntryDescriptor {
    let header = entry.header();
    let entry_type = header.entry_type();

    // Names that are not valid UTF-8 are reported as unreadable.
    let path = entry
        .path()
        .ok()
        .and_then(|p| p.to_str().map(str::to_owned))
        .unwrap_or_default();
    let link_target = entry
        .link_name()
        .ok()
        .flatten()
        .and_then(|p| p.to_str().map(str::to_owned));

    let kind = match entry_type {
        EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse => EntryKind::File,
        EntryType::Directory => EntryKind::Directory,
        EntryType::Symlink => EntryKind::Symlink,
        EntryType::Link => EntryKind::HardLink,
        EntryType::Char => EntryKind::Other("character device"),
        EntryType::Block => EntryKind::Other("block device"),
        EntryType::Fifo => EntryKind::Other("fifo"),
        _ => EntryKind::Other("unsupported tar entry"),
    };

    let sparse_regions = if entry_type.is_gnu_sparse() {
        header
            .as_gnu()
            .map(|gnu| {
                gnu.sparse
                    .iter()
                    .filter(|s| !s.is_empty())
                    .filter_map(|s| {
                        Some(SparseRegion {
                            offset: s.offset().ok()?,
                            length: s.length().ok()?,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    } else {
        Vec::new()
    };

    EntryDescriptor {
        path,
        kind,
        size: entry.size(),
        mode: header.mode().ok(),
        mtime: header.mtime().ok(),
        link_target,
        sparse_regions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder(bytes: Vec<u8>) -> TarDecoder {
        TarDecoder::new(Box::new(io::Cursor::new(bytes)), Compression::None)
    }

    #[test]
    fn test_describes_entry_kinds() {
        let mut builder = tar::Builder::new(Vec::new());

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(EntryType::Directory);
        header.set_path("dir/").unwrap();
        header.set_size(0);
        header.set_mode(0o755);
        header.set_mtime(1_600_000_000);
        header.set_cksum();
        builder.append(&header, io::empty()).unwrap();

        let mut header = tar::Header::new_gnu();
        header.set_path("dir/file.txt").unwrap();
        header.set_size(3);
        header.set_mode(0o640);
        header.set_cksum();
        builder.append(&header, &b"abc"[..]).unwrap();

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(EntryType::Symlink);
        header.set_size(0);
        builder
            .append_link(&mut header, "dir/link", "file.txt")
            .unwrap();

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(EntryType::Fifo);
        header.set_path("dir/pipe").unwrap();
        header.set_size(0);
        header.set_cksum();
        builder.append(&header, io::empty()).unwrap();

        let mut decoder = decoder(builder.into_inner().unwrap());
        let mut cursor = decoder.entries().unwrap();
        let mut seen = Vec::new();
        loop {
            match cursor.next_entry() {
                HeaderStatus::Entry(entry) => seen.push(entry.descriptor().clone()),
                HeaderStatus::Eof => break,
                other => panic!("unexpected status {other:?}"),
            }
        }

        assert_eq!(seen.len(), 4);
        assert_eq!(seen[0].kind, EntryKind::Directory);
        assert_eq!(seen[0].path, "dir/");
        assert_eq!(seen[0].mtime, Some(1_600_000_000));
        assert_eq!(seen[1].kind, EntryKind::File);
        assert_eq!(seen[1].size, 3);
        assert_eq!(seen[1].mode, Some(0o640));
        assert_eq!(seen[2].kind, EntryKind::Symlink);
        assert_eq!(seen[2].link_target.as_deref(), Some("file.txt"));
        assert_eq!(seen[3].kind, EntryKind::Other("fifo"));
    }

    #[test]
    fn test_skipping_data_keeps_position() {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, content) in [("one", &b"11111"[..]), ("two", &b"22"[..])] {
            let mut header = tar::Header::new_gnu();
            header.set_path(name).unwrap();
            header.set_size(content.len() as u64);
            header.set_cksum();
            builder.append(&header, content).unwrap();
        }

        let mut decoder = decoder(builder.into_inner().unwrap());
        let mut cursor = decoder.entries().unwrap();

        match cursor.next_entry() {
            HeaderStatus::Entry(mut entry) => entry.skip_data().unwrap(),
            other => panic!("unexpected status {other:?}"),
        }
        match cursor.next_entry() {
            HeaderStatus::Entry(mut entry) => {
                let mut data = String::new();
                entry.read_to_string(&mut data).unwrap();
                assert_eq!(entry.descriptor().path, "two");
                assert_eq!(data, "22");
            }
            other => panic!("unexpected status {other:?}"),
        }
        assert!(matches!(cursor.next_entry(), HeaderStatus::Eof));
    }

    #[test]
    fn test_truncated_archive_is_fatal() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_path("big.bin").unwrap();
        header.set_size(4096);
        header.set_cksum();
        builder.append(&header, &[7u8; 4096][..]).unwrap();
        let mut bytes = builder.into_inner().unwrap();
        bytes.truncate(1024);

        let mut decoder = decoder(bytes);
        let mut cursor = decoder.entries().unwrap();
        match cursor.next_entry() {
            HeaderStatus::Entry(mut entry) => {
                // The data reader simply runs dry, the header walk notices the truncation.
                let _ = entry.skip_data();
            }
            other => panic!("unexpected status {other:?}"),
        }
        assert!(matches!(cursor.next_entry(), HeaderStatus::Fatal(_)));
    }
}
