//! Archive format and compression detection from content.
//!
//! Nothing here looks at file names: the archive may come from standard input or an arbitrary
//! stream, so both the compression filter and the container format are recognised by their
//! leading bytes.

use std::io::{self, Cursor, Read};

/// Number of leading bytes needed to recognise any supported compression filter
pub const COMPRESSION_MAGIC_LEN: usize = 6;

/// Number of leading bytes needed to recognise any supported archive format
pub const FORMAT_MAGIC_LEN: usize = 512;

/// Compression filters that are recognised and removed before the archive is decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Compression {
    /// No compression
    None,
    /// gzip (`1f 8b`)
    Gzip,
    /// bzip2 (`BZh`)
    Bzip2,
    /// xz (`fd 37 7a 58 5a 00`)
    Xz,
    /// Zstandard (`28 b5 2f fd`)
    Zstd,
}

impl Compression {
    /// All filters, in detection order
    pub const ALL: [Compression; 4] = [Self::Gzip, Self::Bzip2, Self::Xz, Self::Zstd];

    /// Detects the compression filter from the first bytes of a stream
    pub fn detect(magic: &[u8]) -> Self {
        if magic.starts_with(&[0x1f, 0x8b]) {
            Self::Gzip
        } else if magic.starts_with(b"BZh") {
            Self::Bzip2
        } else if magic.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
            Self::Xz
        } else if magic.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
            Self::Zstd
        } else {
            Self::None
        }
    }

    /// Get a human-readable name for this filter
    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Bzip2 => "bzip2",
            Self::Xz => "xz",
            Self::Zstd => "zstd",
        }
    }
}

/// Supported archive formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchiveFormat {
    /// tar in any of its dialects (v7, ustar, GNU, pax)
    Tar,
    /// ZIP, read sequentially through its local headers
    Zip,
    /// A stream without any bytes, treated as an archive without entries
    Empty,
}

impl ArchiveFormat {
    /// All formats, in detection order
    pub const ALL: [ArchiveFormat; 3] = [Self::Zip, Self::Tar, Self::Empty];

    /// Detects the archive format from the first (decompressed) bytes of a stream.
    pub fn detect(header: &[u8]) -> Option<Self> {
        if header.is_empty() {
            return Some(Self::Empty);
        }
        if header.starts_with(b"PK\x03\x04") || header.starts_with(b"PK\x05\x06") {
            return Some(Self::Zip);
        }
        if is_tar_header(header) {
            return Some(Self::Tar);
        }
        None
    }

    /// Get a human-readable name for this format
    pub fn name(&self) -> &'static str {
        match self {
            Self::Tar => "tar",
            Self::Zip => "zip",
            Self::Empty => "empty",
        }
    }
}

fn is_tar_header(header: &[u8]) -> bool {
    if header.len() >= 262 && &header[257..262] == b"ustar" {
        return true;
    }
    if header.len() < 512 {
        return false;
    }
    let block = &header[..512];

    // An end-of-archive block, an archive without entries
    if block.iter().all(|&b| b == 0) {
        return true;
    }

    // Pre-POSIX archives only have the header checksum to go by
    let Some(expected) = parse_octal(&block[148..156]) else {
        return false;
    };
    let actual: u64 = block
        .iter()
        .enumerate()
        .map(|(idx, &b)| if (148..156).contains(&idx) { u64::from(b' ') } else { u64::from(b) })
        .sum();
    expected == actual
}

fn parse_octal(field: &[u8]) -> Option<u64> {
    let digits = field
        .iter()
        .skip_while(|&&b| b == b' ')
        .take_while(|&&b| (b'0'..=b'7').contains(&b));
    let mut value = None;
    for &digit in digits {
        value = Some(value.unwrap_or(0u64) * 8 + u64::from(digit - b'0'));
    }
    value
}

/// Reads up to `len` bytes from the front of `reader` without losing them.
///
/// Returns the bytes that were read together with a reader that yields the complete stream
/// again. Fewer than `len` bytes are returned only if the stream ends first.
pub fn peek<R: Read>(mut reader: R, len: usize) -> io::Result<(Vec<u8>, io::Chain<Cursor<Vec<u8>>, R>)> {
    let mut buf = Vec::with_capacity(len);
    (&mut reader).take(len as u64).read_to_end(&mut buf)?;
    let head = buf.clone();
    Ok((head, Cursor::new(buf).chain(reader)))
}
