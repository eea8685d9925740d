//! Resolution of the archive byte source.

use std::fmt;
use std::io::Read;
use std::path::PathBuf;

use crate::error::{ExtractError, Result};

/// Where the archive bytes come from.
#[derive(Default)]
pub enum ArchiveSource {
    /// Read the archive from standard input
    #[default]
    Stdin,
    /// Read the archive from a file on disk
    File(PathBuf),
    /// Read the archive from a caller supplied stream
    Stream(Box<dyn Read + Send>),
}

impl fmt::Debug for ArchiveSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdin => f.write_str("Stdin"),
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// An opened source, ready to be streamed into the decoder.
pub struct OpenedSource {
    /// The byte stream
    pub reader: Box<dyn Read + Send>,
    /// The number of bytes the stream will yield, if known
    pub len: Option<u64>,
}

impl ArchiveSource {
    /// Interprets a user supplied archive path. An empty path or `-` means standard input.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if path.as_os_str().is_empty() || path.as_os_str() == "-" {
            Self::Stdin
        } else {
            Self::File(path)
        }
    }

    /// Returns a short human readable description of the source
    pub fn describe(&self) -> String {
        match self {
            Self::Stdin => "<stdin>".to_string(),
            Self::File(path) => path.display().to_string(),
            Self::Stream(_) => "<stream>".to_string(),
        }
    }

    /// Opens the source. The bytes are passed through untouched.
    pub fn open(self) -> Result<OpenedSource> {
        match self {
            Self::Stream(reader) => Ok(OpenedSource { reader, len: None }),
            Self::Stdin => Ok(OpenedSource {
                reader: Box::new(std::io::stdin()),
                len: None,
            }),
            Self::File(path) => {
                let file = fs_err::File::open(&path).map_err(|source| {
                    ExtractError::OpenSource {
                        path: path.clone(),
                        source,
                    }
                })?;
                let len = file
                    .metadata()
                    .ok()
                    .filter(std::fs::Metadata::is_file)
                    .map(|m| m.len());
                Ok(OpenedSource {
                    reader: Box::new(file),
                    len,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_dash_and_empty_mean_stdin() {
        assert!(matches!(ArchiveSource::from_path("-"), ArchiveSource::Stdin));
        assert!(matches!(ArchiveSource::from_path(""), ArchiveSource::Stdin));
        assert!(matches!(
            ArchiveSource::from_path("archive.tar"),
            ArchiveSource::File(_)
        ));
    }

    #[test]
    fn test_stream_is_passed_through() {
        let source = ArchiveSource::Stream(Box::new(&b"abc"[..]));
        let mut opened = source.open().unwrap();
        let mut buf = String::new();
        opened.reader.read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "abc");
        assert_eq!(opened.len, None);
    }

    #[test]
    fn test_file_length_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        fs_err::write(&path, [0u8; 42]).unwrap();

        let opened = ArchiveSource::File(path).open().unwrap();
        assert_eq!(opened.len, Some(42));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.tar");

        let err = ArchiveSource::File(path.clone()).open().err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Io);
        match err {
            ExtractError::OpenSource { path: p, source } => {
                assert_eq!(p, path);
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
