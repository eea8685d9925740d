//! Error types for the rattler_extract crate

use std::path::PathBuf;

use crate::decoder::DecodeError;

/// Result type for extraction operations
pub type Result<T> = std::result::Result<T, ExtractError>;

/// Broad class of an [`ExtractError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The job configuration is unusable. Detected before any I/O.
    Config,
    /// An I/O operation needed by the run itself failed.
    Io,
    /// The decoder could not open or continue reading the archive.
    DecodeFatal,
    /// The sink could not write an entry for an unrecoverable reason.
    ExtractFatal,
    /// The run was asked to stop.
    Cancelled,
    /// The original working directory could not be restored.
    RestoreDirectory,
}

/// Error type for extraction operations
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    /// An inclusion pattern is not a valid glob
    #[error("invalid pattern '{pattern}': {reason}")]
    Pattern { pattern: String, reason: String },

    /// The configured read chunk size is zero or too large
    #[error("invalid read chunk size {0}, expected 1 to {max} bytes", max = crate::extractor::MAX_CHUNK_SIZE)]
    InvalidChunkSize(usize),

    /// The archive file could not be opened
    #[error("failed to open archive: {source}")]
    OpenSource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Reading from the archive source failed while it was being streamed
    #[error("failed to read archive source: {0}")]
    ReadSource(#[source] std::io::Error),

    /// The pipe between the source and the decoder could not be created
    #[error("failed to create pipe: {0}")]
    CreatePipe(#[source] std::io::Error),

    /// The thread streaming the archive source could not be started
    #[error("failed to start streaming the archive: {0}")]
    StartCopy(#[source] std::io::Error),

    /// The current working directory could not be determined
    #[error("could not get current working directory: {0}")]
    CurrentDir(#[source] std::io::Error),

    /// The requested working directory change failed
    #[error("could not chdir to '{}': {source}", path.display())]
    ChangeDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The sink failed to flush deferred work when it was closed
    #[error("failed to finish writing entries: {0}")]
    FinishSink(#[source] std::io::Error),

    /// The decoder could not open the archive stream
    #[error("error opening archive: {0}")]
    DecodeOpen(#[source] DecodeError),

    /// The decoder hit an unrecoverable error while reading headers
    #[error("error reading archive: {message}")]
    DecodeFatal { message: String },

    /// An entry could not be written and the run cannot continue
    #[error("extract {path}: {message}")]
    ExtractFatal { path: String, message: String },

    /// The run was cancelled
    #[error("extraction was cancelled")]
    Cancelled,

    /// The original working directory could not be restored
    #[error("failed to restore original working directory '{}': {source}", path.display())]
    RestoreDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ExtractError {
    /// Create a new pattern error
    pub fn pattern(pattern: impl Into<String>, reason: impl ToString) -> Self {
        Self::Pattern {
            pattern: pattern.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a new fatal decode error
    pub fn decode_fatal(message: impl Into<String>) -> Self {
        Self::DecodeFatal {
            message: message.into(),
        }
    }

    /// Create a new fatal extraction error for the entry at `path`
    pub fn extract_fatal(path: impl Into<String>, message: impl ToString) -> Self {
        Self::ExtractFatal {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Returns the class this error belongs to
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Pattern { .. } | Self::InvalidChunkSize(_) => ErrorKind::Config,
            Self::OpenSource { .. }
            | Self::ReadSource(_)
            | Self::CreatePipe(_)
            | Self::StartCopy(_)
            | Self::CurrentDir(_)
            | Self::ChangeDirectory { .. }
            | Self::FinishSink(_) => ErrorKind::Io,
            Self::DecodeOpen(_) | Self::DecodeFatal { .. } => ErrorKind::DecodeFatal,
            Self::ExtractFatal { .. } => ErrorKind::ExtractFatal,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::RestoreDirectory { .. } => ErrorKind::RestoreDirectory,
        }
    }

    /// Returns true if this error reports a cancelled run
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            ExtractError::pattern("[", "unclosed").kind(),
            ErrorKind::Config
        );
        assert_eq!(ExtractError::decode_fatal("bad").kind(), ErrorKind::DecodeFatal);
        assert_eq!(
            ExtractError::extract_fatal("a.txt", "disk full").kind(),
            ErrorKind::ExtractFatal
        );
        assert_eq!(ExtractError::Cancelled.kind(), ErrorKind::Cancelled);
        assert!(ExtractError::Cancelled.is_cancelled());
    }

    #[test]
    fn test_messages_name_the_culprit() {
        let err = ExtractError::extract_fatal("dir/file.bin", "No space left on device");
        assert_eq!(err.to_string(), "extract dir/file.bin: No space left on device");

        let err = ExtractError::pattern("a[", "unclosed bracket");
        assert!(err.to_string().contains("'a['"));
    }
}
