//! Writing archive entries to disk.
//!
//! The coordinator hands every included entry to an [`ExtractionSink`]. [`DiskWriter`] is the
//! default sink: it materializes entries relative to the current working directory under the
//! security policy described by [`WriteOptions`].

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use filetime::FileTime;

use crate::decoder::{EntryDescriptor, EntryKind};

/// Size of the buffer entry data is copied through
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Granularity at which runs of zeros are turned into holes
const SPARSE_BLOCK_SIZE: usize = 4 * 1024;

/// How serious a sink failure is for the rest of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Only this entry is affected, the run continues
    Warning,
    /// The run cannot continue
    Fatal,
}

/// Errors produced while writing a single entry.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The entry path is absolute
    #[error("refusing to extract absolute path")]
    AbsolutePath,

    /// The entry path climbs out of the extraction directory
    #[error("path contains '..'")]
    ParentTraversal,

    /// The entry path resolves to nothing
    #[error("path is empty after normalization")]
    EmptyPath,

    /// An existing component of the destination is a symlink
    #[error("cannot extract through symlink '{}'", .0.display())]
    SymlinkInPath(PathBuf),

    /// A link target points outside the extraction directory
    #[error("link target '{0}' escapes the extraction directory")]
    LinkEscape(String),

    /// A link entry does not name its target
    #[error("link entry has no target")]
    MissingLinkTarget,

    /// The entry is of a kind that is not materialized
    #[error("cannot extract {0}")]
    Unsupported(&'static str),

    /// The entry's data could not be read from the archive, or ended before its recorded size
    #[error("failed to read entry data: {0}")]
    ReadData(#[source] io::Error),

    /// A filesystem operation failed
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl SinkError {
    /// Classifies the failure.
    ///
    /// Unreadable entry data only affects that entry. If the archive stream itself is broken the
    /// decoder reports it at the next header.
    pub fn severity(&self) -> Severity {
        match self {
            Self::Io(err) if is_fatal_io(err) => Severity::Fatal,
            _ => Severity::Warning,
        }
    }
}

fn is_fatal_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::StorageFull
            | io::ErrorKind::PermissionDenied
            | io::ErrorKind::ReadOnlyFilesystem
    )
}

/// Materializes archive entries.
pub trait ExtractionSink {
    /// Writes one entry. `data` yields the entry's content.
    fn extract(&mut self, entry: &EntryDescriptor, data: &mut dyn Read) -> Result<(), SinkError>;

    /// Completes deferred work once all entries have been written.
    fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The write policy of a [`DiskWriter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    /// Apply the modification times recorded in the archive
    pub restore_times: bool,
    /// Refuse to write through symlinks and to create links that leave the extraction directory
    pub secure_symlinks: bool,
    /// Refuse entries with `..` components
    pub reject_dot_dot: bool,
    /// Refuse absolute entry paths. When off the leading root is stripped.
    pub reject_absolute: bool,
    /// Remove an existing file before writing the entry
    pub unlink_before_write: bool,
    /// Turn runs of zeros into holes
    pub sparse: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            restore_times: true,
            secure_symlinks: true,
            reject_dot_dot: true,
            reject_absolute: true,
            unlink_before_write: true,
            sparse: false,
        }
    }
}

impl WriteOptions {
    /// Enables or disables sparse writes
    pub fn with_sparse(mut self, sparse: bool) -> Self {
        self.sparse = sparse;
        self
    }
}

struct DeferredDirectory {
    path: PathBuf,
    mode: Option<u32>,
    mtime: Option<FileTime>,
}

/// Writes entries below the current working directory.
pub struct DiskWriter {
    options: WriteOptions,
    deferred: Vec<DeferredDirectory>,
}

impl Default for DiskWriter {
    fn default() -> Self {
        Self::new(WriteOptions::default())
    }
}

impl DiskWriter {
    /// Creates a writer with the given policy
    pub fn new(options: WriteOptions) -> Self {
        Self {
            options,
            deferred: Vec::new(),
        }
    }

    /// The policy of this writer
    pub fn options(&self) -> &WriteOptions {
        &self.options
    }

    /// Turns an archive path into a relative destination path.
    fn destination(&self, raw: &str) -> Result<PathBuf, SinkError> {
        let mut result = PathBuf::with_capacity(raw.len());
        for component in Path::new(raw).components() {
            match component {
                Component::Prefix(..) | Component::RootDir => {
                    if self.options.reject_absolute {
                        return Err(SinkError::AbsolutePath);
                    }
                }
                Component::CurDir => {}
                Component::ParentDir => {
                    if self.options.reject_dot_dot {
                        return Err(SinkError::ParentTraversal);
                    }
                    result.push("..");
                }
                Component::Normal(part) => result.push(part),
            }
        }
        Ok(result)
    }

    /// Fails if any existing ancestor of `dest` is a symlink.
    fn check_parents(&self, dest: &Path) -> Result<(), SinkError> {
        if !self.options.secure_symlinks {
            return Ok(());
        }
        let mut current = PathBuf::new();
        let mut components = dest.components().peekable();
        while let Some(component) = components.next() {
            if components.peek().is_none() {
                break;
            }
            current.push(component);
            match std::fs::symlink_metadata(&current) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    return Err(SinkError::SymlinkInPath(current));
                }
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => break,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn clear_destination(&self, dest: &Path, kind: EntryKind) -> io::Result<()> {
        if !self.options.unlink_before_write {
            return Ok(());
        }
        match std::fs::symlink_metadata(dest) {
            Ok(meta) if meta.is_dir() => {
                if kind == EntryKind::Directory {
                    Ok(())
                } else {
                    fs_err::remove_dir(dest)
                }
            }
            Ok(_) => fs_err::remove_file(dest),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn write_file(
        &self,
        dest: &Path,
        entry: &EntryDescriptor,
        data: &mut dyn Read,
    ) -> Result<(), SinkError> {
        let mut file = fs_err::File::create(dest)?;
        let copied = copy_data(data, &mut file, self.options.sparse).and_then(|written| {
            if written < entry.size {
                return Err(SinkError::ReadData(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("entry data ended after {written} of {} bytes", entry.size),
                )));
            }
            Ok(())
        });
        drop(file);
        if let Err(err) = copied {
            // Partial content is not left behind.
            if let Err(remove_err) = fs_err::remove_file(dest) {
                tracing::debug!("{remove_err}");
            }
            return Err(err);
        }

        if let Some(mode) = entry.mode {
            set_mode(dest, mode)?;
        }
        if let Some(mtime) = self.mtime(entry) {
            filetime::set_file_mtime(dest, mtime)?;
        }
        Ok(())
    }

    fn write_symlink(&self, dest: &Path, entry: &EntryDescriptor) -> Result<(), SinkError> {
        let target = entry
            .link_target
            .as_deref()
            .ok_or(SinkError::MissingLinkTarget)?;
        if self.options.secure_symlinks {
            validate_symlink_target(dest, Path::new(target))
                .map_err(|_| SinkError::LinkEscape(target.to_string()))?;
        }
        create_symlink(Path::new(target), dest)?;
        if let Some(mtime) = self.mtime(entry) {
            filetime::set_symlink_file_times(dest, mtime, mtime)?;
        }
        Ok(())
    }

    fn write_hard_link(&self, dest: &Path, entry: &EntryDescriptor) -> Result<(), SinkError> {
        let raw_target = entry
            .link_target
            .as_deref()
            .ok_or(SinkError::MissingLinkTarget)?;
        let target = self
            .destination(raw_target)
            .map_err(|_| SinkError::LinkEscape(raw_target.to_string()))?;
        if target.as_os_str().is_empty() {
            return Err(SinkError::MissingLinkTarget);
        }
        self.check_parents(&target)?;
        fs_err::hard_link(&target, dest)?;
        Ok(())
    }

    fn mtime(&self, entry: &EntryDescriptor) -> Option<FileTime> {
        if !self.options.restore_times {
            return None;
        }
        entry
            .mtime
            .map(|mtime| FileTime::from_unix_time(mtime as i64, 0))
    }
}

impl ExtractionSink for DiskWriter {
    fn extract(&mut self, entry: &EntryDescriptor, data: &mut dyn Read) -> Result<(), SinkError> {
        let dest = self.destination(&entry.path)?;
        if dest.as_os_str().is_empty() {
            // `./` style entries name the extraction directory itself.
            return if entry.kind == EntryKind::Directory {
                Ok(())
            } else {
                Err(SinkError::EmptyPath)
            };
        }
        if let EntryKind::Other(kind) = entry.kind {
            return Err(SinkError::Unsupported(kind));
        }

        self.check_parents(&dest)?;
        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs_err::create_dir_all(parent)?;
        }
        self.clear_destination(&dest, entry.kind)?;

        match entry.kind {
            EntryKind::Directory => {
                fs_err::create_dir_all(&dest)?;
                let mtime = self.mtime(entry);
                self.deferred.push(DeferredDirectory {
                    path: dest,
                    mode: entry.mode,
                    mtime,
                });
                Ok(())
            }
            EntryKind::File => self.write_file(&dest, entry, data),
            EntryKind::Symlink => self.write_symlink(&dest, entry),
            EntryKind::HardLink => self.write_hard_link(&dest, entry),
            EntryKind::Other(kind) => Err(SinkError::Unsupported(kind)),
        }
    }

    fn finish(&mut self) -> io::Result<()> {
        // Children first, so restoring a parent's mtime is the last touch it gets.
        for dir in self.deferred.drain(..).rev() {
            if let Some(mode) = dir.mode {
                set_mode(&dir.path, mode)?;
            }
            if let Some(mtime) = dir.mtime {
                filetime::set_file_mtime(&dir.path, mtime)?;
            }
        }
        Ok(())
    }
}

/// Validates that a symlink target doesn't escape the extraction directory.
fn validate_symlink_target(normalized_source: &Path, target: &Path) -> Result<(), ()> {
    let mut result = normalized_source
        .parent()
        .unwrap_or_else(|| Path::new(""))
        .to_path_buf();
    for component in target.components() {
        match component {
            Component::Prefix(..) | Component::RootDir => return Err(()),
            Component::Normal(component) => result.push(component),
            Component::ParentDir => match result.parent() {
                Some(parent) => result = parent.to_path_buf(),
                None => return Err(()),
            },
            Component::CurDir => {}
        }
    }
    Ok(())
}

/// Reads until `buf` is full or the reader is exhausted.
fn read_full(data: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match data.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

fn copy_data(
    data: &mut dyn Read,
    file: &mut fs_err::File,
    sparse: bool,
) -> Result<u64, SinkError> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut written = 0u64;
    loop {
        let n = read_full(data, &mut buf).map_err(SinkError::ReadData)?;
        if n == 0 {
            break;
        }
        if sparse {
            for block in buf[..n].chunks(SPARSE_BLOCK_SIZE) {
                if block.iter().all(|&b| b == 0) {
                    file.seek(SeekFrom::Current(block.len() as i64))?;
                } else {
                    file.write_all(block)?;
                }
            }
        } else {
            file.write_all(&buf[..n])?;
        }
        written += n as u64;
    }
    if sparse {
        // A trailing hole is only materialized by the final length.
        file.set_len(written)?;
    }
    Ok(written)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs_err::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o777))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn create_symlink(target: &Path, dest: &Path) -> io::Result<()> {
    fs_err::os::unix::fs::symlink(target, dest)
}

#[cfg(windows)]
fn create_symlink(target: &Path, dest: &Path) -> io::Result<()> {
    fs_err::os::windows::fs::symlink_file(target, dest)
}
