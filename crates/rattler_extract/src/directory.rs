//! Scoped changes of the process working directory.
//!
//! The working directory is process global. A [`DirectoryContext`] captures it when a run starts,
//! applies the pending change requested by the job at most once, and puts the original directory
//! back when the run ends. Two runs must never share a process concurrently.

use std::path::{Path, PathBuf};

use crate::error::{ExtractError, Result};

/// Captures the working directory for the duration of one run.
#[derive(Debug)]
pub struct DirectoryContext {
    original: PathBuf,
    pending: Option<PathBuf>,
    applied: bool,
    restored: bool,
}

impl DirectoryContext {
    /// Records the current working directory together with the change to apply later.
    pub fn capture(pending: Option<PathBuf>) -> Result<Self> {
        let original = std::env::current_dir().map_err(ExtractError::CurrentDir)?;
        Ok(Self {
            original,
            pending: pending.filter(|p| !p.as_os_str().is_empty()),
            applied: false,
            restored: false,
        })
    }

    /// The directory that was current when the context was captured
    pub fn original(&self) -> &Path {
        &self.original
    }

    /// Returns true once the pending change has been applied
    pub fn applied(&self) -> bool {
        self.applied
    }

    /// Applies the pending directory change, if there is one. The change is consumed, calling
    /// this again does nothing.
    pub fn apply(&mut self) -> Result<()> {
        let Some(target) = self.pending.take() else {
            return Ok(());
        };

        std::env::set_current_dir(&target).map_err(|source| ExtractError::ChangeDirectory {
            path: target.clone(),
            source,
        })?;
        tracing::debug!("changed working directory to {}", target.display());
        self.applied = true;
        Ok(())
    }

    /// Changes back to the captured directory.
    pub fn restore(mut self) -> Result<()> {
        self.restore_inner()
    }

    fn restore_inner(&mut self) -> Result<()> {
        if self.restored {
            return Ok(());
        }
        self.restored = true;
        std::env::set_current_dir(&self.original).map_err(|source| {
            ExtractError::RestoreDirectory {
                path: self.original.clone(),
                source,
            }
        })
    }
}

impl Drop for DirectoryContext {
    fn drop(&mut self) {
        if let Err(err) = self.restore_inner() {
            tracing::error!("{err}");
        }
    }
}
