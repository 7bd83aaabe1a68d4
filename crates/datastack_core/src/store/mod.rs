//! Store coordinator: the single engine handle shared by a stack's contexts.
//!
//! # Responsibility
//! - Lazily open the backing store (in-memory or on-disk).
//! - Preload a bundled seed, recover once from a corrupt store file.
//! - Commit change sets atomically and serve fetches.
//! - Close and delete the store when the stack is dropped.
//!
//! # Invariants
//! - A closed coordinator never reopens; every operation returns
//!   `StoreError::Closed`.
//! - Engine access is serialized by the coordinator's handle lock.

use crate::db::DbError;
use crate::repo::object_repo::RepoError;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

mod backup;
mod coordinator;

pub use backup::{BackupExclusion, PlatformBackupExclusion};
pub use coordinator::{store_files, CoordinatorOptions, StoreCoordinator, StoreLocation};

pub type StoreResult<T> = Result<T, StoreError>;

/// One file that could not be deleted while dropping a store.
#[derive(Debug)]
pub struct FileRemovalError {
    pub path: PathBuf,
    pub source: std::io::Error,
}

impl Display for FileRemovalError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.source)
    }
}

impl Error for FileRemovalError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.source)
    }
}

#[derive(Debug)]
pub enum StoreError {
    Repo(RepoError),
    /// The coordinator was closed by a drop; a fresh stack must be used.
    Closed,
    /// Some store files survived a drop. Every other file was still removed.
    Drop(Vec<FileRemovalError>),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Repo(err) => write!(f, "{err}"),
            Self::Closed => write!(f, "store coordinator is closed"),
            Self::Drop(failures) => {
                write!(f, "failed to delete {} store file(s):", failures.len())?;
                for failure in failures {
                    write!(f, " [{failure}]")?;
                }
                Ok(())
            }
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Repo(err) => Some(err),
            Self::Closed => None,
            Self::Drop(failures) => failures
                .first()
                .map(|failure| failure as &(dyn Error + 'static)),
        }
    }
}

impl From<RepoError> for StoreError {
    fn from(value: RepoError) -> Self {
        Self::Repo(value)
    }
}

impl From<DbError> for StoreError {
    fn from(value: DbError) -> Self {
        Self::Repo(RepoError::Db(value))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Repo(RepoError::from(value))
    }
}
