//! Lazily opened store handle with recovery and drop support.
//!
//! # Invariants
//! - The handle moves `NotOpened -> Open -> Closed`, never backwards.
//! - A seed is copied only when the store file does not exist yet.
//! - Corruption recovery deletes and reopens exactly once; any further
//!   failure is fatal.

use super::backup::{BackupExclusion, PlatformBackupExclusion};
use super::{FileRemovalError, StoreError, StoreResult};
use crate::db::{open_db, open_db_in_memory};
use crate::fatal::fatal;
use crate::model::changes::ChangeSet;
use crate::model::object::{ManagedObject, ObjectId};
use crate::repo::object_repo::{ObjectRepository, SqliteObjectRepository};
use log::{debug, info, warn};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

const SIDE_FILE_SUFFIXES: [&str; 2] = ["-shm", "-wal"];

/// Where a coordinator keeps its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    InMemory,
    OnDisk {
        path: PathBuf,
        /// Bundled store copied into place before the first open.
        seed: Option<PathBuf>,
    },
}

impl StoreLocation {
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::InMemory => None,
            Self::OnDisk { path, .. } => Some(path),
        }
    }
}

#[derive(Clone)]
pub struct CoordinatorOptions {
    /// Excludes the store file from OS backups after each successful open.
    pub exclude_from_backup: bool,
    pub backup_exclusion: Arc<dyn BackupExclusion>,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            exclude_from_backup: true,
            backup_exclusion: Arc::new(PlatformBackupExclusion),
        }
    }
}

enum HandleState {
    NotOpened,
    Open(Connection),
    Closed,
}

/// Owns the engine handle shared by every context of one stack.
pub struct StoreCoordinator {
    location: StoreLocation,
    options: CoordinatorOptions,
    handle: Mutex<HandleState>,
}

impl StoreCoordinator {
    pub fn new(location: StoreLocation, options: CoordinatorOptions) -> Self {
        Self {
            location,
            options,
            handle: Mutex::new(HandleState::NotOpened),
        }
    }

    /// Throw-away in-memory coordinator.
    pub fn in_memory() -> Self {
        Self::new(
            StoreLocation::InMemory,
            CoordinatorOptions {
                exclude_from_backup: false,
                ..CoordinatorOptions::default()
            },
        )
    }

    pub fn location(&self) -> &StoreLocation {
        &self.location
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.handle.lock(), HandleState::Open(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.handle.lock(), HandleState::Closed)
    }

    /// Opens the backing store once; later calls reuse the cached handle.
    ///
    /// # Panics
    /// - Seed copy failure, failed recovery, unusable directories and
    ///   backup-exclusion failures are fatal.
    ///
    /// # Errors
    /// - Returns `StoreError::Closed` after `close`.
    pub fn open(&self) -> StoreResult<()> {
        self.with_connection(|_| Ok(()))
    }

    /// Returns stored objects of `entity`, ordered by identity.
    pub fn fetch(&self, entity: &str) -> StoreResult<Vec<ManagedObject>> {
        self.with_connection(|conn| Ok(SqliteObjectRepository::new(conn).fetch_entity(entity)?))
    }

    pub fn fetch_object(&self, id: ObjectId) -> StoreResult<Option<ManagedObject>> {
        self.with_connection(|conn| Ok(SqliteObjectRepository::new(conn).get_object(id)?))
    }

    pub fn count_objects(&self) -> StoreResult<u64> {
        self.with_connection(|conn| Ok(SqliteObjectRepository::new(conn).count_objects()?))
    }

    /// Writes `changes` in one transaction.
    pub fn commit(&self, changes: &ChangeSet) -> StoreResult<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let started_at = Instant::now();
        self.with_connection(|conn| {
            let tx = conn.transaction()?;
            SqliteObjectRepository::new(&tx).apply_changes(changes)?;
            tx.commit()?;
            Ok(())
        })?;
        debug!(
            "event=store_commit module=store status=ok objects={} duration_ms={}",
            changes.len(),
            started_at.elapsed().as_millis()
        );
        Ok(())
    }

    /// Deletes every stored object of `entity`.
    pub fn delete_entity(&self, entity: &str) -> StoreResult<usize> {
        self.with_connection(|conn| Ok(SqliteObjectRepository::new(conn).delete_entity(entity)?))
    }

    /// Releases the engine handle for good.
    pub fn close(&self) {
        let previous = std::mem::replace(&mut *self.handle.lock(), HandleState::Closed);
        if let HandleState::Open(conn) = previous {
            if let Err((_, err)) = conn.close() {
                warn!("event=store_close module=store status=error error={err}");
            }
        }
    }

    /// Deletes the store file and its side files, best effort per file.
    ///
    /// In-memory stores have no files and always succeed.
    pub fn remove_files(&self) -> StoreResult<()> {
        let Some(path) = self.location.path() else {
            return Ok(());
        };

        let failures = remove_store_files(path);
        if failures.is_empty() {
            info!(
                "event=store_drop module=store status=ok path={}",
                path.display()
            );
            Ok(())
        } else {
            for failure in &failures {
                warn!("event=store_drop module=store status=error file={failure}");
            }
            Err(StoreError::Drop(failures))
        }
    }

    /// Closes the handle, then deletes the store files.
    pub fn drop_store(&self) -> StoreResult<()> {
        self.close();
        self.remove_files()
    }

    fn with_connection<T, F>(&self, operation: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T>,
    {
        let mut handle = self.handle.lock();
        if matches!(*handle, HandleState::NotOpened) {
            *handle = HandleState::Open(self.open_connection());
        }

        match &mut *handle {
            HandleState::Open(conn) => operation(conn),
            HandleState::Closed => Err(StoreError::Closed),
            HandleState::NotOpened => unreachable!("store handle opened above"),
        }
    }

    fn open_connection(&self) -> Connection {
        match &self.location {
            StoreLocation::InMemory => match open_db_in_memory() {
                Ok(conn) => conn,
                Err(err) => fatal(
                    "store_open",
                    format!("failed to create in-memory store: {err}"),
                ),
            },
            StoreLocation::OnDisk { path, seed } => self.open_on_disk(path, seed.as_deref()),
        }
    }

    fn open_on_disk(&self, path: &Path, seed: Option<&Path>) -> Connection {
        if let Some(directory) = path.parent() {
            if let Err(err) = std::fs::create_dir_all(directory) {
                fatal(
                    "store_open",
                    format!(
                        "failed to create store directory `{}`: {err}",
                        directory.display()
                    ),
                );
            }
        }

        if !path.exists() {
            if let Some(seed) = seed.filter(|seed| seed.is_file()) {
                if let Err(err) = std::fs::copy(seed, path) {
                    fatal(
                        "store_preload",
                        format!(
                            "could not copy preloaded store `{}`: {err}",
                            seed.display()
                        ),
                    );
                }
                info!(
                    "event=store_preload module=store status=ok seed={} path={}",
                    seed.display(),
                    path.display()
                );
            }
        }

        let conn = match open_db(path) {
            Ok(conn) => conn,
            Err(err) => {
                warn!(
                    "event=store_open module=store status=recovering path={} error={}",
                    path.display(),
                    err
                );
                let failures = remove_store_files(path);
                if let Some(failure) = failures.first() {
                    fatal(
                        "store_recover",
                        format!("failed to remove unreadable store: {failure}"),
                    );
                }
                match open_db(path) {
                    Ok(conn) => conn,
                    Err(err) => fatal(
                        "store_recover",
                        format!(
                            "failed to recreate store `{}` after removing it: {err}",
                            path.display()
                        ),
                    ),
                }
            }
        };

        if self.options.exclude_from_backup {
            if let Err(err) = self.options.backup_exclusion.exclude(path) {
                fatal(
                    "backup_exclude",
                    format!(
                        "excluding store `{}` from backup failed: {err}",
                        path.display()
                    ),
                );
            }
        }

        info!(
            "event=store_open module=store status=ok mode=file path={}",
            path.display()
        );
        conn
    }
}

/// Returns the store file followed by its engine side files.
pub fn store_files(path: &Path) -> Vec<PathBuf> {
    let mut files = Vec::with_capacity(SIDE_FILE_SUFFIXES.len() + 1);
    files.push(path.to_path_buf());
    for suffix in SIDE_FILE_SUFFIXES {
        let mut name = path.as_os_str().to_os_string();
        name.push(suffix);
        files.push(PathBuf::from(name));
    }
    files
}

fn remove_store_files(path: &Path) -> Vec<FileRemovalError> {
    let mut failures = Vec::new();
    for file in store_files(path) {
        match std::fs::remove_file(&file) {
            Ok(()) => debug!(
                "event=store_file_remove module=store status=ok path={}",
                file.display()
            ),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(source) => failures.push(FileRemovalError { path: file, source }),
        }
    }
    failures
}
