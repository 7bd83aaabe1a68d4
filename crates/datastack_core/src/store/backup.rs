//! OS backup exclusion for on-disk stores.

use std::io;
use std::path::Path;

/// Marks a store file as excluded from OS-level backups.
pub trait BackupExclusion: Send + Sync {
    fn exclude(&self, path: &Path) -> io::Result<()>;
}

/// Platform implementation.
///
/// On macOS the file is excluded from Time Machine through `tmutil`; other
/// platforms have no per-file backup flag and the call is a no-op.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlatformBackupExclusion;

impl BackupExclusion for PlatformBackupExclusion {
    #[cfg(target_os = "macos")]
    fn exclude(&self, path: &Path) -> io::Result<()> {
        let status = std::process::Command::new("tmutil")
            .arg("addexclusion")
            .arg(path)
            .status()?;
        if !status.success() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("tmutil addexclusion exited with {status}"),
            ));
        }
        log::info!(
            "event=backup_exclude module=store status=ok path={}",
            path.display()
        );
        Ok(())
    }

    #[cfg(not(target_os = "macos"))]
    fn exclude(&self, path: &Path) -> io::Result<()> {
        log::debug!(
            "event=backup_exclude module=store status=skipped reason=unsupported_platform path={}",
            path.display()
        );
        Ok(())
    }
}
