//! Ownership of published files, recorded in sidecar marker files.
//!
//! Every resource managed here has a `<path>.owner` marker holding the
//! principal that reserved it. The marker may exist before the resource
//! does (a reservation), but the store never publishes a resource without
//! one. All operations run under a single store-wide lock, so no two
//! ownership operations interleave, even on unrelated paths.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use log::debug;
use thiserror::Error;

use crate::sidecar;

/// Errors returned by [`OwnershipStore`]
#[derive(Debug, Error)]
pub enum OwnershipError {
    #[error("{} is already owned", .path.display())]
    AlreadyOwned { path: PathBuf },

    #[error("{}: permission denied, owned by another user", .path.display())]
    PermissionDenied { path: PathBuf },

    #[error("{} has no owner marker", .path.display())]
    NotFound { path: PathBuf },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl OwnershipError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Whether this error is an ownership mismatch
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied { .. })
    }
}

/// Collection of owned files sharing one serializing lock
#[derive(Debug, Default)]
pub struct OwnershipStore {
    lock: Mutex<()>,
}

impl OwnershipStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        // The guarded data is `()`, a panic while holding it cannot leave
        // anything half-updated in memory.
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reserve `path` for `owner`
    ///
    /// Fails with [`OwnershipError::AlreadyOwned`] if a marker exists.
    pub fn create(&self, path: &Path, owner: &str) -> Result<(), OwnershipError> {
        let _guard = self.guard();

        match sidecar::create_owner_marker(path, owner) {
            Ok(()) => {
                debug!("{}: reserved for {}", path.display(), owner);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(OwnershipError::AlreadyOwned {
                    path: path.to_path_buf(),
                })
            }
            Err(e) => Err(OwnershipError::io(&sidecar::owner_marker_path(path), e)),
        }
    }

    /// Move the unowned file `src` onto the owned path `path`
    ///
    /// The marker for `path` must already exist (see [`Self::create`]) and
    /// name `owner`. The rename is the only visibility transition, so
    /// readers never observe a partially written file at `path`.
    pub fn move_into(&self, src: &Path, path: &Path, owner: &str) -> Result<(), OwnershipError> {
        let _guard = self.guard();

        check_owner(path, owner)?;
        fs::rename(src, path).map_err(|e| OwnershipError::io(src, e))?;

        debug!("{}: published from {}", path.display(), src.display());
        Ok(())
    }

    /// Delete the owned file at `path` together with its marker
    ///
    /// A missing data file is tolerated, since a marker may exist for a
    /// reservation that was never published. The marker is only removed
    /// once the data file is gone.
    pub fn delete(&self, path: &Path, owner: &str) -> Result<(), OwnershipError> {
        self.delete_with(path, owner, sidecar::remove_owner_marker)
    }

    /// [`Self::delete`] with the marker removal supplied by the caller
    ///
    /// A failed marker removal leaves the resource owned without data and is
    /// reported, the caller retries the delete.
    fn delete_with(
        &self,
        path: &Path,
        owner: &str,
        remove_marker: impl FnOnce(&Path) -> io::Result<()>,
    ) -> Result<(), OwnershipError> {
        let _guard = self.guard();

        check_owner(path, owner)?;

        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(OwnershipError::io(path, e)),
        }

        remove_marker(path)
            .map_err(|e| OwnershipError::io(&sidecar::owner_marker_path(path), e))?;

        debug!("{}: deleted by {}", path.display(), owner);
        Ok(())
    }

    /// Read the owner of `path`
    pub fn read_owner(&self, path: &Path) -> Result<String, OwnershipError> {
        let _guard = self.guard();
        read_owner(path)
    }
}

// Callers must hold the store lock.
fn read_owner(path: &Path) -> Result<String, OwnershipError> {
    sidecar::read_owner_marker(path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            OwnershipError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            OwnershipError::io(&sidecar::owner_marker_path(path), e)
        }
    })
}

// Callers must hold the store lock.
fn check_owner(path: &Path, owner: &str) -> Result<(), OwnershipError> {
    if read_owner(path)? != owner {
        return Err(OwnershipError::PermissionDenied {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}
