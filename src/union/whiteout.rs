//! Whiteout handling for the two-branch union filesystem.
//!
//! A "whiteout" is a marker that hides a same-named object in the Secondary
//! branch: deleting an object that still exists in Secondary leaves a marker
//! in the Primary branch so the Secondary copy stays logically invisible.
//! This module consolidates all whiteout-related logic in one place.
//!
//! The marker for a file named `foo` is a zero-length regular file named
//! `.wh.foo` in the same directory of the Primary branch.

use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use crate::union::convert::io_error_to_libc;
use crate::union::types::{Branch, PathPair};

/// The prefix used for whiteout marker files.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Marker name denoting an opaque directory (`.wh.__dir_opaque`). Reserved:
/// only the naming convention and exclusion-from-listing are honored.
pub const DIR_OPAQUE_NAME: &str = "__dir_opaque";

/// Outcome of the pre-create whiteout check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhiteoutCheck {
    /// No whiteout existed for the name.
    NotFound,
    /// A whiteout was found and removed; creation may proceed.
    Removed,
}

/// Whiteout utilities. All whiteout-related operations go through this type
/// so naming and classification stay consistent throughout the codebase.
pub struct Whiteout;

impl Whiteout {
    /// Generate the marker filename for `name`: `.wh.<name>`.
    pub fn marker_name(name: &OsStr) -> OsString {
        let mut whiteout_name = OsString::from(WHITEOUT_PREFIX);
        whiteout_name.push(name);
        whiteout_name
    }

    /// If `name` is in whiteout form, return the shadowed name with the
    /// prefix stripped. A bare `.wh.` does not count.
    pub fn strip_prefix(name: &OsStr) -> Option<OsString> {
        let bytes = name.as_bytes();
        let prefix = WHITEOUT_PREFIX.as_bytes();
        if bytes.len() > prefix.len() && bytes.starts_with(prefix) {
            Some(OsString::from(OsStr::from_bytes(&bytes[prefix.len()..])))
        } else {
            None
        }
    }

    /// Whether `name` may appear in the merged namespace: whiteout markers
    /// and the opaque marker are reserved and never valid merged names.
    pub fn is_valid_name(name: &OsStr) -> bool {
        let bytes = name.as_bytes();
        if bytes.starts_with(WHITEOUT_PREFIX.as_bytes()) {
            return false;
        }
        if bytes == DIR_OPAQUE_NAME.as_bytes() {
            return false;
        }
        true
    }

    /// Look for a whiteout of `name` in `primary_parent`. Returns the marker
    /// path if one exists. A marker that is not a plain regular file is
    /// branch corruption and fails with EIO.
    pub fn lookup(primary_parent: &Path, name: &OsStr) -> Result<Option<PathBuf>, i32> {
        let marker = primary_parent.join(Self::marker_name(name));
        match std::fs::symlink_metadata(&marker) {
            Ok(meta) if meta.is_file() => Ok(Some(marker)),
            Ok(meta) => {
                tracing::error!(
                    "invalid whiteout {}: entry type {:?}",
                    marker.display(),
                    meta.file_type()
                );
                Err(libc::EIO)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error_to_libc(&e)),
        }
    }

    /// Convenience wrapper: look for a whiteout of `name` under the parent
    /// entry's Primary branch directory.
    pub fn find(parent_paths: &PathPair, name: &OsStr) -> Result<Option<PathBuf>, i32> {
        match parent_paths.get(Branch::Primary) {
            Some(p) if p.is_positive() => Self::lookup(&p.path, name),
            _ => Ok(None),
        }
    }

    /// Remove a whiteout marker.
    ///
    /// Whiteouts are special files and should be deleted no matter what (as
    /// if they never existed) so that a subsequent create can succeed: in a
    /// sticky directory the marker may have been created by one user while
    /// the new object is created by another. A denied removal is therefore
    /// retried once through the direct low-level unlink path before the
    /// error is surfaced.
    pub fn unlink(marker: &Path) -> Result<(), i32> {
        match std::fs::remove_file(marker) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                match nix::unistd::unlink(marker) {
                    Ok(()) => Ok(()),
                    Err(errno) => {
                        tracing::error!(
                            "could not unlink whiteout {}: {}",
                            marker.display(),
                            errno
                        );
                        Err(errno as i32)
                    }
                }
            }
            Err(e) => {
                tracing::error!("could not unlink whiteout {}: {}", marker.display(), e);
                Err(io_error_to_libc(&e))
            }
        }
    }

    /// Pre-create helper (create, mkdir, mknod, symlink): if a whiteout for
    /// `name` exists in `primary_parent`, remove it so the new object is not
    /// born shadowed.
    ///
    /// `primary_positive` flags whether a Primary object of `name` already
    /// exists; finding both a whiteout and a positive object is an
    /// inconsistency that is logged but does not block removal.
    pub fn check_unlink(
        primary_parent: &Path,
        name: &OsStr,
        primary_positive: bool,
    ) -> Result<WhiteoutCheck, i32> {
        let Some(marker) = Self::lookup(primary_parent, name)? else {
            return Ok(WhiteoutCheck::NotFound);
        };

        if primary_positive {
            tracing::warn!(
                "removing whiteout while a regular object exists in {}",
                primary_parent.display()
            );
        }

        Self::unlink(&marker)?;
        Ok(WhiteoutCheck::Removed)
    }

    /// Create the marker for `name` in `primary_parent`. Called after an
    /// object was deleted from Primary while a Secondary counterpart still
    /// exists. Whiteouts are always created in the Primary branch.
    pub fn create(primary_parent: &Path, name: &OsStr) -> Result<(), i32> {
        let marker = primary_parent.join(Self::marker_name(name));
        File::create(&marker).map_err(|e| io_error_to_libc(&e))?;
        Ok(())
    }
}
