//! One-component path resolution against both branches.

use std::ffi::OsStr;
use std::fs;
use std::io;

use crate::union::convert::io_error_to_libc;
use crate::union::types::{Branch, BranchRef, LowerId, PathPair};
use crate::union::whiteout::Whiteout;
use crate::union::UnionFs;

impl UnionFs {
    /// Resolve `name` against a parent's branch state, producing the branch
    /// state of the child.
    ///
    /// Branches are consulted in priority order. A branch is skipped when
    /// the parent has no object there or that object is not a directory.
    /// Before resolving in Primary the whiteout marker for `name` is
    /// consulted: if present, the entry is fully shadowed for Secondary, so
    /// resolution stops once Primary has been attempted. A miss is recorded
    /// as a negative reference, not an error; any other branch error aborts
    /// resolution.
    ///
    /// A fully negative result still carries a negative Primary reference
    /// whenever the Primary parent exists, so a follow-up create has a
    /// target.
    pub(crate) fn resolve_child(
        &self,
        parent_paths: &PathPair,
        name: &OsStr,
    ) -> Result<PathPair, i32> {
        // whiteout markers and the opaque marker are reserved names
        if !Whiteout::is_valid_name(name) {
            return Err(libc::EINVAL);
        }

        let out = PathPair::new();
        let mut shadowed = false;

        for branch in Branch::each() {
            let Some(parent_ref) = parent_paths.get(branch) else {
                continue;
            };
            if !parent_ref.is_positive() {
                continue;
            }
            let parent_meta = match fs::symlink_metadata(&parent_ref.path) {
                Ok(m) => m,
                Err(_) => continue,
            };
            if !parent_meta.is_dir() {
                continue;
            }

            if branch == Branch::Primary {
                if Whiteout::lookup(&parent_ref.path, name)?.is_some() {
                    shadowed = true;
                }
            } else if shadowed {
                // Secondary is not consulted for a shadowed name
                break;
            }

            let child_path = parent_ref.path.join(name);
            match fs::symlink_metadata(&child_path) {
                Ok(meta) => out.install(BranchRef {
                    branch,
                    path: child_path,
                    lower: Some(LowerId::of(&meta)),
                }),
                Err(e) if e.kind() == io::ErrorKind::NotFound => out.install(BranchRef {
                    branch,
                    path: child_path,
                    lower: None,
                }),
                Err(e) => return Err(io_error_to_libc(&e)),
            }
        }

        // negative placeholder in Primary so a create can follow
        if out.get(Branch::Primary).is_none() {
            if let Some(parent_ref) = parent_paths.get(Branch::Primary) {
                if parent_ref.is_positive() {
                    out.install(BranchRef {
                        branch: Branch::Primary,
                        path: parent_ref.path.join(name),
                        lower: None,
                    });
                }
            }
        }

        Ok(out)
    }
}
