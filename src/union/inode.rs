//! Merged inode identity cache and interposer.
//!
//! Every distinct underlying branch object gets exactly one merged inode per
//! mounted union, no matter how many namespace entries resolve to it. The
//! cache is an atomic find-or-insert keyed by the lower object's identity;
//! an inode is fully initialized before it becomes visible to other
//! resolvers.

use dashmap::DashMap;
use fuser::{FileAttr, FUSE_ROOT_ID};
use parking_lot::{Mutex, RwLock};
use std::fs::Metadata;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::union::convert::{io_error_to_libc, metadata_to_fileattr};
use crate::union::types::{LowerId, PathPair};
use crate::union::UnionFs;

/// Merged inode numbers normally equal the representative's lower inode
/// number. When two distinct lower objects (on different branch devices)
/// collide on a number, the loser gets an id from this reserved range.
const INO_REMAP_BASE: u64 = 1 << 48;

/// Operation dispatch class, selected from the representative's type at
/// inode construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Directory,
    Symlink,
    Other,
}

impl ObjectKind {
    pub(crate) fn from_metadata(meta: &Metadata) -> Self {
        let ft = meta.file_type();
        if ft.is_dir() {
            ObjectKind::Directory
        } else if ft.is_symlink() {
            ObjectKind::Symlink
        } else {
            ObjectKind::Other
        }
    }
}

/// The single object identity presented for a given underlying branch
/// object, shared by every namespace entry that resolves to it.
#[derive(Debug)]
pub struct MergedInode {
    pub ino: u64,
    pub lower: LowerId,
    pub kind: ObjectKind,
    pub attr: RwLock<FileAttr>,
    lookups: AtomicU64,
}

impl MergedInode {
    fn new(ino: u64, lower: LowerId, meta: &Metadata) -> Self {
        MergedInode {
            ino,
            lower,
            kind: ObjectKind::from_metadata(meta),
            attr: RwLock::new(metadata_to_fileattr(meta, ino)),
            lookups: AtomicU64::new(0),
        }
    }

    /// The kernel now holds one more reference to this inode.
    pub(crate) fn note_lookup(&self) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
    }

    /// Release `n` references; returns true when none remain.
    pub(crate) fn forget(&self, n: u64) -> bool {
        let mut cur = self.lookups.load(Ordering::Acquire);
        loop {
            let next = cur.saturating_sub(n);
            match self
                .lookups
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next == 0,
                Err(actual) => cur = actual,
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(ino: u64, lower: LowerId, meta: &Metadata) -> Self {
        Self::new(ino, lower, meta)
    }
}

/// Find-or-create cache of merged inodes, keyed by lower-inode identity.
#[derive(Debug)]
pub(crate) struct InodeCache {
    by_lower: DashMap<LowerId, Arc<MergedInode>>,
    by_ino: DashMap<u64, Arc<MergedInode>>,
    // serializes first-time interning only; cached hits stay lock-free
    intern_lock: Mutex<()>,
    next_remap: AtomicU64,
}

impl InodeCache {
    pub fn new() -> Self {
        InodeCache {
            by_lower: DashMap::new(),
            by_ino: DashMap::new(),
            intern_lock: Mutex::new(()),
            next_remap: AtomicU64::new(0),
        }
    }

    pub fn get(&self, ino: u64) -> Option<Arc<MergedInode>> {
        self.by_ino.get(&ino).map(|i| Arc::clone(i.value()))
    }

    /// Return the merged inode for `lower`, creating it on first resolution.
    /// At most one merged inode exists per lower identity; concurrent
    /// first-time resolutions race on `intern_lock`, and the loser reuses
    /// the winner's inode.
    pub fn intern(&self, lower: LowerId, meta: &Metadata) -> Arc<MergedInode> {
        if let Some(existing) = self.by_lower.get(&lower) {
            return Arc::clone(existing.value());
        }

        let _guard = self.intern_lock.lock();
        if let Some(existing) = self.by_lower.get(&lower) {
            return Arc::clone(existing.value());
        }

        let ino = if lower.ino != FUSE_ROOT_ID && !self.by_ino.contains_key(&lower.ino) {
            lower.ino
        } else {
            INO_REMAP_BASE | self.next_remap.fetch_add(1, Ordering::Relaxed)
        };

        // fully built before it is published
        let inode = Arc::new(MergedInode::new(ino, lower, meta));
        self.by_ino.insert(ino, inode.clone());
        self.by_lower.insert(lower, inode.clone());
        inode
    }

    /// Intern the union root under the well-known root inode number.
    pub fn intern_root(&self, lower: LowerId, meta: &Metadata) -> Arc<MergedInode> {
        let _guard = self.intern_lock.lock();
        let inode = Arc::new(MergedInode::new(FUSE_ROOT_ID, lower, meta));
        self.by_ino.insert(FUSE_ROOT_ID, inode.clone());
        self.by_lower.insert(lower, inode.clone());
        inode
    }

    /// Drop `nlookup` kernel references; evicts the inode once the last
    /// reference is gone. Returns true if the inode was evicted.
    pub fn forget(&self, ino: u64, nlookup: u64) -> bool {
        if ino == FUSE_ROOT_ID {
            return false;
        }
        let Some(inode) = self.get(ino) else {
            return false;
        };
        if inode.forget(nlookup) {
            self.by_ino.remove(&ino);
            self.by_lower.remove(&inode.lower);
            true
        } else {
            false
        }
    }
}

impl UnionFs {
    /// Attach the merged inode for an entry's first positive branch object,
    /// creating it if this lower object has not been seen before.
    ///
    /// Fails with EXDEV if the representative no longer lives on the device
    /// registered for its branch (e.g. a bind mount crossed a boundary
    /// mid-resolution).
    pub(crate) fn interpose(&self, paths: &PathPair) -> Result<Arc<MergedInode>, i32> {
        let Some(rep) = paths.first_positive() else {
            return Err(libc::ENOENT);
        };

        let meta = std::fs::symlink_metadata(&rep.path).map_err(|e| io_error_to_libc(&e))?;
        let lower = LowerId::of(&meta);

        if lower.dev != self.superblock().dev(rep.branch) {
            tracing::warn!(
                "object {} crossed the {:?} branch boundary (dev {} != {})",
                rep.path.display(),
                rep.branch,
                lower.dev,
                self.superblock().dev(rep.branch)
            );
            return Err(libc::EXDEV);
        }

        Ok(self.inodes.intern(lower, &meta))
    }

    /// Refresh a merged inode's cached attributes from a branch object.
    pub(crate) fn refresh_attr(&self, inode: &MergedInode, branch_path: &Path) -> Result<FileAttr, i32> {
        let meta = std::fs::symlink_metadata(branch_path).map_err(|e| io_error_to_libc(&e))?;
        crate::union::attrsync::copy_all_attributes(inode, &meta);
        Ok(*inode.attr.read())
    }
}
