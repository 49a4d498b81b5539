//! The union engine: lookup and mutation operations behind the FUSE
//! callbacks. Everything here speaks errnos; `mod.rs` only translates
//! between these methods and FUSE replies, so the engine can be driven
//! directly by tests and by the raw-I/O forwarding layer.

use fuser::FileAttr;
use parking_lot::Mutex;
use std::ffi::OsStr;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use crate::union::attrsync;
use crate::union::convert::io_error_to_libc;
use crate::union::file_handle::{DirHandle, FileHandle, Handle, READ_BUFFER};
use crate::union::filldir::{merge_branch_listing, MergedDirEntry};
use crate::union::inode::ObjectKind;
use crate::union::types::{Branch, BranchRef, EntryData, LowerId, PathPair};
use crate::union::whiteout::Whiteout;
use crate::union::UnionFs;

/// Requested attribute changes, already normalized from the FUSE callback.
#[derive(Debug, Default, Clone, Copy)]
pub struct AttrChanges {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
}

impl UnionFs {
    pub(crate) fn alloc_fh(&self) -> u64 {
        let mut next = self.next_fh.lock();
        let fh = *next;
        // wrapping_add: file handles are ephemeral and recycled when files
        // are closed, so overflow is not a practical concern
        *next = next.wrapping_add(1);
        fh
    }

    /// Per-object native mutation lock. Whiteout creation and removal always
    /// run under the parent directory's lock, making marker visibility
    /// atomic with respect to concurrent lookups of the same name.
    pub(crate) fn object_lock(&self, ino: u64) -> Arc<Mutex<()>> {
        let mut locks = self.object_locks.write();
        locks
            .entry(ino)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Branch state of a cached entry. Part of the collaborator surface:
    /// the attribute-sync and forwarding layers address objects through it.
    pub fn entry_paths(&self, ino: u64) -> Option<Arc<PathPair>> {
        self.entries.read().peek(ino).map(|e| e.paths.clone())
    }

    /// The already-open branch file behind a merged open file, for the raw
    /// byte-forwarding layer.
    pub fn branch_file(&self, fh: u64, branch: Branch) -> Option<Arc<Mutex<File>>> {
        match self.handles.read().get(&fh) {
            Some(Handle::File(h)) if h.branch == branch => Some(h.file.clone()),
            _ => None,
        }
    }

    fn entry(&self, ino: u64) -> Result<EntryData, i32> {
        self.entries.read().peek(ino).cloned().ok_or(libc::ENOENT)
    }

    /// Positive Primary reference of a parent entry, required before any
    /// structural mutation in the Primary branch.
    fn primary_parent(&self, entry: &EntryData) -> Result<BranchRef, i32> {
        match entry.paths.get(Branch::Primary) {
            Some(r) if r.is_positive() => Ok(r),
            _ => Err(libc::EPERM),
        }
    }

    /// Propagate directory times and size from the Primary parent object to
    /// the parent's merged inode after a structural mutation.
    fn propagate_parent_attrs(&self, parent: u64, parent_entry: &EntryData) {
        let Some(rep) = parent_entry.paths.get(Branch::Primary).filter(|r| r.is_positive()) else {
            return;
        };
        let Ok(meta) = fs::symlink_metadata(&rep.path) else {
            return;
        };
        if let Some(inode) = self.inodes.get(parent) {
            attrsync::copy_times(&inode, &meta);
            attrsync::copy_size(&inode, &meta);
        }
    }

    // ---- lookup ----------------------------------------------------------

    /// Validity check for a cached child. Ok(attr) serves the cached entry,
    /// Err(None) means the entry went stale and must be re-resolved,
    /// Err(Some(errno)) aborts the lookup.
    fn lookup_check_cached(&self, ino: u64) -> Result<FileAttr, Option<i32>> {
        let (entry, parent_entry) = {
            let entries = self.entries.read();
            let entry = entries.peek(ino).cloned().ok_or(None)?;
            let parent_entry = entries.peek(entry.parent).cloned();
            (entry, parent_entry)
        };
        let inode = self.inodes.get(ino).ok_or(None)?;
        let rep = entry.paths.first_positive().ok_or(None)?;

        // a whiteout created since caching shadows a Secondary-sourced entry
        if rep.branch == Branch::Secondary {
            if let Some(parent_entry) = parent_entry {
                match Whiteout::find(&parent_entry.paths, &entry.name) {
                    Ok(Some(_)) => return Err(None),
                    Ok(None) => {}
                    Err(e) => return Err(Some(e)),
                }
            }
        }

        match self.refresh_attr(&inode, &rep.path) {
            Ok(attr) => Ok(attr),
            Err(e) if e == libc::ENOENT => Err(None),
            Err(e) => Err(Some(e)),
        }
    }

    /// Resolve one name under a parent, producing (and caching) the merged
    /// entry. "Not found" yields ENOENT, never an error escalation.
    pub fn do_lookup(&self, parent: u64, name: &OsStr) -> Result<FileAttr, i32> {
        let cached = self.entries.read().lookup_child(parent, name);
        if let Some(ino) = cached {
            match self.lookup_check_cached(ino) {
                Ok(attr) => {
                    if let Some(inode) = self.inodes.get(ino) {
                        inode.note_lookup();
                    }
                    return Ok(attr);
                }
                Err(Some(errno)) => return Err(errno),
                Err(None) => {
                    tracing::debug!("lookup: cached entry {} for {:?} went stale", ino, name);
                    self.entries.write().remove(ino);
                }
            }
        }

        let parent_entry = self.entry(parent)?;
        let pair = self.resolve_child(&parent_entry.paths, name)?;

        if pair.first_positive().is_none() {
            return Err(libc::ENOENT);
        }

        let inode = self.interpose(&pair)?;

        // a successful resolution refreshes the parent's atime
        if let Some(parent_rep) = parent_entry.paths.first_positive() {
            if let Ok(meta) = fs::symlink_metadata(&parent_rep.path) {
                if let Some(parent_inode) = self.inodes.get(parent) {
                    attrsync::copy_atime(&parent_inode, &meta);
                }
            }
        }

        let attr = *inode.attr.read();
        inode.note_lookup();
        self.entries.write().insert(EntryData {
            ino: inode.ino,
            parent,
            name: name.to_os_string(),
            paths: Arc::new(pair),
        });
        Ok(attr)
    }

    pub fn do_getattr(&self, ino: u64) -> Result<FileAttr, i32> {
        self.inodes
            .get(ino)
            .map(|i| *i.attr.read())
            .ok_or(libc::ENOENT)
    }

    // ---- creation --------------------------------------------------------

    /// Shared pre-create policy: resolve the (necessarily negative) target,
    /// remove a stale whiteout so the new object is not born shadowed, then
    /// hand the Primary-branch target path to `create_fn`.
    fn create_common<F>(
        &self,
        parent: u64,
        name: &OsStr,
        create_fn: F,
    ) -> Result<FileAttr, i32>
    where
        F: FnOnce(&PathBuf) -> Result<(), i32>,
    {
        let parent_entry = self.entry(parent)?;
        let pair = self.resolve_child(&parent_entry.paths, name)?;
        if pair.first_positive().is_some() {
            return Err(libc::EEXIST);
        }
        let target = pair.get(Branch::Primary).ok_or(libc::EPERM)?;
        let primary_parent = self.primary_parent(&parent_entry)?;

        let lock = self.object_lock(parent);
        let _guard = lock.lock();

        match Whiteout::check_unlink(&primary_parent.path, name, false) {
            Ok(_) => {}
            // a read-only Primary will fail the create itself
            Err(e) if e == libc::EROFS => {}
            Err(e) => return Err(e),
        }

        create_fn(&target.path)?;

        let meta = fs::symlink_metadata(&target.path).map_err(|e| io_error_to_libc(&e))?;
        pair.install(BranchRef {
            branch: Branch::Primary,
            path: target.path.clone(),
            lower: Some(LowerId::of(&meta)),
        });

        let inode = self.interpose(&pair)?;
        let attr = *inode.attr.read();
        inode.note_lookup();
        self.entries.write().insert(EntryData {
            ino: inode.ino,
            parent,
            name: name.to_os_string(),
            paths: Arc::new(pair),
        });
        self.propagate_parent_attrs(parent, &parent_entry);
        Ok(attr)
    }

    /// Create a regular file in Primary and open it.
    pub fn do_create(&self, parent: u64, name: &OsStr, mode: u32) -> Result<(FileAttr, u64), i32> {
        let mut created: Option<File> = None;
        let attr = self.create_common(parent, name, |path| {
            // permission bits only; create() is for regular files
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .mode(mode & 0o7777)
                .open(path)
                .map_err(|e| io_error_to_libc(&e))?;
            created = Some(file);
            Ok(())
        })?;

        let file = created.ok_or(libc::EIO)?;
        let fh = self.alloc_fh();
        self.handles.write().insert(
            fh,
            Handle::File(FileHandle {
                branch: Branch::Primary,
                file: Arc::new(Mutex::new(file)),
                writable: true,
            }),
        );
        Ok((attr, fh))
    }

    pub fn do_mkdir(&self, parent: u64, name: &OsStr, mode: u32) -> Result<FileAttr, i32> {
        self.create_common(parent, name, |path| {
            fs::create_dir(path).map_err(|e| io_error_to_libc(&e))?;
            let _ = fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777));
            Ok(())
        })
    }

    pub fn do_symlink(&self, parent: u64, name: &OsStr, target: &std::path::Path) -> Result<FileAttr, i32> {
        self.create_common(parent, name, |path| {
            std::os::unix::fs::symlink(target, path).map_err(|e| io_error_to_libc(&e))
        })
    }

    pub fn do_mknod(&self, parent: u64, name: &OsStr, mode: u32, rdev: u32) -> Result<FileAttr, i32> {
        self.create_common(parent, name, |path| {
            let kind = nix::sys::stat::SFlag::from_bits_truncate(
                (mode & libc::S_IFMT as u32) as libc::mode_t,
            );
            let perm = nix::sys::stat::Mode::from_bits_truncate((mode & 0o7777) as libc::mode_t);
            nix::sys::stat::mknod(path, kind, perm, rdev as libc::dev_t)
                .map_err(|e| e as i32)
        })
    }

    // ---- removal ---------------------------------------------------------

    /// Unlink or rmdir: remove from the highest-priority branch holding the
    /// object, then leave a whiteout when a Secondary counterpart remains.
    pub fn do_remove(&self, parent: u64, name: &OsStr) -> Result<(), i32> {
        let parent_entry = self.entry(parent)?;

        let cached_ino = self.entries.read().lookup_child(parent, name);
        let pair = match cached_ino.and_then(|ino| self.entry_paths(ino)) {
            Some(p) => p,
            None => Arc::new(self.resolve_child(&parent_entry.paths, name)?),
        };

        // scan for positive branch objects, Secondary then Primary
        let snapshot = pair.snapshot();
        let secondary = snapshot[Branch::Secondary.index()]
            .clone()
            .filter(|r| r.is_positive());
        let primary = snapshot[Branch::Primary.index()]
            .clone()
            .filter(|r| r.is_positive());
        if primary.is_none() && secondary.is_none() {
            return Err(libc::ENOENT);
        }

        let lock = self.object_lock(parent);
        let _guard = lock.lock();

        if let Some(primary) = &primary {
            let meta = fs::symlink_metadata(&primary.path).map_err(|e| io_error_to_libc(&e))?;
            let result = if meta.is_dir() {
                fs::remove_dir(&primary.path)
            } else {
                fs::remove_file(&primary.path)
            };
            result.map_err(|e| io_error_to_libc(&e))?;
        }

        if secondary.is_some() {
            // the marker lives in the Primary parent, which must exist
            let primary_parent = self.primary_parent(&parent_entry)?;
            Whiteout::create(&primary_parent.path, name)?;
        }

        if let Some(ino) = cached_ino {
            if let Some(inode) = self.inodes.get(ino) {
                let mut attr = inode.attr.write();
                attr.nlink = attr.nlink.saturating_sub(1);
            }
            self.entries.write().remove(ino);
        } else {
            self.entries.write().remove_child(parent, name);
        }

        self.propagate_parent_attrs(parent, &parent_entry);
        Ok(())
    }

    // ---- rename ----------------------------------------------------------

    /// Ancestry trap for rename: operating across an ancestor/descendant
    /// pair would corrupt the tree, so it is rejected before the native
    /// rename runs.
    fn rename_trap(src: &std::path::Path, dst: &std::path::Path) -> Option<i32> {
        if src == dst {
            return None;
        }
        // source must not be an ancestor of target
        if dst.starts_with(src) {
            return Some(libc::EINVAL);
        }
        // target must not be an ancestor of source
        if src.starts_with(dst) {
            return Some(libc::ENOTEMPTY);
        }
        None
    }

    /// Rename within the Primary branch only; Secondary state is not
    /// touched. Parents' locks are taken in canonical order and the
    /// ancestry trap is checked before the native rename.
    pub fn do_rename(
        &self,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
    ) -> Result<(), i32> {
        if !Whiteout::is_valid_name(name) || !Whiteout::is_valid_name(newname) {
            return Err(libc::EINVAL);
        }

        let parent_entry = self.entry(parent)?;
        let newparent_entry = self.entry(newparent)?;

        let src_ino = self.entries.read().lookup_child(parent, name);
        let src_pair = match src_ino.and_then(|ino| self.entry_paths(ino)) {
            Some(p) => p,
            None => Arc::new(self.resolve_child(&parent_entry.paths, name)?),
        };

        // the source must exist in Primary; the destination parent must too
        let src_primary = src_pair
            .get(Branch::Primary)
            .filter(|r| r.is_positive())
            .ok_or(libc::EPERM)?;
        let dst_parent_primary = self.primary_parent(&newparent_entry)?;
        let dst_path = dst_parent_primary.path.join(newname);

        // both parents' locks, canonical (ino) order
        let (first, second) = if parent <= newparent {
            (parent, newparent)
        } else {
            (newparent, parent)
        };
        let first_lock = self.object_lock(first);
        let _first_guard = first_lock.lock();
        let second_lock = (second != first).then(|| self.object_lock(second));
        let _second_guard = second_lock.as_ref().map(|l| l.lock());

        if let Some(errno) = Self::rename_trap(&src_primary.path, &dst_path) {
            return Err(errno);
        }

        fs::rename(&src_primary.path, &dst_path).map_err(|e| io_error_to_libc(&e))?;

        let moved_meta = fs::symlink_metadata(&dst_path).map_err(|e| io_error_to_libc(&e))?;

        {
            let mut entries = self.entries.write();
            // an existing destination entry was replaced by the rename
            if let Some(old_ino) = entries.lookup_child(newparent, newname) {
                if Some(old_ino) != src_ino {
                    entries.remove(old_ino);
                }
            }
            entries.remove_child(parent, name);

            if let Some(ino) = src_ino {
                if let Some(mut entry) = entries.peek(ino).cloned() {
                    // descendants now hold stale branch paths; drop them so
                    // the next lookup re-resolves
                    entries.prune_subtree(ino);
                    entries.remove(ino);

                    let new_pair = PathPair::new();
                    new_pair.install(BranchRef {
                        branch: Branch::Primary,
                        path: dst_path.clone(),
                        lower: Some(LowerId::of(&moved_meta)),
                    });
                    entry.parent = newparent;
                    entry.name = newname.to_os_string();
                    entry.paths = Arc::new(new_pair);
                    entries.insert(entry);
                }
            }
        }

        self.propagate_parent_attrs(newparent, &newparent_entry);
        if newparent != parent {
            self.propagate_parent_attrs(parent, &parent_entry);
        }
        Ok(())
    }

    // ---- hard link -------------------------------------------------------

    pub fn do_link(&self, ino: u64, newparent: u64, newname: &OsStr) -> Result<FileAttr, i32> {
        if !Whiteout::is_valid_name(newname) {
            return Err(libc::EINVAL);
        }

        let src_entry = self.entry(ino)?;
        let src_primary = src_entry
            .paths
            .get(Branch::Primary)
            .filter(|r| r.is_positive())
            .ok_or(libc::EPERM)?;

        let newparent_entry = self.entry(newparent)?;
        let dst_parent_primary = self.primary_parent(&newparent_entry)?;

        let pair = self.resolve_child(&newparent_entry.paths, newname)?;
        if pair.first_positive().is_some() {
            return Err(libc::EEXIST);
        }
        let dst_path = dst_parent_primary.path.join(newname);

        let inode = self.inodes.get(ino).ok_or(libc::ENOENT)?;
        let size_save = inode.attr.read().size;

        let lock = self.object_lock(newparent);
        let _guard = lock.lock();

        fs::hard_link(&src_primary.path, &dst_path).map_err(|e| io_error_to_libc(&e))?;

        let meta = fs::symlink_metadata(&dst_path).map_err(|e| io_error_to_libc(&e))?;
        pair.install(BranchRef {
            branch: Branch::Primary,
            path: dst_path.clone(),
            lower: Some(LowerId::of(&meta)),
        });

        // same lower object, so the identity cache hands back the same
        // merged inode; the new name maps onto it
        let dst_inode = self.interpose(&pair)?;
        attrsync::copy_all_attributes(&dst_inode, &meta);
        dst_inode.attr.write().size = size_save;
        dst_inode.note_lookup();

        self.entries
            .write()
            .add_child(newparent, newname, dst_inode.ino);
        self.propagate_parent_attrs(newparent, &newparent_entry);
        let attr = *dst_inode.attr.read();
        Ok(attr)
    }

    // ---- setattr ---------------------------------------------------------

    pub fn do_setattr(
        &self,
        ino: u64,
        changes: &AttrChanges,
        req_uid: u32,
    ) -> Result<FileAttr, i32> {
        let entry = self.entry(ino)?;
        let inode = self.inodes.get(ino).ok_or(libc::ENOENT)?;

        // permission check against the merged inode's cached attributes
        {
            let attr = inode.attr.read();
            let owner = req_uid == 0 || req_uid == attr.uid;
            if changes.mode.is_some() && !owner {
                return Err(libc::EPERM);
            }
            if changes.uid.is_some_and(|u| u != attr.uid) && req_uid != 0 {
                return Err(libc::EPERM);
            }
            if changes.gid.is_some() && !owner {
                return Err(libc::EPERM);
            }
            if (changes.atime.is_some() || changes.mtime.is_some()) && !owner {
                return Err(libc::EACCES);
            }
        }

        // attribute changes apply to the Primary object only
        let primary = entry
            .paths
            .get(Branch::Primary)
            .filter(|r| r.is_positive())
            .ok_or(libc::EPERM)?;

        // scoped native mutation lock, released on every exit path
        let lock = self.object_lock(ino);
        let _guard = lock.lock();

        if let Some(size) = changes.size {
            // when shrinking, truncate the merged inode first to bound
            // in-flight dirty state
            {
                let mut attr = inode.attr.write();
                if size < attr.size {
                    attr.size = size;
                }
            }
            let file = OpenOptions::new()
                .write(true)
                .open(&primary.path)
                .map_err(|e| io_error_to_libc(&e))?;
            file.set_len(size).map_err(|e| io_error_to_libc(&e))?;
        }

        if let Some(mode) = changes.mode {
            fs::set_permissions(&primary.path, fs::Permissions::from_mode(mode & 0o7777))
                .map_err(|e| io_error_to_libc(&e))?;
        }

        if changes.uid.is_some() || changes.gid.is_some() {
            nix::unistd::chown(
                &primary.path,
                changes.uid.map(nix::unistd::Uid::from_raw),
                changes.gid.map(nix::unistd::Gid::from_raw),
            )
            .map_err(|e| e as i32)?;
        }

        if changes.atime.is_some() || changes.mtime.is_some() {
            let file = File::open(&primary.path).map_err(|e| io_error_to_libc(&e))?;
            let mut times = fs::FileTimes::new();
            if let Some(atime) = changes.atime {
                times = times.set_accessed(atime);
            }
            if let Some(mtime) = changes.mtime {
                times = times.set_modified(mtime);
            }
            file.set_times(times).map_err(|e| io_error_to_libc(&e))?;
        }

        self.refresh_attr(&inode, &primary.path)
    }

    // ---- open files ------------------------------------------------------

    /// Open the first positive branch object behind a merged file.
    ///
    /// Copy-up is deferred: write flags on a Secondary object are suppressed
    /// so the open succeeds read-only, and writes through the handle fail.
    pub fn do_open(&self, ino: u64, flags: i32) -> Result<u64, i32> {
        let inode = self.inodes.get(ino).ok_or(libc::ENOENT)?;
        if inode.kind == ObjectKind::Directory {
            return Err(libc::EISDIR);
        }
        let entry = self.entry(ino)?;
        let rep = entry.paths.first_positive().ok_or(libc::ENOENT)?;

        let wants_write = (flags & libc::O_ACCMODE) != libc::O_RDONLY;
        let suppressed = wants_write && rep.branch == Branch::Secondary;
        if suppressed {
            tracing::debug!(
                "open: suppressing write flags for secondary object {}",
                rep.path.display()
            );
        }
        let writable = wants_write && !suppressed;

        let file = File::options()
            .read(true)
            .write(writable)
            .truncate(writable && (flags & libc::O_TRUNC != 0))
            .append(writable && (flags & libc::O_APPEND != 0))
            .open(&rep.path)
            .map_err(|e| io_error_to_libc(&e))?;

        self.refresh_attr(&inode, &rep.path)?;

        let fh = self.alloc_fh();
        self.handles.write().insert(
            fh,
            Handle::File(FileHandle {
                branch: rep.branch,
                file: Arc::new(Mutex::new(file)),
                writable,
            }),
        );
        Ok(fh)
    }

    fn file_handle(&self, fh: u64) -> Result<(Branch, Arc<Mutex<File>>, bool), i32> {
        match self.handles.read().get(&fh) {
            Some(Handle::File(h)) => Ok((h.branch, h.file.clone(), h.writable)),
            _ => Err(libc::EBADF),
        }
    }

    pub fn do_read(&self, fh: u64, offset: i64, size: u32) -> Result<Vec<u8>, i32> {
        // Clone the file Arc so the handle table lock is not held across I/O.
        let (_, file_arc, _) = self.file_handle(fh)?;
        let mut file = file_arc.lock();

        READ_BUFFER.with(|buffer| {
            let mut buf = buffer.borrow_mut();
            let requested = size as usize;
            if buf.capacity() < requested {
                let add = requested - buf.capacity();
                buf.reserve(add);
            }
            buf.resize(requested, 0u8);

            std::io::Seek::seek(&mut *file, std::io::SeekFrom::Start(offset as u64))
                .map_err(|e| io_error_to_libc(&e))?;
            let n = std::io::Read::read(&mut *file, &mut buf[..])
                .map_err(|e| io_error_to_libc(&e))?;
            Ok(buf[..n].to_vec())
        })
    }

    pub fn do_write(&self, ino: u64, fh: u64, offset: i64, data: &[u8]) -> Result<u32, i32> {
        let (_, file_arc, writable) = self.file_handle(fh)?;
        if !writable {
            // the open was demoted to read-only (secondary branch object)
            return Err(libc::EROFS);
        }

        let n = {
            let mut file = file_arc.lock();
            std::io::Seek::seek(&mut *file, std::io::SeekFrom::Start(offset as u64))
                .map_err(|e| io_error_to_libc(&e))?;
            std::io::Write::write(&mut *file, data).map_err(|e| io_error_to_libc(&e))?
        };

        // update the size incrementally; flush refreshes from the branch
        if let Some(inode) = self.inodes.get(ino) {
            let mut attr = inode.attr.write();
            attr.size = std::cmp::max(attr.size, offset as u64 + n as u64);
        }
        Ok(n as u32)
    }

    pub fn do_flush(&self, ino: u64, fh: u64) -> Result<(), i32> {
        let (branch, _, _) = self.file_handle(fh)?;
        if let (Some(inode), Some(paths)) = (self.inodes.get(ino), self.entry_paths(ino)) {
            if let Some(r) = paths.get(branch).filter(|r| r.is_positive()) {
                let _ = self.refresh_attr(&inode, &r.path);
            }
        }
        Ok(())
    }

    pub fn do_fsync(&self, fh: u64, datasync: bool) -> Result<(), i32> {
        let (_, file_arc, _) = self.file_handle(fh)?;
        let file = file_arc.lock();
        let result = if datasync {
            file.sync_data()
        } else {
            file.sync_all()
        };
        result.map_err(|e| io_error_to_libc(&e))
    }

    pub fn do_release(&self, fh: u64) {
        self.handles.write().remove(&fh);
    }

    // ---- directories -----------------------------------------------------

    pub fn do_opendir(&self, ino: u64) -> Result<u64, i32> {
        let inode = self.inodes.get(ino).ok_or(libc::ENOENT)?;
        if inode.kind != ObjectKind::Directory {
            return Err(libc::ENOTDIR);
        }
        let fh = self.alloc_fh();
        self.handles.write().insert(fh, Handle::Dir(DirHandle::new()));
        Ok(fh)
    }

    /// Build the merged snapshot for an open directory: both branches in
    /// priority order, deduplicated and whiteout-filtered by the session
    /// accumulator.
    pub(crate) fn fill_dir_handle(&self, ino: u64, fh: u64) -> Result<(), i32> {
        let entry = self.entry(ino)?;
        let snapshot = entry.paths.snapshot();

        {
            let mut handles = self.handles.write();
            let Some(Handle::Dir(dir)) = handles.get_mut(&fh) else {
                return Err(libc::EBADF);
            };
            if dir.filled {
                return Ok(());
            }
            for branch in Branch::each() {
                if let Some(r) = snapshot[branch.index()].as_ref().filter(|r| r.is_positive()) {
                    merge_branch_listing(&mut dir.session, &r.path, branch, &mut dir.entries)?;
                }
            }
            dir.filled = true;
        }

        // enumeration refreshes the directory's atime
        if let Some(inode) = self.inodes.get(ino) {
            if let Some(rep) = entry.paths.first_positive() {
                if let Ok(meta) = fs::symlink_metadata(&rep.path) {
                    attrsync::copy_atime(&inode, &meta);
                }
            }
        }
        Ok(())
    }

    pub(crate) fn dir_entries(&self, fh: u64) -> Result<Vec<MergedDirEntry>, i32> {
        match self.handles.read().get(&fh) {
            Some(Handle::Dir(d)) => Ok(d.entries.clone()),
            _ => Err(libc::EBADF),
        }
    }

    /// One-shot merged listing of a directory (a full open/enumerate/release
    /// session).
    pub fn merged_listing(&self, ino: u64) -> Result<Vec<MergedDirEntry>, i32> {
        let fh = self.do_opendir(ino)?;
        let result = self
            .fill_dir_handle(ino, fh)
            .and_then(|()| self.dir_entries(fh));
        // the session accumulator is released however enumeration ended
        self.do_release(fh);
        result
    }

    // ---- symlinks --------------------------------------------------------

    /// Read a symlink target, preferring Primary, falling back to Secondary.
    pub fn do_readlink(&self, ino: u64) -> Result<PathBuf, i32> {
        let entry = self.entry(ino)?;
        let rep = entry.paths.first_positive().ok_or(libc::ENOENT)?;

        let target = fs::read_link(&rep.path).map_err(|e| io_error_to_libc(&e))?;

        if let Some(inode) = self.inodes.get(ino) {
            if let Ok(meta) = fs::symlink_metadata(&rep.path) {
                attrsync::copy_atime(&inode, &meta);
            }
        }
        Ok(target)
    }

    // ---- lifetime --------------------------------------------------------

    pub(crate) fn do_forget(&self, ino: u64, nlookup: u64) {
        if self.inodes.forget(ino, nlookup) {
            self.entries.write().remove(ino);
            self.object_locks.write().remove(&ino);
        }
    }
}
