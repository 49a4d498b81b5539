//! The two-branch union filesystem.
//!
//! `UnionFs` merges a Primary and a Secondary directory tree into one
//! namespace. The FUSE callbacks below are thin adapters over the engine in
//! `helpers.rs`; resolution, identity caching, whiteouts and the directory
//! merge live in their own modules.

mod attrsync;
mod convert;
mod file_handle;
mod filldir;
mod helpers;
pub mod inode;
pub mod mount;
mod resolve;
pub mod types;
pub mod whiteout;

pub use filldir::MergedDirEntry;
pub use helpers::AttrChanges;
pub use mount::{cleanup_stale_mounts, mount_fuse, unmount_fuse, MountOptions, SuperBlock};

use fuser::{
    Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow, FUSE_ROOT_ID,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::error::Result;
use file_handle::Handle;
use inode::InodeCache;
use types::{Branch, BranchRef, EntryData, EntryTable, LowerId, PathPair};
use whiteout::WHITEOUT_PREFIX;

pub struct UnionFs {
    pub(crate) sb: SuperBlock,
    pub(crate) entries: Arc<RwLock<EntryTable>>,
    pub(crate) inodes: Arc<InodeCache>,
    pub(crate) handles: Arc<RwLock<HashMap<u64, Handle>>>,
    pub(crate) next_fh: Arc<Mutex<u64>>,
    pub(crate) object_locks: Arc<RwLock<HashMap<u64, Arc<Mutex<()>>>>>,
    /// Attribute and entry cache timeout handed to the kernel.
    ttl: Duration,
}

impl UnionFs {
    /// Bind an assembled superblock into a live union: interpose the root
    /// entry over both branch roots, Primary as representative.
    pub fn new(sb: SuperBlock, ttl_secs: u64) -> Result<Self> {
        let union = UnionFs {
            sb,
            entries: Arc::new(RwLock::new(EntryTable::new())),
            inodes: Arc::new(InodeCache::new()),
            handles: Arc::new(RwLock::new(HashMap::new())),
            next_fh: Arc::new(Mutex::new(1)),
            object_locks: Arc::new(RwLock::new(HashMap::new())),
            ttl: Duration::from_secs(ttl_secs),
        };

        let root_pair = PathPair::new();
        let primary_root = union.sb.root(Branch::Primary).to_path_buf();
        let secondary_root = union.sb.root(Branch::Secondary).to_path_buf();

        let primary_meta = std::fs::metadata(&primary_root)?;
        root_pair.install(BranchRef {
            branch: Branch::Primary,
            path: primary_root,
            lower: Some(LowerId::of(&primary_meta)),
        });
        let secondary_meta = std::fs::metadata(&secondary_root)?;
        root_pair.install(BranchRef {
            branch: Branch::Secondary,
            path: secondary_root,
            lower: Some(LowerId::of(&secondary_meta)),
        });

        union
            .inodes
            .intern_root(LowerId::of(&primary_meta), &primary_meta);
        union.entries.write().insert(EntryData {
            ino: FUSE_ROOT_ID,
            parent: FUSE_ROOT_ID,
            name: OsString::new(),
            paths: Arc::new(root_pair),
        });

        Ok(union)
    }

    pub fn superblock(&self) -> &SuperBlock {
        &self.sb
    }
}

fn time_or_now(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

impl Filesystem for UnionFs {
    fn init(
        &mut self,
        _req: &Request,
        _config: &mut KernelConfig,
    ) -> std::result::Result<(), libc::c_int> {
        tracing::info!("duofs mounted over {}", self.sb.dev_name());
        Ok(())
    }

    fn destroy(&mut self) {
        tracing::info!("duofs unmounting {}", self.sb.dev_name());
    }

    fn forget(&mut self, _req: &Request, ino: u64, nlookup: u64) {
        self.do_forget(ino, nlookup);
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        tracing::debug!("lookup(parent={}, name={:?})", parent, name);
        match self.do_lookup(parent, name) {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        tracing::trace!("getattr(ino={})", ino);
        match self.do_getattr(ino) {
            Ok(attr) => reply.attr(&self.ttl, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let changes = AttrChanges {
            mode,
            uid,
            gid,
            size,
            atime: atime.map(time_or_now),
            mtime: mtime.map(time_or_now),
        };
        match self.do_setattr(ino, &changes, req.uid()) {
            Ok(attr) => reply.attr(&self.ttl, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        match self.do_readlink(ino) {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(errno) => reply.error(errno),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        tracing::debug!("mknod(parent={}, name={:?}, mode={:#o})", parent, name, mode);
        match self.do_mknod(parent, name, mode, rdev) {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        tracing::debug!("mkdir(parent={}, name={:?})", parent, name);
        match self.do_mkdir(parent, name, mode) {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        tracing::debug!("unlink(parent={}, name={:?})", parent, name);
        match self.do_remove(parent, name) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        tracing::debug!("rmdir(parent={}, name={:?})", parent, name);
        match self.do_remove(parent, name) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        link: &Path,
        reply: ReplyEntry,
    ) {
        match self.do_symlink(parent, name, link) {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        tracing::debug!(
            "rename(parent={}, name={:?}, newparent={}, newname={:?})",
            parent,
            name,
            newparent,
            newname
        );
        match self.do_rename(parent, name, newparent, newname) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn link(
        &mut self,
        _req: &Request,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        match self.do_link(ino, newparent, newname) {
            Ok(attr) => reply.entry(&self.ttl, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        tracing::debug!("create(parent={}, name={:?}, mode={:#o})", parent, name, mode);
        match self.do_create(parent, name, mode) {
            Ok((attr, fh)) => reply.created(&self.ttl, &attr, 0, fh, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        tracing::debug!("open(ino={}, flags={:#x})", ino, flags);
        match self.do_open(ino, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        tracing::trace!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);
        match self.do_read(fh, offset, size) {
            Ok(data) => reply.data(&data),
            Err(errno) => reply.error(errno),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        tracing::trace!("write(ino={}, fh={}, offset={}, len={})", ino, fh, offset, data.len());
        match self.do_write(ino, fh, offset, data) {
            Ok(n) => reply.written(n),
            Err(errno) => reply.error(errno),
        }
    }

    fn flush(&mut self, _req: &Request, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.do_flush(ino, fh) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.do_release(fh);
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        match self.do_fsync(fh, datasync) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn opendir(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.do_opendir(ino) {
            Ok(fh) => reply.opened(fh, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        tracing::debug!("readdir(ino={}, fh={}, offset={})", ino, fh, offset);
        if let Err(errno) = self.fill_dir_handle(ino, fh) {
            reply.error(errno);
            return;
        }
        let entries = match self.dir_entries(fh) {
            Ok(entries) => entries,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        for (idx, entry) in entries.iter().enumerate().skip(offset as usize) {
            if reply.add(entry.ino, (idx + 1) as i64, entry.kind, &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        self.do_release(fh);
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        // the merged filesystem reports the Primary branch's limits; the
        // advertised name length leaves room for the whiteout prefix
        match nix::sys::statvfs::statvfs(self.sb.root(Branch::Primary)) {
            Ok(st) => reply.statfs(
                st.blocks() as u64,
                st.blocks_free() as u64,
                st.blocks_available() as u64,
                st.files() as u64,
                st.files_free() as u64,
                st.block_size() as u32,
                (st.name_max() as u32).saturating_sub(WHITEOUT_PREFIX.len() as u32),
                st.fragment_size() as u32,
            ),
            Err(e) => reply.error(e as i32),
        }
    }
}
