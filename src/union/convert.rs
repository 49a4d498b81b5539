use fuser::{FileAttr, FileType};
use libc::S_IFMT;
use std::fs::Metadata;
use std::io;
use std::os::unix::prelude::MetadataExt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Map std::io::Error to appropriate libc error code.
/// This provides more specific error codes than generic EIO for better debugging.
pub(crate) fn io_error_to_libc(e: &io::Error) -> i32 {
    // First, try to get the raw OS error code if available - this is the most accurate
    if let Some(code) = e.raw_os_error() {
        return code;
    }

    // Fall back to mapping stable ErrorKind variants
    match e.kind() {
        io::ErrorKind::NotFound => libc::ENOENT,
        io::ErrorKind::PermissionDenied => libc::EACCES,
        io::ErrorKind::AlreadyExists => libc::EEXIST,
        io::ErrorKind::InvalidInput => libc::EINVAL,
        io::ErrorKind::InvalidData => libc::EINVAL,
        io::ErrorKind::TimedOut => libc::ETIMEDOUT,
        io::ErrorKind::Interrupted => libc::EINTR,
        io::ErrorKind::WriteZero => libc::ENOSPC,
        io::ErrorKind::OutOfMemory => libc::ENOMEM,
        io::ErrorKind::BrokenPipe => libc::EPIPE,
        io::ErrorKind::WouldBlock => libc::EAGAIN,
        io::ErrorKind::UnexpectedEof => libc::EIO,
        io::ErrorKind::Unsupported => libc::ENOTSUP,
        _ => libc::EIO,
    }
}

pub(crate) fn metadata_to_filetype(meta: &Metadata) -> FileType {
    let file_type = meta.mode();
    match file_type & (S_IFMT as u32) {
        x if x == libc::S_IFREG as u32 => FileType::RegularFile,
        x if x == libc::S_IFDIR as u32 => FileType::Directory,
        x if x == libc::S_IFLNK as u32 => FileType::Symlink,
        x if x == libc::S_IFBLK as u32 => FileType::BlockDevice,
        x if x == libc::S_IFCHR as u32 => FileType::CharDevice,
        x if x == libc::S_IFIFO as u32 => FileType::NamedPipe,
        x if x == libc::S_IFSOCK as u32 => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

/// Convert std::fs::FileType to fuser FileType.
/// More efficient than metadata_to_filetype() when called on
/// DirEntry::file_type() because it avoids a full stat on most filesystems.
pub(crate) fn std_filetype_to_fuser(ft: std::fs::FileType) -> FileType {
    if ft.is_file() {
        FileType::RegularFile
    } else if ft.is_dir() {
        FileType::Directory
    } else if ft.is_symlink() {
        FileType::Symlink
    } else {
        // Block/char devices, pipes and sockets need a full stat; callers
        // that care fall back to metadata.
        FileType::RegularFile
    }
}

fn timespec(sec: i64, nsec: i64) -> SystemTime {
    if sec >= 0 {
        UNIX_EPOCH + Duration::new(sec as u64, nsec as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs((-sec) as u64)
    }
}

/// Timestamps are carried at nanosecond granularity since either branch may
/// require that precision.
pub(crate) fn metadata_to_fileattr(meta: &Metadata, ino: u64) -> FileAttr {
    let kind = metadata_to_filetype(meta);

    FileAttr {
        ino,
        size: meta.len(),
        blocks: meta.blocks(),
        atime: timespec(meta.atime(), meta.atime_nsec()),
        mtime: timespec(meta.mtime(), meta.mtime_nsec()),
        ctime: timespec(meta.ctime(), meta.ctime_nsec()),
        crtime: SystemTime::UNIX_EPOCH,
        kind,
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        blksize: meta.blksize() as u32,
        flags: 0,
    }
}
