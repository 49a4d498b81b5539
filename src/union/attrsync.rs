//! Attribute-sync collaborator.
//!
//! The union core never computes merged attributes itself; after every
//! resolution or mutation that changes merged-visible metadata it asks this
//! service to propagate attributes from a branch object to the merged inode.

use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::union::convert::metadata_to_fileattr;
use crate::union::inode::MergedInode;

fn timespec(sec: i64, nsec: i64) -> SystemTime {
    if sec >= 0 {
        UNIX_EPOCH + Duration::new(sec as u64, nsec as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs((-sec) as u64)
    }
}

/// Replace every cached attribute of `dst` from the branch metadata `src`,
/// keeping the merged inode number.
pub(crate) fn copy_all_attributes(dst: &MergedInode, src: &Metadata) {
    let mut attr = dst.attr.write();
    *attr = metadata_to_fileattr(src, dst.ino);
}

pub(crate) fn copy_size(dst: &MergedInode, src: &Metadata) {
    dst.attr.write().size = src.len();
}

pub(crate) fn copy_atime(dst: &MergedInode, src: &Metadata) {
    dst.attr.write().atime = timespec(src.atime(), src.atime_nsec());
}

/// Propagate a/m/ctime, e.g. onto a parent directory after a create.
pub(crate) fn copy_times(dst: &MergedInode, src: &Metadata) {
    let mut attr = dst.attr.write();
    attr.atime = timespec(src.atime(), src.atime_nsec());
    attr.mtime = timespec(src.mtime(), src.mtime_nsec());
    attr.ctime = timespec(src.ctime(), src.ctime_nsec());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::union::types::LowerId;
    use std::fs;

    #[test]
    fn test_copy_size_and_all() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"12345").unwrap();
        let meta = fs::metadata(&path).unwrap();

        let inode = MergedInode::for_tests(77, LowerId::of(&meta), &meta);
        assert_eq!(inode.attr.read().size, 5);

        fs::write(&path, b"123456789").unwrap();
        let meta = fs::metadata(&path).unwrap();
        copy_size(&inode, &meta);
        assert_eq!(inode.attr.read().size, 9);

        copy_all_attributes(&inode, &meta);
        assert_eq!(inode.attr.read().ino, 77, "merged ino must survive a full copy");
    }
}
