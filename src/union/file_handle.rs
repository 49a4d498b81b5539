use parking_lot::Mutex;
use std::cell::RefCell;
use std::fs::File;
use std::sync::Arc;

use crate::union::filldir::{MergeSession, MergedDirEntry};
use crate::union::types::Branch;

thread_local! {
    pub(crate) static READ_BUFFER: RefCell<Vec<u8>> = RefCell::new(Vec::with_capacity(128 * 1024));
}

/// Open state of a merged regular file: the one branch file actually opened.
///
/// `writable` is false either because the caller asked for read-only access
/// or because the open was demoted: opening a Secondary-only object with
/// write flags succeeds with the write flags suppressed (copy-up is
/// deferred, see DESIGN.md).
#[derive(Debug)]
pub(crate) struct FileHandle {
    pub branch: Branch,
    pub file: Arc<Mutex<File>>,
    pub writable: bool,
}

/// Open state of a merged directory: the enumeration session and its merged
/// snapshot, built on the first readdir and dropped on release.
#[derive(Debug)]
pub(crate) struct DirHandle {
    pub session: MergeSession,
    pub entries: Vec<MergedDirEntry>,
    pub filled: bool,
}

impl DirHandle {
    pub fn new() -> Self {
        DirHandle {
            session: MergeSession::new(),
            entries: Vec::new(),
            filled: false,
        }
    }
}

#[derive(Debug)]
pub(crate) enum Handle {
    File(FileHandle),
    Dir(DirHandle),
}
