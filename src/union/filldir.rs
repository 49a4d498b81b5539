//! Directory merge engine.
//!
//! A single directory-enumeration session spans both branches in priority
//! order (Primary first). Every name seen is recorded in a fixed-size
//! hash-bucket accumulator so that later branches cannot re-emit a name the
//! session has already produced, and so that whiteout markers shadow their
//! target name for the rest of the session. The accumulator lives exactly as
//! long as the open-directory session.

use fuser::FileType;
use fxhash::hash64;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::DirEntryExt;
use std::path::Path;

use crate::union::convert::{io_error_to_libc, std_filetype_to_fuser};
use crate::union::types::Branch;
use crate::union::whiteout::Whiteout;

/// Bucket count for the readdir accumulator, sized for typical directories.
const FILLDIR_BUCKETS: usize = 50;

#[derive(Debug)]
struct FilldirNode {
    name: OsString,
    hash: u64,
    whiteout: bool,
}

/// Readdir accumulator for one open-directory session.
#[derive(Debug)]
pub(crate) struct MergeSession {
    buckets: Vec<Vec<FilldirNode>>,
}

impl MergeSession {
    pub fn new() -> Self {
        let mut buckets = Vec::with_capacity(FILLDIR_BUCKETS);
        buckets.resize_with(FILLDIR_BUCKETS, Vec::new);
        MergeSession { buckets }
    }

    fn find(&self, name: &OsStr) -> Option<&FilldirNode> {
        let hash = hash64(name.as_bytes());
        let bucket = &self.buckets[(hash % FILLDIR_BUCKETS as u64) as usize];
        // exact length first, then byte compare, to resolve bucket collisions
        bucket.iter().find(|n| {
            n.hash == hash
                && n.name.len() == name.len()
                && n.name.as_bytes() == name.as_bytes()
        })
    }

    fn add(&mut self, name: &OsStr, whiteout: bool) {
        let hash = hash64(name.as_bytes());
        let index = (hash % FILLDIR_BUCKETS as u64) as usize;
        self.buckets[index].push(FilldirNode {
            name: name.to_os_string(),
            hash,
            whiteout,
        });
    }
}

/// One entry of a merged directory listing, carrying the metadata of the
/// branch it was emitted from.
#[derive(Debug, Clone)]
pub struct MergedDirEntry {
    pub name: OsString,
    pub ino: u64,
    pub kind: FileType,
    pub branch: Branch,
}

/// Feed one branch directory into the session, appending newly visible
/// entries to `out`.
///
/// For each raw entry: a whiteout-form name records its stripped target as
/// shadowed (first occurrence wins) and is never emitted; a plain name is
/// emitted only if the session has not seen it yet, so Primary wins
/// duplicates and shadowed names stay hidden.
pub(crate) fn merge_branch_listing(
    session: &mut MergeSession,
    dir: &Path,
    branch: Branch,
    out: &mut Vec<MergedDirEntry>,
) -> Result<(), i32> {
    let read_dir = match fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(io_error_to_libc(&e)),
    };

    for entry in read_dir {
        let entry = entry.map_err(|e| io_error_to_libc(&e))?;
        let name = entry.file_name();

        if let Some(target) = Whiteout::strip_prefix(&name) {
            if session.find(&target).is_none() {
                session.add(&target, true);
            }
            continue;
        }

        if let Some(seen) = session.find(&name) {
            if seen.whiteout {
                tracing::trace!("readdir: {:?} is shadowed by a whiteout", name);
            }
            // otherwise a duplicate already emitted from an earlier branch
            continue;
        }

        let kind = match entry.file_type() {
            Ok(ft) => std_filetype_to_fuser(ft),
            Err(_) => continue,
        };

        session.add(&name, false);
        out.push(MergedDirEntry {
            name,
            ino: entry.ino(),
            kind,
            branch,
        });
    }

    Ok(())
}
