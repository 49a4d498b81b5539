use fuser::FUSE_ROOT_ID;
use fxhash::hash64;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::fs::Metadata;
use std::num::NonZeroUsize;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::sync::Arc;

const DEFAULT_ENTRY_CACHE_CAPACITY: usize = 10000;

/// One of the two physical trees being merged. Primary has creation and
/// whiteout priority; the branch count is fixed at two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    Primary,
    Secondary,
}

impl Branch {
    pub const COUNT: usize = 2;

    /// Branches in priority order, Primary first.
    pub fn each() -> [Branch; 2] {
        [Branch::Primary, Branch::Secondary]
    }

    pub fn index(self) -> usize {
        match self {
            Branch::Primary => 0,
            Branch::Secondary => 1,
        }
    }
}

/// Identity of an object inside a branch filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LowerId {
    pub dev: u64,
    pub ino: u64,
}

impl LowerId {
    pub fn of(meta: &Metadata) -> Self {
        LowerId {
            dev: meta.dev(),
            ino: meta.ino(),
        }
    }
}

/// Reference to one object (or creation target) inside one branch.
///
/// `lower: None` is a negative reference: the name did not resolve to an
/// object at resolution time, but `path` remains valid as the target for a
/// follow-up create in that branch.
#[derive(Debug, Clone)]
pub struct BranchRef {
    pub branch: Branch,
    pub path: PathBuf,
    pub lower: Option<LowerId>,
}

impl BranchRef {
    pub fn is_positive(&self) -> bool {
        self.lower.is_some()
    }
}

/// Per merged-entry branch state: up to one reference per branch, guarded by
/// a lock so concurrent install/reset stay consistent. The lock is held only
/// for slot reads and writes, never across branch I/O.
#[derive(Debug, Default)]
pub struct PathPair {
    slots: Mutex<[Option<BranchRef>; Branch::COUNT]>,
}

impl PathPair {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, r: BranchRef) {
        let idx = r.branch.index();
        self.slots.lock()[idx] = Some(r);
    }

    pub fn get(&self, branch: Branch) -> Option<BranchRef> {
        self.slots.lock()[branch.index()].clone()
    }

    pub fn snapshot(&self) -> [Option<BranchRef>; Branch::COUNT] {
        self.slots.lock().clone()
    }

    /// Drop both references.
    pub fn reset(&self) {
        *self.slots.lock() = [None, None];
    }

    /// First positive reference scanning Primary then Secondary.
    pub fn first_positive(&self) -> Option<BranchRef> {
        let slots = self.slots.lock();
        slots
            .iter()
            .flatten()
            .find(|r| r.is_positive())
            .cloned()
    }
}

/// One cached namespace entry of the merged view.
#[derive(Debug, Clone)]
pub(crate) struct EntryData {
    pub ino: u64,
    pub parent: u64,
    pub name: OsString,
    pub paths: Arc<PathPair>,
}

#[derive(Debug)]
pub(crate) struct EntryTable {
    entries: LruCache<u64, EntryData>,
    children: HashMap<u64, HashMap<u64, u64>>,
}

impl EntryTable {
    pub fn new() -> Self {
        EntryTable {
            entries: LruCache::new(NonZeroUsize::new(DEFAULT_ENTRY_CACHE_CAPACITY).unwrap()),
            children: HashMap::new(),
        }
    }

    fn children_map(&self, parent: u64) -> Option<&HashMap<u64, u64>> {
        self.children.get(&parent)
    }

    fn children_map_mut(&mut self, parent: u64) -> &mut HashMap<u64, u64> {
        self.children.entry(parent).or_default()
    }

    pub fn insert(&mut self, entry: EntryData) {
        if entry.ino != FUSE_ROOT_ID {
            let name_hash = hash64(entry.name.as_bytes());
            self.children_map_mut(entry.parent)
                .insert(name_hash, entry.ino);
        }
        self.entries.put(entry.ino, entry);
    }

    pub fn peek(&self, ino: u64) -> Option<&EntryData> {
        self.entries.peek(&ino)
    }

    /// Look up a child entry by name within a parent directory.
    ///
    /// Uses 64-bit FxHash for name lookups; the children map is authoritative
    /// for (parent, name) -> ino mappings since hard links let one merged
    /// inode carry several names. Collisions are astronomically unlikely with
    /// 64-bit hashes scoped to one directory.
    pub fn lookup_child(&self, parent: u64, name: &OsStr) -> Option<u64> {
        let name_hash = hash64(name.as_bytes());
        self.children_map(parent)
            .and_then(|map| map.get(&name_hash).copied())
            .and_then(|ino| self.peek(ino).map(|_| ino))
    }

    pub fn add_child(&mut self, parent: u64, name: &OsStr, ino: u64) {
        let name_hash = hash64(name.as_bytes());
        self.children_map_mut(parent).insert(name_hash, ino);
    }

    pub fn remove_child(&mut self, parent: u64, name: &OsStr) {
        let name_hash = hash64(name.as_bytes());
        if let Some(map) = self.children.get_mut(&parent) {
            map.remove(&name_hash);
        }
    }

    pub fn remove(&mut self, ino: u64) {
        if let Some(entry) = self.entries.pop(&ino) {
            let name_hash = hash64(entry.name.as_bytes());
            if let Some(map) = self.children.get_mut(&entry.parent) {
                map.remove(&name_hash);
            }
        }
        self.children.remove(&ino);
    }

    /// Drop every cached entry below `ino`. Used after a directory rename,
    /// when descendant entries hold stale branch paths and must re-resolve.
    pub fn prune_subtree(&mut self, ino: u64) {
        let mut stack: Vec<u64> = self
            .children
            .get(&ino)
            .map(|m| m.values().copied().collect())
            .unwrap_or_default();
        self.children.remove(&ino);

        while let Some(child) = stack.pop() {
            if let Some(map) = self.children.remove(&child) {
                stack.extend(map.values().copied());
            }
            self.entries.pop(&child);
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ino: u64, parent: u64, name: &str) -> EntryData {
        EntryData {
            ino,
            parent,
            name: OsString::from(name),
            paths: Arc::new(PathPair::new()),
        }
    }

    #[test]
    fn test_branch_order_and_count() {
        assert_eq!(Branch::each(), [Branch::Primary, Branch::Secondary]);
        assert_eq!(Branch::Primary.index(), 0);
        assert_eq!(Branch::Secondary.index(), 1);
    }

    #[test]
    fn test_path_pair_install_and_first_positive() {
        let pair = PathPair::new();
        assert!(pair.first_positive().is_none());

        pair.install(BranchRef {
            branch: Branch::Secondary,
            path: PathBuf::from("/sec/a"),
            lower: Some(LowerId { dev: 2, ino: 20 }),
        });
        pair.install(BranchRef {
            branch: Branch::Primary,
            path: PathBuf::from("/pri/a"),
            lower: None,
        });

        // Primary slot is negative, so the secondary object is the first
        // positive one even though Primary is scanned first.
        let first = pair.first_positive().unwrap();
        assert_eq!(first.branch, Branch::Secondary);

        pair.install(BranchRef {
            branch: Branch::Primary,
            path: PathBuf::from("/pri/a"),
            lower: Some(LowerId { dev: 1, ino: 10 }),
        });
        let first = pair.first_positive().unwrap();
        assert_eq!(first.branch, Branch::Primary);

        pair.reset();
        assert!(pair.get(Branch::Primary).is_none());
        assert!(pair.get(Branch::Secondary).is_none());
    }

    #[test]
    fn test_entry_table_children() {
        let mut table = EntryTable::new();
        table.insert(entry(100, FUSE_ROOT_ID, "a"));
        table.insert(entry(101, FUSE_ROOT_ID, "b"));

        assert_eq!(table.lookup_child(FUSE_ROOT_ID, OsStr::new("a")), Some(100));
        assert_eq!(table.lookup_child(FUSE_ROOT_ID, OsStr::new("b")), Some(101));
        assert_eq!(table.lookup_child(FUSE_ROOT_ID, OsStr::new("c")), None);

        table.remove_child(FUSE_ROOT_ID, OsStr::new("a"));
        assert_eq!(table.lookup_child(FUSE_ROOT_ID, OsStr::new("a")), None);

        table.remove(101);
        assert_eq!(table.lookup_child(FUSE_ROOT_ID, OsStr::new("b")), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_entry_table_prune_subtree() {
        let mut table = EntryTable::new();
        table.insert(entry(10, FUSE_ROOT_ID, "dir"));
        table.insert(entry(11, 10, "sub"));
        table.insert(entry(12, 11, "leaf"));
        table.insert(entry(13, FUSE_ROOT_ID, "other"));

        table.prune_subtree(10);

        // The renamed directory itself stays; everything under it is gone.
        assert!(table.peek(10).is_some());
        assert!(table.peek(11).is_none());
        assert!(table.peek(12).is_none());
        assert!(table.peek(13).is_some());
        assert_eq!(table.lookup_child(10, OsStr::new("sub")), None);
    }
}
