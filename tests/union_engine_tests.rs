//! Engine-level tests for the union core, driven over real temp directory
//! trees through the public `do_*` API. No privileged FUSE mount is needed.

use fuser::{FileType, FUSE_ROOT_ID};
use std::ffi::OsStr;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use tempfile::TempDir;

use duofs::union::types::Branch;
use duofs::union::AttrChanges;
use duofs::{SuperBlock, UnionFs};

struct Fixture {
    primary: TempDir,
    secondary: TempDir,
    fs: UnionFs,
}

fn fixture() -> Fixture {
    let primary = tempfile::tempdir().unwrap();
    let secondary = tempfile::tempdir().unwrap();
    let sb = SuperBlock::assemble(primary.path(), secondary.path()).unwrap();
    let fs = UnionFs::new(sb, 1).unwrap();
    Fixture {
        primary,
        secondary,
        fs,
    }
}

fn listing_names(fs: &UnionFs, ino: u64) -> Vec<String> {
    let mut names: Vec<String> = fs
        .merged_listing(ino)
        .unwrap()
        .iter()
        .map(|e| e.name.to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn test_readdir_dedup_across_branches() {
    let fx = fixture();
    fs::write(fx.primary.path().join("a"), "pa").unwrap();
    fs::write(fx.primary.path().join("b"), "pb-primary").unwrap();
    fs::write(fx.secondary.path().join("b"), "b").unwrap();
    fs::write(fx.secondary.path().join("c"), "sc").unwrap();

    assert_eq!(listing_names(&fx.fs, FUSE_ROOT_ID), ["a", "b", "c"]);

    // the duplicate reports Primary's metadata
    let entries = fx.fs.merged_listing(FUSE_ROOT_ID).unwrap();
    let b = entries.iter().find(|e| e.name == "b").unwrap();
    assert_eq!(b.branch, Branch::Primary);
    let primary_ino = fs::metadata(fx.primary.path().join("b")).unwrap().ino();
    assert_eq!(b.ino, primary_ino);

    let attr = fx.fs.do_lookup(FUSE_ROOT_ID, OsStr::new("b")).unwrap();
    assert_eq!(attr.size, "pb-primary".len() as u64);
}

#[test]
fn test_lookup_dedup_invariant() {
    let fx = fixture();
    fs::write(fx.primary.path().join("x"), "x").unwrap();

    let first = fx.fs.do_lookup(FUSE_ROOT_ID, OsStr::new("x")).unwrap();
    let second = fx.fs.do_lookup(FUSE_ROOT_ID, OsStr::new("x")).unwrap();
    assert_eq!(first.ino, second.ino);

    // a hard link is the same underlying object, so it resolves to the
    // same merged inode
    fs::hard_link(fx.primary.path().join("x"), fx.primary.path().join("y")).unwrap();
    let linked = fx.fs.do_lookup(FUSE_ROOT_ID, OsStr::new("y")).unwrap();
    assert_eq!(linked.ino, first.ino);
}

#[test]
fn test_whiteout_round_trip() {
    let fx = fixture();
    fs::write(fx.primary.path().join("X"), "primary").unwrap();
    fs::write(fx.secondary.path().join("X"), "secondary").unwrap();

    // delete: the Primary object goes away and a whiteout covers Secondary
    fx.fs.do_remove(FUSE_ROOT_ID, OsStr::new("X")).unwrap();
    assert!(!fx.primary.path().join("X").exists());
    assert!(fx.primary.path().join(".wh.X").exists());
    assert!(fx.secondary.path().join("X").exists());

    assert!(!listing_names(&fx.fs, FUSE_ROOT_ID).contains(&"X".to_string()));
    assert_eq!(
        fx.fs.do_lookup(FUSE_ROOT_ID, OsStr::new("X")).unwrap_err(),
        libc::ENOENT
    );

    // re-create: the whiteout is removed and X is visible from Primary again
    let (attr, fh) = fx.fs.do_create(FUSE_ROOT_ID, OsStr::new("X"), 0o644).unwrap();
    fx.fs.do_release(fh);
    assert!(!fx.primary.path().join(".wh.X").exists());
    assert!(fx.primary.path().join("X").exists());
    assert_eq!(attr.kind, FileType::RegularFile);
    assert!(listing_names(&fx.fs, FUSE_ROOT_ID).contains(&"X".to_string()));
}

#[test]
fn test_whiteout_shadowing() {
    let fx = fixture();
    fs::write(fx.secondary.path().join("d"), "hidden").unwrap();
    fs::File::create(fx.primary.path().join(".wh.d")).unwrap();

    assert!(!listing_names(&fx.fs, FUSE_ROOT_ID).contains(&"d".to_string()));
    assert_eq!(
        fx.fs.do_lookup(FUSE_ROOT_ID, OsStr::new("d")).unwrap_err(),
        libc::ENOENT
    );
}

#[test]
fn test_unlink_secondary_only_leaves_whiteout() {
    let fx = fixture();
    fs::write(fx.secondary.path().join("s"), "sec").unwrap();

    fx.fs.do_lookup(FUSE_ROOT_ID, OsStr::new("s")).unwrap();
    fx.fs.do_remove(FUSE_ROOT_ID, OsStr::new("s")).unwrap();

    // nothing to remove in Primary; Secondary keeps its object on disk
    assert!(fx.primary.path().join(".wh.s").exists());
    assert!(fx.secondary.path().join("s").exists());
    assert!(!listing_names(&fx.fs, FUSE_ROOT_ID).contains(&"s".to_string()));
}

#[test]
fn test_unlink_missing_is_enoent() {
    let fx = fixture();
    assert_eq!(
        fx.fs.do_remove(FUSE_ROOT_ID, OsStr::new("ghost")).unwrap_err(),
        libc::ENOENT
    );
}

#[test]
fn test_whiteout_in_subdirectory() {
    let fx = fixture();
    fs::create_dir(fx.primary.path().join("d")).unwrap();
    fs::create_dir(fx.secondary.path().join("d")).unwrap();
    fs::write(fx.secondary.path().join("d/f"), "x").unwrap();

    let d = fx.fs.do_lookup(FUSE_ROOT_ID, OsStr::new("d")).unwrap();
    fx.fs.do_lookup(d.ino, OsStr::new("f")).unwrap();
    fx.fs.do_remove(d.ino, OsStr::new("f")).unwrap();

    assert!(fx.primary.path().join("d/.wh.f").exists());
    assert!(fx.secondary.path().join("d/f").exists());
    assert!(!listing_names(&fx.fs, d.ino).contains(&"f".to_string()));
}

#[test]
fn test_rmdir_removes_primary_and_shadows_secondary() {
    let fx = fixture();
    fs::create_dir(fx.primary.path().join("dir")).unwrap();
    fs::create_dir(fx.secondary.path().join("dir")).unwrap();

    fx.fs.do_lookup(FUSE_ROOT_ID, OsStr::new("dir")).unwrap();
    fx.fs.do_remove(FUSE_ROOT_ID, OsStr::new("dir")).unwrap();

    assert!(!fx.primary.path().join("dir").exists());
    assert!(fx.primary.path().join(".wh.dir").exists());
    assert!(fx.secondary.path().join("dir").exists());
}

#[test]
fn test_rename_rejects_ancestor_cycles() {
    let fx = fixture();
    let dir = fx.fs.do_mkdir(FUSE_ROOT_ID, OsStr::new("dir"), 0o755).unwrap();
    let sub = fx.fs.do_mkdir(dir.ino, OsStr::new("sub"), 0o755).unwrap();

    // source must not become its own descendant
    assert_eq!(
        fx.fs
            .do_rename(FUSE_ROOT_ID, OsStr::new("dir"), sub.ino, OsStr::new("x"))
            .unwrap_err(),
        libc::EINVAL
    );
    // target must not be an ancestor of the source
    assert_eq!(
        fx.fs
            .do_rename(dir.ino, OsStr::new("sub"), FUSE_ROOT_ID, OsStr::new("dir"))
            .unwrap_err(),
        libc::ENOTEMPTY
    );

    // both objects are untouched on disk
    assert!(fx.primary.path().join("dir").is_dir());
    assert!(fx.primary.path().join("dir/sub").is_dir());
}

#[test]
fn test_rename_moves_primary_object() {
    let fx = fixture();
    let dir = fx.fs.do_mkdir(FUSE_ROOT_ID, OsStr::new("dst"), 0o755).unwrap();
    fs::write(fx.primary.path().join("f"), "move me").unwrap();
    fx.fs.do_lookup(FUSE_ROOT_ID, OsStr::new("f")).unwrap();

    fx.fs
        .do_rename(FUSE_ROOT_ID, OsStr::new("f"), dir.ino, OsStr::new("g"))
        .unwrap();

    assert!(!fx.primary.path().join("f").exists());
    assert_eq!(
        fs::read_to_string(fx.primary.path().join("dst/g")).unwrap(),
        "move me"
    );
    assert_eq!(
        fx.fs.do_lookup(FUSE_ROOT_ID, OsStr::new("f")).unwrap_err(),
        libc::ENOENT
    );
    fx.fs.do_lookup(dir.ino, OsStr::new("g")).unwrap();
}

#[test]
fn test_rename_requires_primary_source() {
    let fx = fixture();
    fs::write(fx.secondary.path().join("s"), "sec").unwrap();
    fx.fs.do_lookup(FUSE_ROOT_ID, OsStr::new("s")).unwrap();

    // a Secondary-only object has nothing to rename in Primary
    assert_eq!(
        fx.fs
            .do_rename(FUSE_ROOT_ID, OsStr::new("s"), FUSE_ROOT_ID, OsStr::new("t"))
            .unwrap_err(),
        libc::EPERM
    );
}

#[test]
fn test_link_shares_merged_inode() {
    let fx = fixture();
    let (attr, fh) = fx.fs.do_create(FUSE_ROOT_ID, OsStr::new("orig"), 0o644).unwrap();
    fx.fs.do_write(attr.ino, fh, 0, b"payload").unwrap();
    fx.fs.do_release(fh);

    let linked = fx
        .fs
        .do_link(attr.ino, FUSE_ROOT_ID, OsStr::new("alias"))
        .unwrap();

    assert_eq!(linked.ino, attr.ino);
    assert_eq!(linked.nlink, 2);
    assert!(fx.primary.path().join("alias").exists());

    let via_alias = fx.fs.do_lookup(FUSE_ROOT_ID, OsStr::new("alias")).unwrap();
    assert_eq!(via_alias.ino, attr.ino);
}

#[test]
fn test_open_suppresses_secondary_writes() {
    let fx = fixture();
    fs::write(fx.secondary.path().join("ro"), "secondary data").unwrap();
    let attr = fx.fs.do_lookup(FUSE_ROOT_ID, OsStr::new("ro")).unwrap();

    // write access is requested but the object only exists in Secondary:
    // the open succeeds with write flags suppressed
    let fh = fx.fs.do_open(attr.ino, libc::O_RDWR).unwrap();

    let data = fx.fs.do_read(fh, 0, 1024).unwrap();
    assert_eq!(data, b"secondary data");

    assert_eq!(
        fx.fs.do_write(attr.ino, fh, 0, b"nope").unwrap_err(),
        libc::EROFS
    );
    fx.fs.do_release(fh);

    assert_eq!(
        fs::read_to_string(fx.secondary.path().join("ro")).unwrap(),
        "secondary data"
    );
}

#[test]
fn test_create_write_read_cycle() {
    let fx = fixture();
    let (attr, fh) = fx.fs.do_create(FUSE_ROOT_ID, OsStr::new("f"), 0o600).unwrap();

    assert_eq!(fx.fs.do_write(attr.ino, fh, 0, b"hello ").unwrap(), 6);
    assert_eq!(fx.fs.do_write(attr.ino, fh, 6, b"world").unwrap(), 5);
    fx.fs.do_flush(attr.ino, fh).unwrap();

    assert_eq!(fx.fs.do_getattr(attr.ino).unwrap().size, 11);
    assert_eq!(fx.fs.do_read(fh, 0, 1024).unwrap(), b"hello world");
    fx.fs.do_release(fh);

    // the file landed in Primary
    assert_eq!(
        fs::read_to_string(fx.primary.path().join("f")).unwrap(),
        "hello world"
    );
}

#[test]
fn test_setattr_truncate_shrinks_merged_first() {
    let fx = fixture();
    fs::write(fx.primary.path().join("t"), "0123456789").unwrap();
    let attr = fx.fs.do_lookup(FUSE_ROOT_ID, OsStr::new("t")).unwrap();
    assert_eq!(attr.size, 10);

    let changes = AttrChanges {
        size: Some(4),
        ..Default::default()
    };
    let updated = fx.fs.do_setattr(attr.ino, &changes, attr.uid).unwrap();

    assert_eq!(updated.size, 4);
    assert_eq!(fs::metadata(fx.primary.path().join("t")).unwrap().len(), 4);
}

#[test]
fn test_setattr_chmod_requires_owner() {
    let fx = fixture();
    fs::write(fx.primary.path().join("m"), "x").unwrap();
    let attr = fx.fs.do_lookup(FUSE_ROOT_ID, OsStr::new("m")).unwrap();

    let changes = AttrChanges {
        mode: Some(0o600),
        ..Default::default()
    };
    // a non-owner, non-root uid is rejected against the cached attributes
    assert_eq!(
        fx.fs
            .do_setattr(attr.ino, &changes, attr.uid.wrapping_add(1))
            .unwrap_err(),
        libc::EPERM
    );

    let updated = fx.fs.do_setattr(attr.ino, &changes, attr.uid).unwrap();
    assert_eq!(updated.perm, 0o600);
}

#[test]
fn test_setattr_secondary_only_is_eperm() {
    let fx = fixture();
    fs::write(fx.secondary.path().join("s"), "x").unwrap();
    let attr = fx.fs.do_lookup(FUSE_ROOT_ID, OsStr::new("s")).unwrap();

    let changes = AttrChanges {
        size: Some(0),
        ..Default::default()
    };
    assert_eq!(
        fx.fs.do_setattr(attr.ino, &changes, attr.uid).unwrap_err(),
        libc::EPERM
    );
}

#[test]
fn test_symlink_and_readlink() {
    let fx = fixture();
    let attr = fx
        .fs
        .do_symlink(FUSE_ROOT_ID, OsStr::new("ln"), Path::new("target/elsewhere"))
        .unwrap();
    assert_eq!(attr.kind, FileType::Symlink);

    let target = fx.fs.do_readlink(attr.ino).unwrap();
    assert_eq!(target, Path::new("target/elsewhere"));

    // the link object lives in Primary
    let on_disk = fs::read_link(fx.primary.path().join("ln")).unwrap();
    assert_eq!(on_disk, Path::new("target/elsewhere"));
}

#[test]
fn test_readlink_falls_back_to_secondary() {
    let fx = fixture();
    std::os::unix::fs::symlink("sec-target", fx.secondary.path().join("ln")).unwrap();

    let attr = fx.fs.do_lookup(FUSE_ROOT_ID, OsStr::new("ln")).unwrap();
    assert_eq!(fx.fs.do_readlink(attr.ino).unwrap(), Path::new("sec-target"));
}

#[test]
fn test_mknod_fifo() {
    let fx = fixture();
    let mode = libc::S_IFIFO as u32 | 0o644;
    let attr = fx
        .fs
        .do_mknod(FUSE_ROOT_ID, OsStr::new("pipe"), mode, 0)
        .unwrap();
    assert_eq!(attr.kind, FileType::NamedPipe);
    assert!(fx.primary.path().join("pipe").exists());
}

#[test]
fn test_mkdir_merges_subdirectories() {
    let fx = fixture();
    fs::create_dir(fx.secondary.path().join("shared")).unwrap();
    fs::write(fx.secondary.path().join("shared/from_sec"), "s").unwrap();

    // creating the same name in Primary merges with the Secondary dir
    fs::create_dir(fx.primary.path().join("shared")).unwrap();
    fs::write(fx.primary.path().join("shared/from_pri"), "p").unwrap();

    let dir = fx.fs.do_lookup(FUSE_ROOT_ID, OsStr::new("shared")).unwrap();
    assert_eq!(listing_names(&fx.fs, dir.ino), ["from_pri", "from_sec"]);
}

#[test]
fn test_create_existing_is_eexist() {
    let fx = fixture();
    fs::write(fx.secondary.path().join("e"), "x").unwrap();
    assert_eq!(
        fx.fs
            .do_create(FUSE_ROOT_ID, OsStr::new("e"), 0o644)
            .unwrap_err(),
        libc::EEXIST
    );
}

#[test]
fn test_reserved_names_cannot_be_created() {
    let fx = fixture();
    assert_eq!(
        fx.fs
            .do_create(FUSE_ROOT_ID, OsStr::new(".wh.sneaky"), 0o644)
            .unwrap_err(),
        libc::EINVAL
    );
}

#[test]
fn test_branch_file_forwarding_interface() {
    let fx = fixture();
    fs::write(fx.primary.path().join("f"), "x").unwrap();
    let attr = fx.fs.do_lookup(FUSE_ROOT_ID, OsStr::new("f")).unwrap();
    let fh = fx.fs.do_open(attr.ino, libc::O_RDONLY).unwrap();

    // the forwarding layer gets the open Primary file, and nothing for the
    // branch that was not opened
    assert!(fx.fs.branch_file(fh, Branch::Primary).is_some());
    assert!(fx.fs.branch_file(fh, Branch::Secondary).is_none());
    fx.fs.do_release(fh);
    assert!(fx.fs.branch_file(fh, Branch::Primary).is_none());
}
