use std::fs::{self, File};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use crate::error::{DuofsError, Result};
use crate::union::types::Branch;
use crate::union::UnionFs;

/// One validated branch root. The open directory handle pins the backing
/// mount for the union's lifetime and is released when the superblock is
/// dropped at unmount.
#[derive(Debug)]
pub struct BranchRoot {
    root: PathBuf,
    dev: u64,
    _pin: File,
}

/// The merged superblock: both branch roots plus a human-readable device
/// description. Built at mount time, dropped at unmount.
#[derive(Debug)]
pub struct SuperBlock {
    branches: [BranchRoot; Branch::COUNT],
    dev_name: String,
}

impl SuperBlock {
    /// Bind two branch roots together.
    ///
    /// Each branch must exist, be a directory, and not already be a duofs
    /// mount (stacking on self is rejected); the two roots must not overlap
    /// (neither may be an ancestor of the other). Nothing is constructed if
    /// validation fails.
    pub fn assemble(primary: &Path, secondary: &Path) -> Result<SuperBlock> {
        let primary = check_branch(primary)?;
        let secondary = check_branch(secondary)?;

        if is_branch_overlap(&primary, &secondary) {
            return Err(DuofsError::InvalidOperation(format!(
                "branch directories overlap: {} and {}",
                primary.display(),
                secondary.display()
            )));
        }

        let dev_name = format!("{}:{}", primary.display(), secondary.display());
        Ok(SuperBlock {
            branches: [pin_branch(primary)?, pin_branch(secondary)?],
            dev_name,
        })
    }

    pub fn root(&self, branch: Branch) -> &Path {
        &self.branches[branch.index()].root
    }

    pub fn dev(&self, branch: Branch) -> u64 {
        self.branches[branch.index()].dev
    }

    pub fn dev_name(&self) -> &str {
        &self.dev_name
    }
}

fn pin_branch(root: PathBuf) -> Result<BranchRoot> {
    let pin = File::open(&root)?;
    let dev = pin.metadata()?.dev();
    Ok(BranchRoot { root, dev, _pin: pin })
}

/// Make sure the branch we were pointed at makes sense:
/// 1) it exists, 2) it is a directory, 3) we're not stacking duofs on duofs.
fn check_branch(path: &Path) -> Result<PathBuf> {
    let canonical = path
        .canonicalize()
        .map_err(|_| DuofsError::NotFound(path.to_path_buf()))?;

    let meta = fs::metadata(&canonical).map_err(|_| DuofsError::NotFound(path.to_path_buf()))?;
    if !meta.is_dir() {
        return Err(DuofsError::NotADirectory(path.to_path_buf()));
    }

    for mount in duofs_mount_points() {
        if canonical.starts_with(&mount) {
            return Err(DuofsError::InvalidOperation(format!(
                "branch {} is inside the duofs mount {}",
                canonical.display(),
                mount.display()
            )));
        }
    }

    Ok(canonical)
}

/// Whether either path is an ancestor of the other (or they are equal).
fn is_branch_overlap(a: &Path, b: &Path) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

/// Mount points of active duofs instances, scraped from the mount table.
pub fn duofs_mount_points() -> Vec<PathBuf> {
    let output = match std::process::Command::new("mount").output() {
        Ok(o) => o,
        Err(e) => {
            tracing::warn!("Failed to run mount command: {}", e);
            return Vec::new();
        }
    };

    let text = String::from_utf8_lossy(&output.stdout);
    let mount_regex = regex::Regex::new(r"(?m)^\S+ on (\S+) (?:type fuse\.duofs |\(.*duofs.*\))")
        .expect("static regex");

    text.lines()
        .filter_map(|line| mount_regex.captures(line))
        .filter_map(|caps| caps.get(1))
        .map(|m| PathBuf::from(m.as_str()))
        .collect()
}

/// Options for the FUSE mount, resolved from config plus CLI flags.
#[derive(Debug, Clone, Default)]
pub struct MountOptions {
    pub allow_other: bool,
    pub auto_unmount: bool,
}

/// Mount the union filesystem in a background thread and wait until the
/// mount point is live (or the mount fails).
pub fn mount_fuse(fs: UnionFs, mount_point: &Path, opts: &MountOptions) -> Result<()> {
    let mut mount_options = vec![
        fuser::MountOption::FSName("duofs".to_string()),
        fuser::MountOption::Subtype("duofs".to_string()),
        // permission checks run in the kernel against lower-derived attrs
        fuser::MountOption::DefaultPermissions,
    ];
    if opts.allow_other {
        mount_options.push(fuser::MountOption::AllowOther);
    }
    if opts.auto_unmount {
        mount_options.push(fuser::MountOption::AutoUnmount);
    }

    let mount_point_clone = mount_point.to_path_buf();

    // Channel to communicate mount status from the spawned thread back to the
    // main thread, so we don't return Ok(...) if the mount actually failed.
    let (mount_status_tx, mount_status_rx) =
        std::sync::mpsc::channel::<std::result::Result<(), String>>();

    std::thread::spawn(move || {
        tracing::info!("Mounting duofs at {}", mount_point_clone.display());

        match fuser::mount2(fs, &mount_point_clone, &mount_options) {
            Ok(_) => {
                tracing::info!("duofs unmounted");
            }
            Err(e) => {
                tracing::error!("FUSE mount error: {}", e);
                let _ = mount_status_tx.send(Err(e.to_string()));
            }
        }
    });

    // Wait for either mount failure (signaled via channel) or the mount
    // point becoming accessible.
    let mount_timeout = std::time::Duration::from_millis(2000);
    let check_interval = std::time::Duration::from_millis(50);
    let start = std::time::Instant::now();

    loop {
        match mount_status_rx.try_recv() {
            Ok(Err(e)) => {
                return Err(DuofsError::Fuse(format!("FUSE mount failed: {}", e)));
            }
            Ok(Ok(())) => break,
            Err(std::sync::mpsc::TryRecvError::Disconnected)
            | Err(std::sync::mpsc::TryRecvError::Empty) => {}
        }

        if mount_point.is_dir() && fs::read_dir(mount_point).is_ok() {
            tracing::debug!("FUSE mount verified accessible");
            break;
        }

        if start.elapsed() >= mount_timeout {
            return Err(DuofsError::Fuse(
                "FUSE mount timed out - mount point not accessible after 2 seconds".to_string(),
            ));
        }

        std::thread::sleep(check_interval);
    }

    Ok(())
}

/// Unmount a duofs filesystem at the given path.
///
/// Returns Ok(true) if unmount succeeded, Ok(false) if it may already be
/// unmounted.
pub fn unmount_fuse(mount_path: &Path) -> Result<bool> {
    let unmount_result = if cfg!(target_os = "macos") {
        std::process::Command::new("diskutil")
            .args(["unmount", "force"])
            .arg(mount_path)
            .status()
    } else {
        std::process::Command::new("umount").arg(mount_path).status()
    };

    match unmount_result {
        Ok(status) => Ok(status.success()),
        Err(e) => {
            tracing::warn!("Failed to run unmount command: {}", e);
            Ok(false)
        }
    }
}

/// Clean up duofs mounts left behind by crashed processes.
///
/// Called by `duofs cleanup --stale`; logs what it does and never fails.
/// Users can skip it with the DUOFS_NO_CLEANUP=1 env var.
pub fn cleanup_stale_mounts() {
    if std::env::var("DUOFS_NO_CLEANUP").is_ok() {
        tracing::debug!("Skipping stale mount cleanup (DUOFS_NO_CLEANUP=1)");
        return;
    }

    let stale = duofs_mount_points();
    if stale.is_empty() {
        tracing::debug!("No stale duofs mounts found");
        return;
    }

    tracing::info!("Found {} duofs mount(s)", stale.len());
    for mount_path in &stale {
        tracing::info!("Attempting to unmount: {}", mount_path.display());
        match unmount_fuse(mount_path) {
            Ok(true) => tracing::info!("Successfully unmounted: {}", mount_path.display()),
            Ok(false) => tracing::warn!("Failed to unmount: {}", mount_path.display()),
            Err(e) => tracing::warn!("Failed to unmount {}: {}", mount_path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assemble_valid_branches() {
        let primary = tempfile::tempdir().unwrap();
        let secondary = tempfile::tempdir().unwrap();

        let sb = SuperBlock::assemble(primary.path(), secondary.path()).unwrap();
        assert_eq!(sb.root(Branch::Primary), primary.path().canonicalize().unwrap());
        assert_ne!(sb.dev(Branch::Primary), 0);
        assert!(sb.dev_name().contains(':'));
    }

    #[test]
    fn test_assemble_rejects_missing_branch() {
        let primary = tempfile::tempdir().unwrap();
        let missing = primary.path().join("does-not-exist");

        let err = SuperBlock::assemble(&missing, primary.path()).unwrap_err();
        assert!(matches!(err, DuofsError::NotFound(_)));
    }

    #[test]
    fn test_assemble_rejects_file_branch() {
        let primary = tempfile::tempdir().unwrap();
        let secondary = tempfile::tempdir().unwrap();
        let file = primary.path().join("plain");
        fs::write(&file, b"x").unwrap();

        let err = SuperBlock::assemble(&file, secondary.path()).unwrap_err();
        assert!(matches!(err, DuofsError::NotADirectory(_)));
    }

    #[test]
    fn test_assemble_rejects_overlap() {
        let primary = tempfile::tempdir().unwrap();
        let nested = primary.path().join("sub");
        fs::create_dir(&nested).unwrap();

        let err = SuperBlock::assemble(primary.path(), &nested).unwrap_err();
        assert!(matches!(err, DuofsError::InvalidOperation(_)));

        // symmetric: secondary as ancestor of primary
        let err = SuperBlock::assemble(&nested, primary.path()).unwrap_err();
        assert!(matches!(err, DuofsError::InvalidOperation(_)));
    }

    #[test]
    fn test_overlap_predicate() {
        assert!(is_branch_overlap(Path::new("/a/b"), Path::new("/a/b/c")));
        assert!(is_branch_overlap(Path::new("/a/b/c"), Path::new("/a/b")));
        assert!(is_branch_overlap(Path::new("/a"), Path::new("/a")));
        assert!(!is_branch_overlap(Path::new("/a/b"), Path::new("/a/c")));
    }
}
