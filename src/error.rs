use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DuofsError>;

#[derive(Error, Debug)]
pub enum DuofsError {
    #[error("Not found: {0}")]
    NotFound(PathBuf),

    #[error("Permission denied: {0}")]
    PermissionDenied(PathBuf),

    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("Directory not empty: {0}")]
    DirectoryNotEmpty(PathBuf),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Object crossed a branch mount boundary: {0}")]
    CrossBranchBoundary(String),

    #[error("Corrupted branch state: {0}")]
    Corrupted(String),

    #[error("Out of memory")]
    OutOfMemory,

    #[error("Branch is read-only: {0}")]
    ReadOnlyBranch(PathBuf),

    #[error("Config error: {0}")]
    Config(String),

    #[error("FUSE error: {0}")]
    Fuse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DuofsError {
    /// Errno equivalent for callers that speak the FUSE reply protocol.
    pub fn errno(&self) -> i32 {
        match self {
            DuofsError::NotFound(_) => libc::ENOENT,
            DuofsError::PermissionDenied(_) => libc::EACCES,
            DuofsError::NotADirectory(_) => libc::ENOTDIR,
            DuofsError::DirectoryNotEmpty(_) => libc::ENOTEMPTY,
            DuofsError::InvalidOperation(_) => libc::EINVAL,
            DuofsError::CrossBranchBoundary(_) => libc::EXDEV,
            DuofsError::Corrupted(_) => libc::EIO,
            DuofsError::OutOfMemory => libc::ENOMEM,
            DuofsError::ReadOnlyBranch(_) => libc::EROFS,
            DuofsError::Config(_) | DuofsError::Fuse(_) => libc::EINVAL,
            DuofsError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}
