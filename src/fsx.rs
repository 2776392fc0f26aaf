//! Filesystem wrapper.
//!
//! Re-exports std::fs and adds the handful of helpers the packer needs around
//! symlinks and permission bits, so the rest of the crate imports `crate::fsx`
//! instead of touching `std::fs` directly.

use std::io;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::Path;

pub use std::fs::*;

/// Mode used for every directory created during extraction.
pub const DIR_MODE: u32 = 0o755;

/// Mode used when `create` has to make a brand-new destination file.
pub const NEW_FILE_MODE: u32 = 0o644;

/// Set POSIX permission bits.
pub fn set_unix_permissions(path: &Path, mode: u32) -> io::Result<()> {
    std::fs::set_permissions(path, Permissions::from_mode(mode))
}

/// Permission bits of an entry, without the file type.
pub fn unix_mode(meta: &Metadata) -> u32 {
    meta.permissions().mode() & 0o7777
}

pub fn symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

/// Like `create_dir_all`, but every missing component gets `DIR_MODE`.
pub fn create_dir_all_with_mode(path: &Path) -> io::Result<()> {
    DirBuilder::new().recursive(true).mode(DIR_MODE).create(path)
}

/// Remove a directory tree, treating an already-missing tree as success.
pub fn remove_dir_all_if_exists(path: &Path) -> io::Result<()> {
    match remove_dir_all(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// True when something (including a dangling symlink) exists at `path`.
pub fn entry_exists(path: &Path) -> io::Result<bool> {
    match symlink_metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// True when `path` itself is a symlink. Missing paths answer `false`.
pub fn is_symlink(path: &Path) -> io::Result<bool> {
    match symlink_metadata(path) {
        Ok(meta) => Ok(meta.file_type().is_symlink()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
