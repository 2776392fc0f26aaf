//! Removable-media detection, used only to pick the cache root.

use std::path::{Path, PathBuf};
use sysinfo::Disks;

pub trait RemovableMedia {
    /// True when `executable` lives on a removable disk.
    fn is_executable_on_removable_media(&self, executable: &Path) -> bool;
}

/// Asks the OS for mounted disks via `sysinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SysinfoMedia;

impl RemovableMedia for SysinfoMedia {
    fn is_executable_on_removable_media(&self, executable: &Path) -> bool {
        let disks = Disks::new_with_refreshed_list();
        let mounts: Vec<(PathBuf, bool)> = disks
            .list()
            .iter()
            .map(|disk| (disk.mount_point().to_path_buf(), disk.is_removable()))
            .collect();
        owning_mount_is_removable(executable, &mounts)
    }
}

/// Fixed answer, for tests and callers that already know.
#[derive(Debug, Clone, Copy)]
pub struct FixedMedia(pub bool);

impl RemovableMedia for FixedMedia {
    fn is_executable_on_removable_media(&self, _executable: &Path) -> bool {
        self.0
    }
}

/// The longest mount point containing `path` decides.
fn owning_mount_is_removable(path: &Path, mounts: &[(PathBuf, bool)]) -> bool {
    mounts
        .iter()
        .filter(|(mount, _)| path.starts_with(mount))
        .max_by_key(|(mount, _)| mount.components().count())
        .map_or(false, |(_, removable)| *removable)
}
