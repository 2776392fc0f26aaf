//! # Extraction Module
//!
//! Unpacks the payload of a self-extracting executable into a directory.
//! Extraction is always a clean replace: the destination is removed and
//! recreated first, and it is removed again if anything fails halfway.

use crate::archive::{self, ArchiveEntry, EntryKind};
use crate::error::{IoContext, PackError};
use crate::fsx as fs;
use crate::progress::RunContext;
use std::collections::HashSet;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Counts gathered while extracting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractReport {
    /// Every entry written, directories included.
    pub entries: u64,
    /// Files and symlinks only.
    pub non_directory_entries: u64,
}

fn refuse_current_dir(destination: &Path) -> Result<(), PackError> {
    let only_cur_dir = destination
        .components()
        .all(|c| matches!(c, Component::CurDir));
    if only_cur_dir {
        return Err(PackError::io(
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "refusing to clear the current directory; pass an explicit destination",
            ),
            destination,
        ));
    }
    Ok(())
}

/// Extracts every entry of `archive_path` into `destination`.
///
/// The entry count from a listing pass is stored in `ctx.entry_count` so a following
/// relocation does not walk the tree again.
pub fn extract_archive(
    archive_path: &Path,
    destination: &Path,
    ctx: &mut RunContext<'_>,
) -> Result<ExtractReport, PackError> {
    refuse_current_dir(destination)?;

    ctx.progress.begin(None, "Calculating archive size");
    let listed = archive::list_entries(archive_path)?;
    let total = listed.len() as u64;
    let non_directory = listed.iter().filter(|e| e.kind != EntryKind::Directory).count() as u64;
    ctx.entry_count = Some(non_directory);

    fs::remove_dir_all_if_exists(destination).at(destination)?;
    fs::create_dir_all_with_mode(destination).at(destination)?;

    // Remove the half-written tree if we bail out early.
    let guard = scopeguard::guard(destination.to_path_buf(), |dest| {
        if let Err(e) = fs::remove_dir_all_if_exists(&dest) {
            warn!(path = %dest.display(), error = %e, "failed to remove partial extraction");
        }
    });

    ctx.progress.begin(Some(total), "Extracting archive");
    let report = unpack_entries(archive_path, destination, ctx)?;
    ctx.progress.end();

    scopeguard::ScopeGuard::into_inner(guard);
    debug!(
        archive = %archive_path.display(),
        destination = %destination.display(),
        entries = report.entries,
        "extraction finished"
    );
    Ok(report)
}

fn unpack_entries(
    archive_path: &Path,
    destination: &Path,
    ctx: &RunContext<'_>,
) -> Result<ExtractReport, PackError> {
    let mut payload = archive::open_payload(archive_path)?;
    let mut report = ExtractReport::default();
    // names of symlinks written so far; nothing may be created through them
    let mut links: HashSet<PathBuf> = HashSet::new();

    for entry in payload.entries().map_err(archive::corrupt(archive_path))? {
        let mut entry = entry.map_err(archive::corrupt(archive_path))?;
        let Some(decoded) = ArchiveEntry::from_tar(&entry, archive_path)? else {
            continue;
        };
        if decoded.name.ancestors().any(|p| links.contains(p)) {
            return Err(PackError::EntryThroughSymlink { path: decoded.name });
        }
        let target = destination.join(&decoded.name);

        match decoded.kind {
            EntryKind::Directory => {
                fs::create_dir_all_with_mode(&target).at(&target)?;
            }
            EntryKind::File => {
                create_parent(&target)?;
                let file = fs::File::create(&target).at(&target)?;
                copy_entry(&mut entry, &mut BufWriter::new(file), archive_path, &target)?;
                fs::set_unix_permissions(&target, decoded.mode).at(&target)?;
                report.non_directory_entries += 1;
            }
            EntryKind::Symlink => {
                create_parent(&target)?;
                // link_target is always set for symlinks
                let link_target = decoded.link_target.as_deref().unwrap_or(Path::new(""));
                fs::symlink(link_target, &target).at(&target)?;
                links.insert(decoded.name);
                report.non_directory_entries += 1;
            }
        }

        report.entries += 1;
        ctx.progress.advance(1);
    }

    Ok(report)
}

/// Copies one entry's contents. Read failures are blamed on the payload, write
/// failures on `target`.
fn copy_entry<R: Read, W: Write>(
    entry: &mut R,
    writer: &mut W,
    archive_path: &Path,
    target: &Path,
) -> Result<u64, PackError> {
    let mut buf = vec![0u8; 64 * 1024];
    let mut copied = 0u64;
    loop {
        let n = match entry.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(archive::corrupt(archive_path)(e)),
        };
        writer.write_all(&buf[..n]).at(target)?;
        copied += n as u64;
    }
    writer.flush().at(target)?;
    Ok(copied)
}

fn create_parent(path: &Path) -> Result<(), PackError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all_with_mode(parent).at(parent)?;
    }
    Ok(())
}
