//! # Payload Archive Format
//!
//! The payload appended to a self-extracting executable is a standard tar stream
//! wrapped in a single zstd frame, preceded by the [sentinel](crate::sentinel).
//! This module writes that payload ([`ArchiveWriter`], [`create_archive`]) and
//! reads it back entry by entry ([`list_entries`], [`list`]). Extraction to disk
//! lives in [`crate::extract`].
//!
//! Only three entry kinds exist: regular files, directories and symlinks.
//! Symlinks are always archived as links, never dereferenced.

use crate::error::{IoContext, PackError};
use crate::fsx as fs;
use crate::sentinel;
use std::io::{self, BufReader, BufWriter, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// zstd level used when the caller does not pick one.
pub const DEFAULT_LEVEL: i32 = 19;

/// Kind of a payload entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

/// One record of the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Relative, normalized path. Never empty.
    pub name: PathBuf,
    pub kind: EntryKind,
    /// Permission bits as stored in the archive.
    pub mode: u32,
    /// Content length; zero for anything but files.
    pub size: u64,
    /// Link target, for symlinks only.
    pub link_target: Option<PathBuf>,
}

/// Normalize a path into an archive name.
///
/// Root and `.` components are dropped and repeated separators collapse, so
/// `./bin//app` and `/bin/app` both become `bin/app`. `..` is rejected. An input
/// that normalizes to nothing (`.`) yields an empty path, which callers skip.
pub fn normalize_name(path: &Path) -> Result<PathBuf, PackError> {
    let mut name = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => name.push(part),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                return Err(PackError::InvalidEntryName { path: path.to_path_buf() })
            }
        }
    }
    Ok(name)
}

type PayloadEncoder = zstd::Encoder<'static, BufWriter<fs::File>>;

/// A writer that appends a payload to an existing (or new) file.
///
/// Bytes already in the destination are left untouched, so the destination can be
/// a copy of the packer executable itself.
pub struct ArchiveWriter {
    builder: tar::Builder<PayloadEncoder>,
    destination: PathBuf,
    entries: u64,
}

impl ArchiveWriter {
    /// Opens `destination` for appending and writes the sentinel.
    ///
    /// # Arguments
    /// * `destination` - File to append to; created with mode 0644 if missing.
    /// * `level` - zstd compression level for the tar stream.
    pub fn open(destination: &Path, level: i32) -> Result<Self, PackError> {
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .mode(fs::NEW_FILE_MODE)
            .open(destination)
            .at(destination)?;

        let mut writer = BufWriter::with_capacity(1 << 20, file);
        writer.write_all(&sentinel::sentinel()).at(destination)?;

        let mut encoder = zstd::Encoder::new(writer, level).at(destination)?;
        let zstd_threads = num_cpus::get().max(1) as u32;
        if zstd_threads > 1 {
            if let Err(e) = encoder.multithread(zstd_threads) {
                debug!(error = %e, "zstd multithreading unavailable, compressing on one thread");
            }
        }

        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);

        Ok(Self {
            builder,
            destination: destination.to_path_buf(),
            entries: 0,
        })
    }

    /// Archives `base/input`, naming entries relative to `base`.
    ///
    /// A symlink input becomes exactly one symlink entry. Anything else is walked
    /// recursively, parents before children.
    pub fn append_input_in(&mut self, base: &Path, input: &Path) -> Result<(), PackError> {
        let source = base.join(input);
        let meta = fs::symlink_metadata(&source).at(&source)?;
        if meta.file_type().is_symlink() {
            let name = entry_name(base, &source)?;
            if name.as_os_str().is_empty() {
                return Err(PackError::InvalidEntryName { path: input.to_path_buf() });
            }
            return self.append_symlink(&source, &name, &meta);
        }

        for entry in WalkDir::new(&source) {
            let entry = entry?;
            let name = entry_name(base, entry.path())?;
            if name.as_os_str().is_empty() {
                continue;
            }
            let meta = entry.metadata()?;
            let file_type = entry.file_type();

            if file_type.is_dir() {
                self.append_directory(&name, &meta)?;
            } else if file_type.is_symlink() {
                self.append_symlink(entry.path(), &name, &meta)?;
            } else if file_type.is_file() {
                self.append_file(entry.path(), &name, &meta)?;
            } else {
                return Err(PackError::UnsupportedEntryKind {
                    path: entry.path().to_path_buf(),
                    kind: describe_file_type(&file_type).to_string(),
                });
            }
        }
        Ok(())
    }

    fn append_directory(&mut self, name: &Path, meta: &fs::Metadata) -> Result<(), PackError> {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_mode(fs::unix_mode(meta));
        header.set_size(0);
        self.builder
            .append_data(&mut header, name, io::empty())
            .at(&self.destination)?;
        self.entries += 1;
        Ok(())
    }

    fn append_symlink(&mut self, path: &Path, name: &Path, meta: &fs::Metadata) -> Result<(), PackError> {
        let target = fs::read_link(path).at(path)?;
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_mode(fs::unix_mode(meta));
        header.set_size(0);
        self.builder
            .append_link(&mut header, name, &target)
            .at(&self.destination)?;
        self.entries += 1;
        Ok(())
    }

    fn append_file(&mut self, path: &Path, name: &Path, meta: &fs::Metadata) -> Result<(), PackError> {
        let file = fs::File::open(path).at(path)?;
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(fs::unix_mode(meta));
        header.set_size(meta.len());
        self.builder
            .append_data(&mut header, name, BufReader::new(file))
            .at(path)?;
        self.entries += 1;
        Ok(())
    }

    /// Writes the tar trailer, closes the zstd frame and flushes everything.
    ///
    /// Must be called to produce a valid payload. Returns the number of entries.
    pub fn finish(self) -> Result<u64, PackError> {
        let destination = self.destination;
        let encoder = self.builder.into_inner().at(&destination)?;
        let mut writer = encoder.finish().at(&destination)?;
        writer.flush().at(&destination)?;
        Ok(self.entries)
    }
}

fn entry_name(base: &Path, path: &Path) -> Result<PathBuf, PackError> {
    normalize_name(path.strip_prefix(base).unwrap_or(path))
}

fn describe_file_type(file_type: &fs::FileType) -> &'static str {
    use std::os::unix::fs::FileTypeExt;
    if file_type.is_fifo() {
        "fifo"
    } else if file_type.is_socket() {
        "socket"
    } else if file_type.is_block_device() {
        "block device"
    } else if file_type.is_char_device() {
        "character device"
    } else {
        "unknown"
    }
}

/// Appends a payload built from `inputs` to `destination`.
///
/// Returns the number of archived entries.
pub fn create_archive(destination: &Path, inputs: &[PathBuf], level: i32) -> Result<u64, PackError> {
    create_archive_in(destination, Path::new(""), inputs, level)
}

/// Like [`create_archive`], with `inputs` resolved against and named relative to `base`.
pub fn create_archive_in(destination: &Path, base: &Path, inputs: &[PathBuf], level: i32) -> Result<u64, PackError> {
    let mut writer = ArchiveWriter::open(destination, level)?;
    for input in inputs {
        writer.append_input_in(base, input)?;
    }
    let entries = writer.finish()?;
    debug!(destination = %destination.display(), entries, "payload written");
    Ok(entries)
}

pub(crate) type PayloadReader = tar::Archive<zstd::stream::read::Decoder<'static, BufReader<fs::File>>>;

pub(crate) fn corrupt(path: &Path) -> impl Fn(io::Error) -> PackError + '_ {
    move |source| PackError::CorruptArchive { source, path: path.to_path_buf() }
}

/// Opens the payload of `archive` as a tar stream.
pub(crate) fn open_payload(archive: &Path) -> Result<PayloadReader, PackError> {
    let file = sentinel::open_payload(archive)?;
    let decoder = zstd::stream::read::Decoder::new(file).map_err(corrupt(archive))?;
    Ok(tar::Archive::new(decoder))
}

impl ArchiveEntry {
    /// Decodes a tar entry. Returns `None` for the `.` entry.
    pub(crate) fn from_tar<R: io::Read>(entry: &tar::Entry<'_, R>, archive: &Path) -> Result<Option<Self>, PackError> {
        let raw_name = entry.path().map_err(corrupt(archive))?;
        let name = normalize_name(&raw_name)?;
        if name.as_os_str().is_empty() {
            return Ok(None);
        }

        let header = entry.header();
        let entry_type = header.entry_type();
        let kind = match entry_type {
            tar::EntryType::Regular | tar::EntryType::Continuous => EntryKind::File,
            tar::EntryType::Directory => EntryKind::Directory,
            tar::EntryType::Symlink => EntryKind::Symlink,
            other => {
                return Err(PackError::UnsupportedEntryKind {
                    path: name,
                    kind: format!("{:?}", other),
                })
            }
        };

        let mode = header.mode().map_err(corrupt(archive))?;
        let size = if kind == EntryKind::File { entry.size() } else { 0 };
        let link_target = if kind == EntryKind::Symlink {
            let target = entry.link_name().map_err(corrupt(archive))?;
            match target {
                Some(target) => Some(target.into_owned()),
                None => return Err(PackError::CorruptArchive {
                    source: io::Error::new(io::ErrorKind::InvalidData, "symlink entry without a target"),
                    path: archive.to_path_buf(),
                }),
            }
        } else {
            None
        };

        Ok(Some(Self { name, kind, mode, size, link_target }))
    }
}

/// Decodes every entry of the payload in stream order.
pub fn list_entries(archive: &Path) -> Result<Vec<ArchiveEntry>, PackError> {
    let mut payload = open_payload(archive)?;
    let mut entries = Vec::new();
    for entry in payload.entries().map_err(corrupt(archive))? {
        let entry = entry.map_err(corrupt(archive))?;
        if let Some(decoded) = ArchiveEntry::from_tar(&entry, archive)? {
            entries.push(decoded);
        }
    }
    Ok(entries)
}

/// Names of all entries in the payload, in stream order.
pub fn list(archive: &Path) -> Result<Vec<PathBuf>, PackError> {
    Ok(list_entries(archive)?.into_iter().map(|entry| entry.name).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::io::Read;
    use tempfile::tempdir;

    fn sample_tree(root: &Path) {
        fs::create_dir_all(root.join("bin")).unwrap();
        fs::create_dir_all(root.join("lib")).unwrap();
        fs::write(root.join("bin/app"), b"#!/bin/sh\necho app\n").unwrap();
        fs::write(root.join("lib/foo.so"), vec![0u8, 1, 2, 3]).unwrap();
        fs::symlink(Path::new("../lib/foo.so"), &root.join("bin/foo-link")).unwrap();
    }

    #[test]
    fn normalize_strips_dots_and_roots() {
        assert_eq!(normalize_name(Path::new("./bin//app")).unwrap(), PathBuf::from("bin/app"));
        assert_eq!(normalize_name(Path::new("/abs/path")).unwrap(), PathBuf::from("abs/path"));
        assert_eq!(normalize_name(Path::new(".")).unwrap(), PathBuf::new());
        assert!(matches!(
            normalize_name(Path::new("a/../b")),
            Err(PackError::InvalidEntryName { .. })
        ));
    }

    #[test]
    fn create_then_list_preserves_tree() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let src = dir.path().join("src");
        sample_tree(&src);
        let archive = dir.path().join("out.bin");

        let written = create_archive(&archive, &[src.clone()], 3)?;
        let entries = list_entries(&archive)?;
        assert_eq!(entries.len() as u64, written);

        let rel = |p: &str| normalize_name(&src.join(p)).unwrap();
        let names: BTreeSet<PathBuf> = entries.iter().map(|e| e.name.clone()).collect();
        for expected in ["bin", "bin/app", "bin/foo-link", "lib", "lib/foo.so"] {
            assert!(names.contains(&rel(expected)), "missing {expected}");
        }

        let link = entries.iter().find(|e| e.name == rel("bin/foo-link")).unwrap();
        assert_eq!(link.kind, EntryKind::Symlink);
        assert_eq!(link.link_target.as_deref(), Some(Path::new("../lib/foo.so")));

        let file = entries.iter().find(|e| e.name == rel("lib/foo.so")).unwrap();
        assert_eq!(file.kind, EntryKind::File);
        assert_eq!(file.size, 4);

        // parents come before their children
        let pos = |name: &PathBuf| entries.iter().position(|e| &e.name == name).unwrap();
        assert!(pos(&rel("bin")) < pos(&rel("bin/app")));
        Ok(())
    }

    #[test]
    fn symlink_input_is_not_dereferenced() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let target_dir = dir.path().join("real");
        fs::create_dir_all(&target_dir)?;
        fs::write(target_dir.join("inside"), b"x")?;
        let link = dir.path().join("link");
        fs::symlink(&target_dir, &link)?;
        let archive = dir.path().join("out.bin");

        create_archive(&archive, &[link.clone()], 3)?;
        let entries = list_entries(&archive)?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, EntryKind::Symlink);
        assert_eq!(entries[0].link_target.as_deref(), Some(target_dir.as_path()));
        Ok(())
    }

    #[test]
    fn payload_is_appended_after_existing_bytes() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let src = dir.path().join("src");
        sample_tree(&src);
        let host = dir.path().join("host");
        let host_bytes = b"\x7fELF pretend executable".to_vec();
        fs::write(&host, &host_bytes)?;

        create_archive(&host, &[src], 3)?;

        let mut all = Vec::new();
        fs::File::open(&host)?.read_to_end(&mut all)?;
        assert_eq!(&all[..host_bytes.len()], &host_bytes[..]);
        assert_eq!(sentinel::locate(&host)?, Some(host_bytes.len() as u64));
        assert!(!list(&host)?.is_empty());
        Ok(())
    }

    #[test]
    fn inputs_relative_to_a_base_directory() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let src = dir.path().join("src");
        sample_tree(&src);
        let archive = dir.path().join("out.bin");

        create_archive_in(&archive, &src, &[PathBuf::from("bin"), PathBuf::from("./lib/foo.so")], 3)?;
        let names = list(&archive)?;
        assert_eq!(names.len(), 4);
        assert_eq!(names[0], PathBuf::from("bin"));
        assert_eq!(names[3], PathBuf::from("lib/foo.so"));
        let set: BTreeSet<PathBuf> = names.into_iter().collect();
        assert!(set.contains(Path::new("bin/app")));
        assert!(set.contains(Path::new("bin/foo-link")));
        Ok(())
    }

    #[test]
    fn file_without_sentinel_is_not_an_archive() {
        let dir = tempdir().unwrap();
        let plain = dir.path().join("plain");
        fs::write(&plain, b"no payload here").unwrap();
        assert!(matches!(list(&plain), Err(PackError::NotAnArchive { .. })));
    }

    #[test]
    fn garbage_after_sentinel_is_corrupt() {
        let dir = tempdir().unwrap();
        let bogus = dir.path().join("bogus");
        let mut bytes = sentinel::sentinel().to_vec();
        bytes.extend_from_slice(b"definitely not zstd");
        fs::write(&bogus, bytes).unwrap();
        assert!(matches!(list(&bogus), Err(PackError::CorruptArchive { .. })));
    }

    #[test]
    fn fifo_input_is_rejected() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(&src).unwrap();
        let fifo = src.join("pipe");
        let c_path = std::ffi::CString::new(fifo.as_os_str().as_encoded_bytes()).unwrap();
        assert_eq!(unsafe { libc::mkfifo(c_path.as_ptr(), 0o644) }, 0);

        let err = create_archive(&dir.path().join("out.bin"), &[src], 3).unwrap_err();
        assert!(matches!(err, PackError::UnsupportedEntryKind { ref kind, .. } if kind == "fifo"));
    }
}
