//! Per-executable extraction cache.
//!
//! ```text
//! <cache root>/<executable name>/
//!     archive-contents/   extracted tree
//!     checksum.txt        hex SHA-256 of the executable at last extraction
//!     link-to-store       symlink to the live store path alias
//! ```
//!
//! The checksum is the only staleness signal. Any byte change to the executable
//! forces a fresh extraction. It is recorded only once the tree is ready to run,
//! so an extraction or relocation that never finished is redone.

use crate::error::{IoContext, PackError};
use crate::extract::{self, ExtractReport};
use crate::fsx as fs;
use crate::progress::RunContext;
use sha2::{Digest, Sha256};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Directory appended to the cache root.
pub const CACHE_DIR_NAME: &str = "nix-rootless-bundler";
pub const ARCHIVE_CONTENTS: &str = "archive-contents";
pub const CHECKSUM_FILE: &str = "checksum.txt";
pub const LINK_TO_STORE: &str = "link-to-store";

/// Paths of one executable's cache record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLayout {
    dir: PathBuf,
}

impl CacheLayout {
    /// Layout for `executable` under `cache_root`, keyed by the executable's file name.
    pub fn for_executable(cache_root: &Path, executable: &Path) -> Result<Self, PackError> {
        let name = executable
            .file_name()
            .ok_or_else(|| PackError::InvalidEntryName { path: executable.to_path_buf() })?;
        Ok(Self { dir: cache_root.join(name) })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn archive_contents(&self) -> PathBuf {
        self.dir.join(ARCHIVE_CONTENTS)
    }

    pub fn checksum_file(&self) -> PathBuf {
        self.dir.join(CHECKSUM_FILE)
    }

    pub fn link_to_store(&self) -> PathBuf {
        self.dir.join(LINK_TO_STORE)
    }
}

/// Lowercase hex SHA-256 of a file, streamed.
pub fn file_checksum(path: &Path) -> Result<String, PackError> {
    let file = fs::File::open(path).at(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut BufReader::with_capacity(1 << 20, file), &mut hasher).at(path)?;
    Ok(format!("{:x}", hasher.finalize()))
}

fn recorded_checksum(path: &Path) -> Result<Option<String>, PackError> {
    match fs::read_to_string(path) {
        Ok(sum) => Ok(Some(sum)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(PackError::io(e, path)),
    }
}

/// Outcome of [`ensure_extracted`].
#[derive(Debug, Clone)]
pub struct CacheState {
    pub layout: CacheLayout,
    pub new_extraction: bool,
    /// Present when this call extracted the payload.
    pub extraction: Option<ExtractReport>,
    /// Hex SHA-256 of the executable.
    pub checksum: String,
}

impl CacheState {
    /// Records the checksum, marking the extracted tree as complete.
    pub fn commit(&self) -> Result<(), PackError> {
        let path = self.layout.checksum_file();
        fs::write(&path, self.checksum.as_bytes()).at(&path)
    }
}

/// Forgets the recorded checksum so the next run extracts again.
pub fn invalidate(layout: &CacheLayout) -> Result<(), PackError> {
    let path = layout.checksum_file();
    match fs::remove_file(&path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(PackError::io(e, path)),
        _ => Ok(()),
    }
}

/// Makes sure the cache holds an up-to-date extraction of `executable`.
///
/// A fresh extraction is not recorded; call [`CacheState::commit`] once the tree
/// is ready to run.
pub fn ensure_extracted(
    executable: &Path,
    cache_root: &Path,
    ctx: &mut RunContext<'_>,
) -> Result<CacheState, PackError> {
    let layout = CacheLayout::for_executable(cache_root, executable)?;
    fs::create_dir_all_with_mode(layout.dir()).at(layout.dir())?;

    ctx.progress.begin(None, "Checking cache");
    let expected = file_checksum(executable)?;
    let checksum_file = layout.checksum_file();
    let recorded = recorded_checksum(&checksum_file)?;

    if recorded.as_deref() == Some(expected.as_str()) {
        debug!(checksum = %expected, cache = %layout.dir().display(), "cache is current");
        ctx.progress.end();
        return Ok(CacheState {
            layout,
            new_extraction: false,
            extraction: None,
            checksum: expected,
        });
    }

    info!(
        cache = %layout.dir().display(),
        stale = recorded.is_some(),
        "extracting payload"
    );
    invalidate(&layout)?;
    let report = extract::extract_archive(executable, &layout.archive_contents(), ctx)?;

    Ok(CacheState {
        layout,
        new_extraction: true,
        extraction: Some(report),
        checksum: expected,
    })
}
