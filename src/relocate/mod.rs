//! # Store Path Relocation
//!
//! Rewrites embedded store-prefix references inside an extracted tree so that
//! `/nix/store/<package>` points at an alias of identical byte length. Both
//! prefixes must have the same length: occurrences can sit at fixed offsets in
//! binaries, and any shift would corrupt what follows them.
//!
//! File contents are rewritten with a single multi-pattern pass built from the
//! tree's top-level package names. Symlink targets that start with the old prefix
//! are recreated with the new one. Work is spread over a bounded worker pool and
//! stops at the first failure.

use crate::error::{IoContext, PackError};
use crate::fsx as fs;
use crate::progress::RunContext;
use crate::workers;
use aho_corasick::{AhoCorasick, MatchKind};
use std::ffi::OsStr;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tempfile::NamedTempFile;
use tracing::debug;
use walkdir::WalkDir;

/// Exact-match replacer for a fixed set of equal-length prefix pairs.
pub struct StorePathReplacer {
    matcher: AhoCorasick,
    replacements: Vec<Vec<u8>>,
}

impl StorePathReplacer {
    /// Builds the replacer. Overlapping patterns resolve to the longest match.
    pub fn new(pairs: &[(Vec<u8>, Vec<u8>)]) -> Result<Self, PackError> {
        let matcher = AhoCorasick::builder()
            .match_kind(MatchKind::LeftmostLongest)
            .build(pairs.iter().map(|(old, _)| old))?;
        let replacements = pairs.iter().map(|(_, new)| new.clone()).collect();
        Ok(Self { matcher, replacements })
    }

    /// Returns the rewritten bytes, or `None` when nothing matched.
    pub fn replace(&self, haystack: &[u8]) -> Option<Vec<u8>> {
        if !self.matcher.is_match(haystack) {
            return None;
        }
        Some(self.matcher.replace_all_bytes(haystack, &self.replacements))
    }
}

/// Pairs `old/<name>` with `new/<name>` for every top-level entry of `tree`.
///
/// The strings are concatenated byte for byte, never normalized, so separator
/// padding in `new` survives.
pub fn package_pairs(tree: &Path, old: &str, new: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>, PackError> {
    let mut pairs = Vec::new();
    for entry in fs::read_dir(tree).at(tree)? {
        let entry = entry.at(tree)?;
        let name = entry.file_name();
        let join = |prefix: &str| {
            let mut bytes = Vec::with_capacity(prefix.len() + 1 + name.len());
            bytes.extend_from_slice(prefix.as_bytes());
            bytes.push(b'/');
            bytes.extend_from_slice(name.as_bytes());
            bytes
        };
        pairs.push((join(old), join(new)));
    }
    Ok(pairs)
}

/// What a relocation pass touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelocationReport {
    pub files_rewritten: u64,
    pub symlinks_rewritten: u64,
    /// Non-directory entries processed.
    pub entries_visited: u64,
}

/// Configured relocation from one prefix to another of equal length.
#[derive(Debug, Clone)]
pub struct Relocator {
    old: String,
    new: String,
    workers: usize,
}

impl Relocator {
    pub fn new(old: impl Into<String>, new: impl Into<String>) -> Result<Self, PackError> {
        let (old, new) = (old.into(), new.into());
        if old.len() != new.len() {
            return Err(PackError::PrefixLengthMismatch { old, new });
        }
        Ok(Self {
            old,
            new,
            workers: workers::default_worker_count(),
        })
    }

    /// Overrides the worker count.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Relocates every regular file and symlink below `tree`.
    pub fn run(&self, tree: &Path, ctx: &mut RunContext<'_>) -> Result<RelocationReport, PackError> {
        self.run_with(tree, ctx, |entry, replacer| rewrite_entry(entry, replacer, &self.old, &self.new))
    }

    /// Like [`Relocator::run`], with `rewrite` applied to each non-directory entry.
    fn run_with<F>(&self, tree: &Path, ctx: &mut RunContext<'_>, rewrite: F) -> Result<RelocationReport, PackError>
    where
        F: Fn(&walkdir::DirEntry, &StorePathReplacer) -> Result<Rewritten, PackError> + Sync,
    {
        let total = match ctx.entry_count {
            Some(total) => total,
            None => {
                ctx.progress.begin(None, "Calculating archive size");
                let total = count_non_directories(tree)?;
                ctx.entry_count = Some(total);
                total
            }
        };

        let replacer = StorePathReplacer::new(&package_pairs(tree, &self.old, &self.new)?)?;
        let progress = ctx.progress;
        progress.begin(Some(total), "Rewriting store paths");

        let files = AtomicU64::new(0);
        let symlinks = AtomicU64::new(0);
        let visited = AtomicU64::new(0);

        let jobs = WalkDir::new(tree).into_iter().filter_map(|entry| match entry {
            Err(e) => Some(Err(PackError::from(e))),
            Ok(e) if e.file_type().is_dir() => None,
            Ok(e) => Some(Ok(e)),
        });

        let result = workers::run_bounded(jobs, self.workers, |entry: walkdir::DirEntry| {
            match rewrite(&entry, &replacer)? {
                Rewritten::Contents => files.fetch_add(1, Ordering::Relaxed),
                Rewritten::Target => symlinks.fetch_add(1, Ordering::Relaxed),
                Rewritten::Nothing => 0,
            };
            visited.fetch_add(1, Ordering::Relaxed);
            progress.advance(1);
            Ok(())
        });
        progress.end();
        result?;

        let report = RelocationReport {
            files_rewritten: files.into_inner(),
            symlinks_rewritten: symlinks.into_inner(),
            entries_visited: visited.into_inner(),
        };
        debug!(tree = %tree.display(), old = %self.old, new = %self.new, ?report, "relocation finished");
        Ok(report)
    }
}

/// What happened to one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rewritten {
    Contents,
    Target,
    Nothing,
}

fn rewrite_entry(
    entry: &walkdir::DirEntry,
    replacer: &StorePathReplacer,
    old: &str,
    new: &str,
) -> Result<Rewritten, PackError> {
    let file_type = entry.file_type();
    if file_type.is_file() && rewrite_file(entry.path(), replacer)? {
        return Ok(Rewritten::Contents);
    }
    if file_type.is_symlink() && rewrite_symlink(entry.path(), old, new)? {
        return Ok(Rewritten::Target);
    }
    Ok(Rewritten::Nothing)
}

/// Shorthand for `Relocator::new(old, new)?.run(tree, ctx)`.
pub fn relocate(tree: &Path, old: &str, new: &str, ctx: &mut RunContext<'_>) -> Result<RelocationReport, PackError> {
    Relocator::new(old, new)?.run(tree, ctx)
}

fn count_non_directories(tree: &Path) -> Result<u64, PackError> {
    let mut count = 0;
    for entry in WalkDir::new(tree) {
        if !entry?.file_type().is_dir() {
            count += 1;
        }
    }
    Ok(count)
}

/// Rewrites one file in place. The new contents land through a temporary file
/// in the same directory and a rename, so readers see old or new, never a mix.
fn rewrite_file(path: &Path, replacer: &StorePathReplacer) -> Result<bool, PackError> {
    let contents = fs::read(path).at(path)?;
    let Some(rewritten) = replacer.replace(&contents) else {
        return Ok(false);
    };

    let permissions = fs::metadata(path).at(path)?.permissions();
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(parent).at(parent)?;
    tmp.write_all(&rewritten).at(path)?;
    tmp.as_file().set_permissions(permissions).at(path)?;
    tmp.persist(path).map_err(|e| PackError::io(e.error, path))?;
    Ok(true)
}

fn rewrite_symlink(path: &Path, old: &str, new: &str) -> Result<bool, PackError> {
    let target = fs::read_link(path).at(path)?;
    let target = target.as_os_str().as_bytes();
    if !target.starts_with(old.as_bytes()) {
        return Ok(false);
    }

    let mut rewritten = Vec::with_capacity(target.len());
    rewritten.extend_from_slice(new.as_bytes());
    rewritten.extend_from_slice(&target[old.len()..]);

    fs::remove_file(path).at(path)?;
    fs::symlink(Path::new(OsStr::from_bytes(&rewritten)), path).at(path)?;
    Ok(true)
}
