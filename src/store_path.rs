//! Store path aliases.
//!
//! An alias is a short path under a scratch directory, padded with extra `/` so
//! it has exactly the byte length of the canonical store prefix. The alias is a
//! symlink to the extracted tree, and the cache's `link-to-store` symlink points
//! at the alias so later runs reuse it.

use crate::cache::CacheLayout;
use crate::error::{IoContext, PackError};
use crate::fsx as fs;
use rand::Rng;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Random names probed before giving up.
pub const ALIAS_ATTEMPTS: usize = 1000;
/// Length of the random alias name.
pub const ALIAS_NAME_LEN: usize = 5;

/// Pads `alias` to the byte length of `canonical` by repeating its first `/`.
///
/// `/tmp/abc` padded against `/nix/store` becomes `///tmp/abc`.
pub fn pad_alias(alias: &str, canonical: &str) -> Result<String, PackError> {
    if alias.len() > canonical.len() {
        return Err(PackError::AliasTooLong {
            alias: alias.to_string(),
            limit: canonical.len(),
        });
    }
    let Some(slash) = alias.find('/') else {
        return Err(PackError::RelativeAlias { alias: alias.to_string() });
    };
    let extra = canonical.len() - alias.len();
    let mut padded = String::with_capacity(canonical.len());
    padded.push_str(&alias[..slash]);
    padded.push_str(&"/".repeat(extra + 1));
    padded.push_str(&alias[slash + 1..]);
    Ok(padded)
}

fn random_name<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..ALIAS_NAME_LEN)
        .map(|_| char::from(rng.gen_range(b'a'..=b'z')))
        .collect()
}

fn probe_free_path(
    scratch: &Path,
    attempts: usize,
    mut next_name: impl FnMut() -> String,
) -> Result<PathBuf, PackError> {
    for _ in 0..attempts {
        let candidate = scratch.join(next_name());
        // a dangling symlink counts as taken
        if !fs::entry_exists(&candidate).at(&candidate)? {
            return Ok(candidate);
        }
    }
    Err(PackError::StorePathExhausted { attempts })
}

/// Finds an unused `<scratch>/<5 lowercase letters>` path.
pub fn generate_alias<R: Rng + ?Sized>(scratch: &Path, rng: &mut R) -> Result<PathBuf, PackError> {
    probe_free_path(scratch, ALIAS_ATTEMPTS, || random_name(rng))
}

/// A pending relocation from `old` to `new`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixPair {
    pub old: String,
    pub new: String,
}

/// The alias in use for one cache record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePathAssignment {
    /// Padded alias, byte-length equal to the canonical prefix it replaces.
    pub alias: String,
    /// True when this run created the alias.
    pub is_new: bool,
    /// Relocation the tree still needs, if any.
    pub pending: Option<PrefixPair>,
}

fn into_string(path: PathBuf) -> Result<String, PackError> {
    path.into_os_string()
        .into_string()
        .map_err(|raw| PackError::NonUtf8Path { path: PathBuf::from(raw) })
}

/// Points `alias` at `contents`, recreating it if it drifted or went missing.
fn repair_alias(alias: &Path, contents: &Path) -> Result<(), PackError> {
    match fs::symlink_metadata(alias) {
        Ok(meta) if meta.file_type().is_symlink() => {
            let current = fs::read_link(alias).at(alias)?;
            if current != contents {
                warn!(
                    alias = %alias.display(),
                    was = %current.display(),
                    now = %contents.display(),
                    "store path alias drifted; repointing"
                );
                fs::remove_file(alias).at(alias)?;
                fs::symlink(contents, alias).at(alias)?;
            }
            Ok(())
        }
        Ok(_) => Err(PackError::AliasOccupied { path: alias.to_path_buf() }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(alias = %alias.display(), "store path alias missing; recreating");
            fs::symlink(contents, alias).at(alias)
        }
        Err(e) => Err(PackError::io(e, alias)),
    }
}

/// Reuses the alias recorded in `layout`, or creates a new one.
///
/// A reused alias only needs relocation after a fresh extraction: the new tree
/// still carries the canonical prefix. A new alias always does.
pub fn resolve_assignment<R: Rng + ?Sized>(
    layout: &CacheLayout,
    canonical: &str,
    scratch: &Path,
    new_extraction: bool,
    rng: &mut R,
) -> Result<StorePathAssignment, PackError> {
    let link = layout.link_to_store();
    let contents = layout.archive_contents();

    if fs::is_symlink(&link).at(&link)? {
        let alias_path = fs::read_link(&link).at(&link)?;
        repair_alias(&alias_path, &contents)?;
        let alias = into_string(alias_path)?;
        debug!(alias = %alias, new_extraction, "reusing store path alias");
        let pending = new_extraction.then(|| PrefixPair {
            old: canonical.to_string(),
            new: alias.clone(),
        });
        return Ok(StorePathAssignment { alias, is_new: false, pending });
    }
    if fs::entry_exists(&link).at(&link)? {
        return Err(PackError::AliasOccupied { path: link });
    }

    let raw = into_string(generate_alias(scratch, rng)?)?;
    // validate before anything touches the filesystem
    let alias = pad_alias(&raw, canonical)?;
    let alias_path = Path::new(&alias);
    fs::symlink(&contents, alias_path).at(alias_path)?;
    fs::symlink(alias_path, &link).at(&link)?;
    info!(alias = %alias, "created store path alias");

    Ok(StorePathAssignment {
        pending: Some(PrefixPair { old: canonical.to_string(), new: alias.clone() }),
        alias,
        is_new: true,
    })
}
