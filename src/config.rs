//! Settings for a self-extracting run, resolved from the environment.

use crate::cache::CACHE_DIR_NAME;
use crate::error::{IoContext, PackError};
use crate::media::RemovableMedia;
use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Non-empty: no progress output.
pub const ENV_QUIET: &str = "NIX_ROOTLESS_BUNDLER_QUIET";
/// Non-empty: remove the cache record after the entrypoint exits.
pub const ENV_DELETE_CACHE: &str = "NIX_ROOTLESS_BUNDLER_DELETE_CACHE";
/// Overrides the directory the cache lives under.
pub const ENV_CACHE_DIR: &str = "NIX_ROOTLESS_BUNDLER_CACHE_DIR";

/// Prefix baked into every packaged store path.
pub const CANONICAL_STORE_PREFIX: &str = "/nix/store";
/// Where store path aliases are created.
pub const DEFAULT_SCRATCH_DIR: &str = "/tmp";
/// Program run from the root of the extracted tree.
pub const DEFAULT_ENTRYPOINT: &str = "entrypoint";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// `<base>/nix-rootless-bundler`; one record per executable lives below it.
    pub cache_root: PathBuf,
    pub scratch_dir: PathBuf,
    pub store_prefix: String,
    /// Relative to the extracted tree.
    pub entrypoint: PathBuf,
    pub quiet: bool,
    pub delete_cache: bool,
}

impl Settings {
    /// Settings with defaults and the given cache base directory.
    pub fn with_cache_base(base: &Path) -> Self {
        Self {
            cache_root: base.join(CACHE_DIR_NAME),
            scratch_dir: PathBuf::from(DEFAULT_SCRATCH_DIR),
            store_prefix: CANONICAL_STORE_PREFIX.to_string(),
            entrypoint: PathBuf::from(DEFAULT_ENTRYPOINT),
            quiet: false,
            delete_cache: false,
        }
    }

    /// Reads the process environment.
    pub fn from_env(executable: &Path, media: &dyn RemovableMedia) -> Result<Self, PackError> {
        Self::from_lookup(executable, media, |key| env::var_os(key))
    }

    /// Like [`Settings::from_env`], with an injectable variable lookup.
    pub fn from_lookup<F>(executable: &Path, media: &dyn RemovableMedia, lookup: F) -> Result<Self, PackError>
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.is_empty());

        let base = match non_empty(ENV_CACHE_DIR) {
            Some(dir) => absolutize(PathBuf::from(dir))?,
            None if media.is_executable_on_removable_media(executable) => executable
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(env::temp_dir),
            None => env::temp_dir(),
        };

        let mut settings = Self::with_cache_base(&base);
        settings.quiet = non_empty(ENV_QUIET).is_some();
        settings.delete_cache = non_empty(ENV_DELETE_CACHE).is_some();
        Ok(settings)
    }
}

fn absolutize(path: PathBuf) -> Result<PathBuf, PackError> {
    if path.is_absolute() {
        return Ok(path);
    }
    let cwd = env::current_dir().at(&path)?;
    Ok(cwd.join(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::FixedMedia;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<OsString> {
        let vars: HashMap<String, OsString> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), OsString::from(v)))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn defaults_use_temp_dir() {
        let settings = Settings::from_lookup(Path::new("/opt/bundle"), &FixedMedia(false), lookup(&[])).unwrap();
        assert_eq!(settings.cache_root, env::temp_dir().join("nix-rootless-bundler"));
        assert_eq!(settings.store_prefix, "/nix/store");
        assert_eq!(settings.scratch_dir, Path::new("/tmp"));
        assert_eq!(settings.entrypoint, Path::new("entrypoint"));
        assert!(!settings.quiet);
        assert!(!settings.delete_cache);
    }

    #[test]
    fn removable_media_caches_beside_the_executable() {
        let settings = Settings::from_lookup(Path::new("/media/usb/bundle"), &FixedMedia(true), lookup(&[])).unwrap();
        assert_eq!(settings.cache_root, Path::new("/media/usb/nix-rootless-bundler"));
    }

    #[test]
    fn environment_overrides() {
        let vars = lookup(&[
            (ENV_CACHE_DIR, "/srv/cache"),
            (ENV_QUIET, "1"),
            (ENV_DELETE_CACHE, "yes"),
        ]);
        let settings = Settings::from_lookup(Path::new("/media/usb/bundle"), &FixedMedia(true), vars).unwrap();
        assert_eq!(settings.cache_root, Path::new("/srv/cache/nix-rootless-bundler"));
        assert!(settings.quiet);
        assert!(settings.delete_cache);
    }

    #[test]
    fn empty_values_are_unset() {
        let vars = lookup(&[(ENV_QUIET, ""), (ENV_DELETE_CACHE, ""), (ENV_CACHE_DIR, "")]);
        let settings = Settings::from_lookup(Path::new("/opt/bundle"), &FixedMedia(false), vars).unwrap();
        assert!(!settings.quiet);
        assert!(!settings.delete_cache);
        assert_eq!(settings.cache_root, env::temp_dir().join("nix-rootless-bundler"));
    }

    #[test]
    fn relative_cache_dir_is_made_absolute() {
        let settings =
            Settings::from_lookup(Path::new("/opt/bundle"), &FixedMedia(false), lookup(&[(ENV_CACHE_DIR, "rel")]))
                .unwrap();
        assert!(settings.cache_root.is_absolute());
        assert!(settings.cache_root.ends_with("rel/nix-rootless-bundler"));
    }
}
