use assert_cmd::prelude::*;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::tempdir;

const CACHE_DIR_ENV: &str = "NIX_ROOTLESS_BUNDLER_CACHE_DIR";

/// Removes the alias symlink the bundle left in the scratch directory.
struct AliasCleanup(Option<PathBuf>);

impl Drop for AliasCleanup {
    fn drop(&mut self) {
        if let Some(alias) = self.0.take() {
            let _ = fs::remove_file(alias);
        }
    }
}

fn build_bundle(work: &Path) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let src = work.join("src");
    fs::create_dir_all(src.join("hello-2.12/share"))?;
    fs::write(
        src.join("hello-2.12/share/config"),
        b"prefix=/nix/store/hello-2.12/share\n",
    )?;
    fs::write(src.join("entrypoint"), "#!/bin/sh\necho \"$@\"\nexit 3\n")?;
    fs::set_permissions(src.join("entrypoint"), fs::Permissions::from_mode(0o755))?;

    let bundle = work.join("bundle");
    fs::copy(assert_cmd::cargo::cargo_bin("storepack"), &bundle)?;

    Command::cargo_bin("storepack")?
        .arg("create")
        .arg(&bundle)
        .arg("-C")
        .arg(&src)
        .arg("entrypoint")
        .arg("hello-2.12")
        .arg("--level")
        .arg("3")
        .assert()
        .success();
    Ok(bundle)
}

#[test]
fn test_bundle_runs_entrypoint_and_relocates() -> Result<(), Box<dyn std::error::Error>> {
    let work = tempdir()?;
    let bundle = build_bundle(work.path())?;
    let cache_base = work.path().join("cache");
    let record = cache_base.join("nix-rootless-bundler").join("bundle");

    // 1. First run extracts, picks an alias and relocates
    Command::new(&bundle)
        .args(["hello", "world"])
        .env(CACHE_DIR_ENV, &cache_base)
        .env("NIX_ROOTLESS_BUNDLER_QUIET", "1")
        .env_remove("NIX_ROOTLESS_BUNDLER_DELETE_CACHE")
        .assert()
        .code(3)
        .stdout("hello world\n");

    let alias = fs::read_link(record.join("link-to-store"))?;
    let _cleanup = AliasCleanup(Some(alias.clone()));
    let alias = alias.to_str().ok_or("alias is not UTF-8")?.to_string();
    assert_eq!(alias.len(), "/nix/store".len());
    assert_eq!(fs::read_link(&alias)?, record.join("archive-contents"));

    let config = fs::read_to_string(record.join("archive-contents/hello-2.12/share/config"))?;
    assert_eq!(config, format!("prefix={alias}/hello-2.12/share\n"));
    assert_eq!(fs::read_to_string(record.join("checksum.txt"))?.len(), 64);

    // 2. Second run reuses the cache and deletes it afterwards on request
    Command::new(&bundle)
        .arg("again")
        .env(CACHE_DIR_ENV, &cache_base)
        .env("NIX_ROOTLESS_BUNDLER_QUIET", "1")
        .env("NIX_ROOTLESS_BUNDLER_DELETE_CACHE", "1")
        .assert()
        .code(3)
        .stdout("again\n");
    assert!(!record.exists());

    Ok(())
}
