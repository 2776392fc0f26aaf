//! # Self-Extraction
//!
//! Runs a packaged executable: make sure the payload is extracted into the cache,
//! settle on a store path alias, relocate the tree if needed, then hand over to
//! the entrypoint and pass its exit code back.

use crate::cache::{self, CacheLayout};
use crate::config::Settings;
use crate::error::{IoContext, PackError};
use crate::fsx as fs;
use crate::progress::{ProgressSink, RunContext};
use crate::relocate::{RelocationReport, Relocator};
use crate::store_path::{self, StorePathAssignment};
use std::ffi::OsString;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use tracing::{debug, info};

/// Steps of one self-extracting run, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    CheckCache,
    ResolveStorePathAssignment,
    MaybeRelocate,
    Launch,
    Cleanup,
}

/// A tree ready to launch.
#[derive(Debug, Clone)]
pub struct PreparedTree {
    /// The extracted `archive-contents` directory.
    pub tree: PathBuf,
    pub layout: CacheLayout,
    pub new_extraction: bool,
    pub assignment: StorePathAssignment,
    /// Present when this run relocated the tree.
    pub relocation: Option<RelocationReport>,
}

pub struct SelfExtractor<'a> {
    settings: Settings,
    executable: PathBuf,
    progress: &'a dyn ProgressSink,
}

impl<'a> SelfExtractor<'a> {
    pub fn new(settings: Settings, executable: impl Into<PathBuf>, progress: &'a dyn ProgressSink) -> Self {
        Self {
            settings,
            executable: executable.into(),
            progress,
        }
    }

    /// Extracts (if stale), resolves the alias and relocates (if needed).
    ///
    /// The cache checksum is written last, so a run that dies before the tree is
    /// fully relocated leaves a record the next run extracts again.
    pub fn prepare(&self) -> Result<PreparedTree, PackError> {
        let cache_root = &self.settings.cache_root;
        fs::create_dir_all_with_mode(cache_root).at(cache_root)?;
        let mut ctx = RunContext::new(self.progress);

        info!(stage = ?Stage::CheckCache, executable = %self.executable.display());
        let state = cache::ensure_extracted(&self.executable, cache_root, &mut ctx)?;

        info!(stage = ?Stage::ResolveStorePathAssignment, new_extraction = state.new_extraction);
        let assignment = store_path::resolve_assignment(
            &state.layout,
            &self.settings.store_prefix,
            &self.settings.scratch_dir,
            state.new_extraction,
            &mut rand::thread_rng(),
        )?;

        let tree = state.layout.archive_contents();
        let relocation = match &assignment.pending {
            Some(pair) => {
                info!(stage = ?Stage::MaybeRelocate, old = %pair.old, new = %pair.new);
                cache::invalidate(&state.layout)?;
                let report = Relocator::new(pair.old.as_str(), pair.new.as_str())?.run(&tree, &mut ctx)?;
                Some(report)
            }
            None => {
                debug!(stage = ?Stage::MaybeRelocate, "tree already relocated");
                None
            }
        };
        ctx.progress.end();
        if state.new_extraction || relocation.is_some() {
            state.commit()?;
        }

        Ok(PreparedTree {
            tree,
            layout: state.layout,
            new_extraction: state.new_extraction,
            assignment,
            relocation,
        })
    }

    /// Runs the entrypoint with `args`, inheriting stdio. Returns its exit code.
    pub fn launch(&self, prepared: &PreparedTree, args: &[OsString]) -> Result<i32, PackError> {
        let entrypoint = prepared.tree.join(&self.settings.entrypoint);
        info!(stage = ?Stage::Launch, entrypoint = %entrypoint.display(), args = args.len());
        let status = Command::new(&entrypoint)
            .args(args)
            .status()
            .map_err(|source| PackError::Launch { source, path: entrypoint.clone() })?;
        Ok(exit_code(status))
    }

    /// Removes the cache record when deletion was requested.
    pub fn cleanup(&self, layout: &CacheLayout) -> Result<(), PackError> {
        if !self.settings.delete_cache {
            return Ok(());
        }
        info!(stage = ?Stage::Cleanup, cache = %layout.dir().display());
        fs::remove_dir_all_if_exists(layout.dir()).at(layout.dir())
    }

    /// The whole run. Cleanup happens whether or not the launch succeeded.
    pub fn run(&self, args: &[OsString]) -> Result<i32, PackError> {
        let prepared = self.prepare()?;
        let launched = self.launch(&prepared, args);
        let cleaned = self.cleanup(&prepared.layout);
        let code = launched?;
        cleaned?;
        Ok(code)
    }
}

/// Exit code of a finished child; a signal maps to `128 + signal`.
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}

/// True when `executable` carries an appended payload.
pub fn is_self_extracting(executable: &Path) -> Result<bool, PackError> {
    crate::sentinel::has_sentinel(executable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::create_archive_in;
    use crate::progress::{NoProgress, ProgressTracker};
    use tempfile::tempdir;

    /// Long enough that an alias under any tempdir fits once padded.
    fn canonical() -> String {
        format!("/{}", "n".repeat(160))
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        executable: PathBuf,
        settings: Settings,
        args_file: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let src = root.join("src");
        let prefix = canonical();
        let args_file = root.join("args.txt");

        fs::create_dir_all(src.join("bin")).unwrap();
        fs::create_dir_all(src.join("lib")).unwrap();
        fs::write(src.join("bin/app"), format!("#!{prefix}/lib/sh\n")).unwrap();
        fs::write(src.join("lib/foo.so"), format!("\0\0{prefix}/bin/app\0\x01").into_bytes()).unwrap();
        let script = format!(
            "#!/bin/sh\nprintf '%s\\n' \"$@\" > '{}'\nexit 3\n",
            args_file.display()
        );
        fs::write(src.join("entrypoint"), script).unwrap();
        fs::set_unix_permissions(&src.join("entrypoint"), 0o755).unwrap();

        let executable = root.join("out");
        fs::write(&executable, b"host executable bytes").unwrap();
        let inputs = ["bin/app", "lib/foo.so", "entrypoint"].map(PathBuf::from);
        create_archive_in(&executable, &src, &inputs, 3).unwrap();

        let scratch = root.join("scratch");
        fs::create_dir_all(&scratch).unwrap();
        let mut settings = Settings::with_cache_base(&root.join("cache-base"));
        settings.store_prefix = prefix;
        settings.scratch_dir = scratch;

        Fixture { _dir: dir, root, executable, settings, args_file }
    }

    #[test]
    fn stale_checksum_extracts_relocates_and_launches() -> Result<(), Box<dyn std::error::Error>> {
        let fx = fixture();
        let layout = CacheLayout::for_executable(&fx.settings.cache_root, &fx.executable)?;
        fs::create_dir_all(layout.dir())?;
        fs::write(layout.checksum_file(), b"stale")?;

        let tracker = ProgressTracker::default();
        let extractor = SelfExtractor::new(fx.settings.clone(), &fx.executable, &tracker);
        let prepared = extractor.prepare()?;
        assert!(prepared.new_extraction);
        assert!(prepared.assignment.is_new);
        let report = prepared.relocation.expect("relocation ran");
        assert_eq!(report.files_rewritten, 2);

        let extracting = tracker.phases().iter().filter(|p| p.label == "Extracting archive").count();
        let rewriting = tracker.phases().iter().filter(|p| p.label == "Rewriting store paths").count();
        assert_eq!((extracting, rewriting), (1, 1));

        let foo = fs::read(prepared.tree.join("lib/foo.so"))?;
        let expected = format!("\0\0{}/bin/app\0\x01", prepared.assignment.alias).into_bytes();
        assert_eq!(foo, expected);

        let args = [OsString::from("one"), OsString::from("two words")];
        let code = extractor.launch(&prepared, &args)?;
        assert_eq!(code, 3);
        assert_eq!(fs::read_to_string(&fx.args_file)?, "one\ntwo words\n");
        Ok(())
    }

    #[test]
    fn second_run_reuses_everything() -> Result<(), Box<dyn std::error::Error>> {
        let fx = fixture();
        let extractor = SelfExtractor::new(fx.settings.clone(), &fx.executable, &NoProgress);
        let first = extractor.prepare()?;
        let second = extractor.prepare()?;

        assert!(!second.new_extraction);
        assert!(!second.assignment.is_new);
        assert_eq!(second.assignment.alias, first.assignment.alias);
        assert!(second.relocation.is_none());
        Ok(())
    }

    #[test]
    fn rebuilt_executable_keeps_its_alias() -> Result<(), Box<dyn std::error::Error>> {
        let fx = fixture();
        let extractor = SelfExtractor::new(fx.settings.clone(), &fx.executable, &NoProgress);
        let first = extractor.prepare()?;

        let mut bytes = fs::read(&fx.executable)?;
        bytes[0] = b'H';
        fs::write(&fx.executable, bytes)?;

        let second = extractor.prepare()?;
        assert!(second.new_extraction);
        assert!(!second.assignment.is_new);
        assert_eq!(second.assignment.alias, first.assignment.alias);
        assert_eq!(second.relocation.map(|r| r.files_rewritten), Some(2));
        Ok(())
    }

    #[test]
    fn interrupted_relocation_is_redone_on_the_next_run() -> Result<(), Box<dyn std::error::Error>> {
        let fx = fixture();

        // a run that stops after picking its alias, before any rewriting
        let mut ctx = RunContext::new(&NoProgress);
        let state = cache::ensure_extracted(&fx.executable, &fx.settings.cache_root, &mut ctx)?;
        let interrupted = store_path::resolve_assignment(
            &state.layout,
            &fx.settings.store_prefix,
            &fx.settings.scratch_dir,
            state.new_extraction,
            &mut rand::thread_rng(),
        )?;
        assert!(interrupted.pending.is_some());

        let extractor = SelfExtractor::new(fx.settings.clone(), &fx.executable, &NoProgress);
        let prepared = extractor.prepare()?;
        assert!(prepared.new_extraction);
        assert_eq!(prepared.assignment.alias, interrupted.alias);
        assert_eq!(prepared.relocation.map(|r| r.files_rewritten), Some(2));
        let foo = fs::read(prepared.tree.join("lib/foo.so"))?;
        let expected = format!("\0\0{}/bin/app\0\x01", interrupted.alias).into_bytes();
        assert_eq!(foo, expected);

        let settled = extractor.prepare()?;
        assert!(!settled.new_extraction);
        assert!(settled.relocation.is_none());
        Ok(())
    }

    #[test]
    fn delete_cache_removes_the_record_after_launch() -> Result<(), Box<dyn std::error::Error>> {
        let fx = fixture();
        let mut settings = fx.settings.clone();
        settings.delete_cache = true;
        let extractor = SelfExtractor::new(settings, &fx.executable, &NoProgress);

        let code = extractor.run(&[])?;
        assert_eq!(code, 3);
        let layout = CacheLayout::for_executable(&fx.settings.cache_root, &fx.executable)?;
        assert!(!layout.dir().exists());
        assert!(fx.root.join("scratch").exists());
        Ok(())
    }

    #[test]
    fn missing_entrypoint_is_a_launch_error() -> Result<(), Box<dyn std::error::Error>> {
        let fx = fixture();
        let mut settings = fx.settings.clone();
        settings.entrypoint = PathBuf::from("no-such-entrypoint");
        let extractor = SelfExtractor::new(settings, &fx.executable, &NoProgress);

        let err = extractor.run(&[]).unwrap_err();
        assert!(matches!(err, PackError::Launch { .. }));
        Ok(())
    }

    #[test]
    fn signal_exit_maps_to_128_plus_signal() {
        let status = Command::new("/bin/sh").args(["-c", "kill -TERM $$"]).status().unwrap();
        assert_eq!(exit_code(status), 128 + 15);
    }
}
