//! Runs the packer CLI and the self-extracting mode, and draws progress on a
//! terminal.

use crate::cli::{self, Commands};
use crate::config::Settings;
use crate::error::PackError;
use crate::media::SysinfoMedia;
use crate::progress::{NoProgress, ProgressSink, ProgressState, ProgressTracker, RunContext};
use crate::selfextract::SelfExtractor;
use crate::{archive, extract};
use std::ffi::OsString;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Public entry for running the packer CLI.
pub fn run_cli_app() -> Result<(), Box<dyn std::error::Error>> {
    let command = cli::run()?;

    match &command {
        Commands::Create { archive, inputs, directory, level } => {
            let base = directory.as_deref().unwrap_or(Path::new(""));
            archive::create_archive_in(archive, base, inputs, *level)?;
        }
        Commands::Extract { archive, destination } => {
            let progress = terminal_progress(quiet_from_env());
            let mut ctx = RunContext::new(progress.as_ref());
            extract::extract_archive(archive, destination, &mut ctx)?;
        }
        Commands::List { archive } => {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            for name in archive::list(archive)? {
                writeln!(out, "{}", name.display())?;
            }
        }
    }

    Ok(())
}

/// Runs `executable` as a self-extracting bundle, passing `args` to its entrypoint.
///
/// Returns the entrypoint's exit code.
pub fn run_self_extraction(executable: PathBuf, args: &[OsString]) -> Result<i32, PackError> {
    let settings = Settings::from_env(&executable, &SysinfoMedia)?;
    let progress = terminal_progress(settings.quiet);
    SelfExtractor::new(settings, executable, progress.as_ref()).run(args)
}

fn quiet_from_env() -> bool {
    std::env::var_os(crate::config::ENV_QUIET).map_or(false, |v| !v.is_empty())
}

/// A progress line on stderr, or nothing when quiet or not on a terminal.
pub fn terminal_progress(quiet: bool) -> Box<dyn ProgressSink> {
    if quiet || !io::stderr().is_terminal() {
        return Box::new(NoProgress);
    }
    Box::new(ProgressTracker::new(Duration::from_millis(100)).with_callback(create_cli_progress_callback()))
}

// --- utils for CLI progress -------------------------------------------------

fn create_cli_progress_callback() -> impl Fn(&ProgressState) + Send + Sync + 'static {
    let prev_len = Arc::new(Mutex::new(0usize));

    move |state: &ProgressState| {
        // Determine terminal width (default 80)
        let term_width = term_size::dimensions().map(|(w, _)| w).unwrap_or(80);
        let status_line = fit_status_line(state, term_width);

        let mut line_to_print = status_line;
        {
            let mut prev = prev_len.lock().unwrap_or_else(|p| p.into_inner());
            if *prev > line_to_print.len() {
                let diff = *prev - line_to_print.len();
                line_to_print.push_str(&" ".repeat(diff));
            }
            *prev = if state.finished { 0 } else { line_to_print.len() };
        }
        eprint!("\r\x1B[2K{}", line_to_print);
        if state.finished {
            eprintln!();
        }
        io::stderr().flush().ok();
    }
}

/// Builds a status line no wider than `term_width`, shrinking the bar first.
fn fit_status_line(state: &ProgressState, term_width: usize) -> String {
    let elapsed = state.elapsed.as_secs_f32();
    let build = |bar_width: usize| match state.percent() {
        Some(percent) => {
            let filled = ((percent / 100.0) * bar_width as f32) as usize;
            let empty = bar_width.saturating_sub(filled);
            format!(
                "{} [{}{}] {:.1}% | {}/{} | {:.1}s",
                state.label,
                "█".repeat(filled),
                "░".repeat(empty),
                percent,
                state.processed,
                state.total.unwrap_or_default(),
                elapsed,
            )
        }
        None => {
            const SPINNER: [char; 4] = ['|', '/', '-', '\\'];
            let frame = SPINNER[(state.elapsed.as_millis() / 100) as usize % SPINNER.len()];
            format!("{} {} | {:.1}s", state.label, frame, elapsed)
        }
    };

    let mut bar_width = 40usize;
    loop {
        let line = build(bar_width);
        if line.chars().count() <= term_width || bar_width <= 10 {
            return line;
        }
        bar_width -= 4;
    }
}
