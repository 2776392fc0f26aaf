//! Main entry point for the storepack CLI app.
//!
//! When the running executable carries a payload it acts as a self-extracting
//! bundle; otherwise it is the packer CLI.

use std::ffi::OsString;
use std::process::ExitCode;
use storepack::{cli_runner, selfextract};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    init_tracing();

    match self_extracting_executable() {
        Ok(Some(executable)) => {
            let args: Vec<OsString> = std::env::args_os().skip(1).collect();
            return match cli_runner::run_self_extraction(executable, &args) {
                Ok(code) => ExitCode::from((code & 0xff) as u8),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    ExitCode::FAILURE
                }
            };
        }
        Ok(None) => {}
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    }

    if let Err(e) = cli_runner::run_cli_app() {
        if let Some(clap_err) = e.downcast_ref::<clap::Error>() {
            // help and version land here too
            let _ = clap_err.print();
            return if clap_err.use_stderr() { ExitCode::from(2) } else { ExitCode::SUCCESS };
        }
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn self_extracting_executable() -> Result<Option<std::path::PathBuf>, Box<dyn std::error::Error>> {
    let executable = std::env::current_exe()?;
    if selfextract::is_self_extracting(&executable)? {
        Ok(Some(executable))
    } else {
        Ok(None)
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
