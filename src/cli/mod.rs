use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Append a payload built from files and directories to an archive (usually a copy of this executable).
    #[command(alias = "c")]
    Create {
        /// The file to append the payload to. Existing bytes are kept.
        #[arg(required = true)]
        archive: PathBuf,

        /// One or more input files or directories. Symlinks are stored as links.
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Resolve inputs against this directory and name entries relative to it.
        #[arg(short = 'C', long)]
        directory: Option<PathBuf>,

        /// Zstandard compression level (1-22). Higher levels offer better compression at the cost of speed.
        #[arg(long, default_value_t = crate::archive::DEFAULT_LEVEL, value_parser = clap::value_parser!(i32).range(1..=22))]
        level: i32,
    },

    /// Extract the payload of an archive. The destination is cleared first.
    #[command(alias = "x")]
    Extract {
        /// The archive file to extract.
        #[arg(required = true)]
        archive: PathBuf,

        /// The directory to extract into.
        #[arg(default_value = ".")]
        destination: PathBuf,
    },

    /// List the entries of an archive without extracting it.
    #[command(alias = "l")]
    List {
        /// The archive file to list contents of.
        #[arg(required = true)]
        archive: PathBuf,
    },
}

/// Parses command-line arguments using `clap` and returns the command to execute.
pub fn run() -> Result<Commands, clap::Error> {
    let args = Args::try_parse()?;
    Ok(args.command)
}
