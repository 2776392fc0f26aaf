//! # storepack Core Library
//!
//! Builds and runs self-extracting executables whose payload references a
//! content-addressed package store (`/nix/store/...`).
//!
//! A bundle is `[host executable][sentinel][zstd-compressed tar]`. On first run
//! the payload is extracted into a per-executable cache, every embedded store
//! prefix is rewritten to an alias of identical length that points at the
//! extracted tree, and the bundled entrypoint is launched.
//!
//! ## Key Modules
//!
//! - [`archive`]: writing and listing the appended payload.
//! - [`extract`]: unpacking a payload into a directory.
//! - [`sentinel`]: locating the payload inside an executable.
//! - [`cache`]: checksum-gated extraction cache.
//! - [`store_path`]: choosing and maintaining store path aliases.
//! - [`relocate`]: concurrent, length-preserving store path rewriting.
//! - [`selfextract`]: the self-extracting run from cache check to cleanup.

#[cfg(not(unix))]
compile_error!("storepack relies on Unix symlinks and permission bits");

pub mod archive;
pub mod cache;
pub mod cli;
pub mod cli_runner;
pub mod config;
pub mod error;
pub mod extract;
pub mod media;
pub mod progress;
pub mod relocate;
pub mod selfextract;
pub mod sentinel;
pub mod store_path;
pub mod workers;

// Unix filesystem wrapper
pub mod fsx;

pub use error::PackError;
