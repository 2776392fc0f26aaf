//! # Payload Sentinel
//!
//! A self-extracting executable is laid out as
//! `[host executable bytes][64-byte sentinel][zstd-compressed tar stream]`.
//! The sentinel is the SHA-512 digest of a fixed string. It is derived at
//! runtime and never stored as a literal, so the host binary itself cannot
//! contain it. The payload starts right after the first occurrence.

use crate::error::{IoContext, PackError};
use crate::fsx as fs;
use sha2::{Digest, Sha512};
use std::io::{Seek, SeekFrom};
use std::path::Path;

/// Length of the sentinel in bytes.
pub const SENTINEL_LEN: usize = 64;

const SENTINEL_SEED: &[u8] = b"boundary";

/// The sentinel bytes written between the host executable and the payload.
pub fn sentinel() -> [u8; SENTINEL_LEN] {
    let mut out = [0u8; SENTINEL_LEN];
    out.copy_from_slice(&Sha512::digest(SENTINEL_SEED));
    out
}

/// Offset of the first sentinel occurrence in `bytes`.
pub fn find_sentinel(bytes: &[u8]) -> Option<usize> {
    let needle = sentinel();
    bytes.windows(SENTINEL_LEN).position(|window| window == &needle[..])
}

/// Reads the whole file and returns the offset of the first sentinel, if any.
pub fn locate(path: &Path) -> Result<Option<u64>, PackError> {
    let bytes = fs::read(path).at(path)?;
    Ok(find_sentinel(&bytes).map(|offset| offset as u64))
}

/// True if the file carries an appended payload.
pub fn has_sentinel(path: &Path) -> Result<bool, PackError> {
    Ok(locate(path)?.is_some())
}

/// Offset of the first payload byte, or `NotAnArchive`.
pub fn payload_offset(path: &Path) -> Result<u64, PackError> {
    match locate(path)? {
        Some(offset) => Ok(offset + SENTINEL_LEN as u64),
        None => Err(PackError::NotAnArchive { path: path.to_path_buf() }),
    }
}

/// Opens `path` positioned at the start of its payload.
pub fn open_payload(path: &Path) -> Result<fs::File, PackError> {
    let offset = payload_offset(path)?;
    let mut file = fs::File::open(path).at(path)?;
    file.seek(SeekFrom::Start(offset)).at(path)?;
    Ok(file)
}
