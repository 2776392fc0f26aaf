use std::path::PathBuf;

/// The primary error type for all operations in the `storepack` crate.
#[derive(Debug, thiserror::Error)]
pub enum PackError {
    /// An I/O error occurred while reading, writing or creating a filesystem entry.
    /// Includes the path where the error happened.
    #[error("I/O error on path '{}': {source}", path.display())]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// The file carries no sentinel, so there is no payload to read.
    #[error("'{}' is not an archive (no payload sentinel found)", path.display())]
    NotAnArchive { path: PathBuf },

    /// The payload was found but its compressed tar stream could not be decoded.
    #[error("corrupt archive '{}': {source}", path.display())]
    CorruptArchive {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// An archive entry whose path leads through a symlink extracted before it.
    #[error("entry '{}' would be written through a symlink", path.display())]
    EntryThroughSymlink { path: PathBuf },

    /// A filesystem or archive entry of a kind the codec cannot represent.
    #[error("unsupported entry kind '{kind}' at '{}'", path.display())]
    UnsupportedEntryKind { path: PathBuf, kind: String },

    /// A name that cannot be stored as a relative, normalized archive path.
    #[error("invalid entry name '{}'", path.display())]
    InvalidEntryName { path: PathBuf },

    /// Every randomly probed alias already existed.
    #[error("unable to find a free store path alias after {attempts} attempts")]
    StorePathExhausted { attempts: usize },

    /// Relocation requires both prefixes to have the same byte length.
    #[error("store prefixes differ in length: '{old}' ({} bytes) vs '{new}' ({} bytes)", old.len(), new.len())]
    PrefixLengthMismatch { old: String, new: String },

    /// The alias is longer than the prefix it has to stand in for.
    #[error("store path alias '{alias}' is longer than {limit} bytes")]
    AliasTooLong { alias: String, limit: usize },

    /// The alias has no `/` to pad, so it cannot be an absolute path.
    #[error("store path alias '{alias}' is not an absolute path")]
    RelativeAlias { alias: String },

    /// The recorded alias path exists but is not a symlink.
    #[error("store path alias '{}' is occupied by something that is not a symlink", path.display())]
    AliasOccupied { path: PathBuf },

    /// A store prefix or alias that is not valid UTF-8.
    #[error("path '{}' is not valid UTF-8", path.display())]
    NonUtf8Path { path: PathBuf },

    /// The entrypoint of the extracted tree could not be started.
    #[error("failed to launch '{}': {source}", path.display())]
    Launch {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// A worker thread of the relocation pool panicked.
    #[error("a worker thread panicked")]
    WorkerPanicked,

    /// The multi-pattern replacer could not be built from the prefix pairs.
    #[error("failed to build store path replacer: {0}")]
    Replacer(#[from] aho_corasick::BuildError),
}

impl PackError {
    /// Attach a path to an I/O error.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        PackError::Io { source, path: path.into() }
    }
}

// Generic IO error conversion that doesn't require a path
impl From<std::io::Error> for PackError {
    fn from(err: std::io::Error) -> Self {
        PackError::Io { source: err, path: PathBuf::new() }
    }
}

impl From<walkdir::Error> for PackError {
    fn from(err: walkdir::Error) -> Self {
        let path = err.path().map(|p| p.to_path_buf()).unwrap_or_default();
        PackError::Io { source: err.into(), path }
    }
}

/// Extension for attaching a path to `io::Result` values at the call site.
pub(crate) trait IoContext<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T, PackError>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T, PackError> {
        self.map_err(|e| PackError::io(e, path))
    }
}
