//! Error types for the cache.
//!
//! One unified [`CacheError`] covers construction, I/O, file-format and
//! corruption failures, codec failures, and errors raised by user-supplied
//! backing-store callbacks. Library code never panics; everything is
//! propagated with `?`.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Boxed error type carried by backing-store callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T> = std::result::Result<T, CacheError>;

/// What a corrupted entry header claimed about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptionKind {
    /// An entry header reported `size == 0`.
    ZeroSized,
    /// An entry extends past the end of its bucket.
    SuperSized,
}

impl fmt::Display for CorruptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorruptionKind::ZeroSized => f.write_str("Zero-sized"),
            CorruptionKind::SuperSized => f.write_str("Super-sized"),
        }
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    /// An invalid option was passed to the constructor.
    #[error("invalid cache option: {0}")]
    Config(String),

    /// An open, read, write, extend, mmap, or lock system call failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The file exists but is not a cache file this build can use.
    #[error("{}: {reason}", path.display())]
    Format { path: PathBuf, reason: String },

    /// An entry header in the mapped file is self-inconsistent.
    #[error("{}: {kind} entry at offset {offset}: [{dump}]", path.display())]
    Corruption {
        path: PathBuf,
        offset: u64,
        kind: CorruptionKind,
        /// Hex dump of the bytes surrounding the bad header.
        dump: String,
    },

    /// A stored value could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// A user-supplied `read`/`write`/`delete` callback failed. The bucket
    /// lock is released before this propagates.
    #[error("backing store callback failed: {0}")]
    Backing(#[source] BoxError),
}
