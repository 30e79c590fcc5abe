//! Error types for Aperture.

use thiserror::Error;

/// Result type alias using Aperture's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Aperture operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A caller supplied an empty, oversized or otherwise unusable input.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Region or map growth failed, or the region slot capacity is exhausted.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// The requested combination of implementations is not supported
    /// (e.g. merging a dense-mapped buffer into a hash-mapped one).
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// The buffer is not in a state that permits the operation.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// No entry exists for the requested tag.
    #[error("no such tag: {0:#x}")]
    NoSuchTag(u32),

    /// An iterator or cursor has been exhausted.
    #[error("no more entries")]
    NoMore,

    /// The tag registry could not resolve a tag to a dense index.
    #[error("tag index out of bounds: {0:#x}")]
    OutOfBounds(u32),

    /// The buffer still has outstanding references and the operation was
    /// not forced.
    #[error("busy: {0}")]
    Busy(String),
}
