//! Error taxonomy for tree construction, hashing, and (de)serialization.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The path given to [`crate::Node::file`] is not a regular file.
    #[error("not a regular file: {0}")]
    NotAFile(PathBuf),

    /// The path given to [`crate::Node::directory`] is not a directory.
    #[error("not a directory: {0}")]
    NotADirectory(PathBuf),

    /// Filesystem open/read/write/enumerate failure.
    #[error("i/o failure")]
    Io(#[from] std::io::Error),

    /// The byte source ended before the requested bytes arrived.
    #[error("stream ended before required bytes arrived")]
    ShortRead,

    /// Tree deserialization hit an invalid tag, a length overflowing the
    /// buffer, or truncated input.
    #[error("malformed tree payload: {0}")]
    MalformedTree(&'static str),
}
