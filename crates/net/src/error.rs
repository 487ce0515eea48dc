//! Error taxonomy for the session protocol and peer management.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Tree construction, hashing, or (de)serialization failure.
    #[error(transparent)]
    Tree(#[from] treesync_core::Error),

    /// Socket-level read/write failure.
    #[error("i/o failure")]
    Io(#[from] std::io::Error),

    /// The connection ended before the required bytes arrived.
    #[error("stream ended before required bytes arrived")]
    ShortRead,

    /// Announced tree payload exceeds [`crate::MAX_TREE_SIZE`].
    #[error("tree payload too large: {0} bytes")]
    TreeTooLarge(u64),

    /// Announced file-transfer header exceeds [`crate::MAX_FILE_CHUNK_SIZE`].
    #[error("file header too large: {0} bytes")]
    HeaderTooLarge(u64),

    /// A chunk length was zero, exceeded [`crate::MAX_FILE_CHUNK_SIZE`], or
    /// overran the announced file size.
    #[error("bad chunk length: {0} bytes")]
    ChunkTooLarge(u32),

    /// The caller-supplied chunk size is zero or exceeds
    /// [`crate::MAX_FILE_CHUNK_SIZE`].
    #[error("chunk size out of range: {0}")]
    InvalidChunkSize(u32),

    /// A received relative path would escape the sync root.
    #[error("path escapes sync root: {0}")]
    InvalidPath(PathBuf),

    /// Writing the received file to disk failed.
    #[error("destination write failed")]
    WriteFailed(#[source] std::io::Error),

    /// The session was closed by a prior failure or an explicit close.
    #[error("session closed")]
    SessionClosed,

    /// No resolved endpoint accepted the connection.
    #[error("could not connect to {host}:{port}")]
    ConnectFailed {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },
}
