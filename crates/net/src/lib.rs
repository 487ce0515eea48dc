//! treesync-net: TCP session protocol and peer management
//!
//! Carries serialized trees and chunked file payloads over a single TCP
//! connection. Each session enforces at-most-one in-flight logical
//! operation; a peer owns the acceptor, the connector, and the set of live
//! sessions.

pub mod error;
pub mod peer;
pub mod session;

pub use error::Error;
pub use peer::Peer;
pub use session::{OnClose, Session};

/// Upper bound on a serialized tree payload.
pub const MAX_TREE_SIZE: u64 = 64 * 1024 * 1024;

/// Upper bound on a single file chunk (and on a file-transfer header).
pub const MAX_FILE_CHUNK_SIZE: u32 = 64 * 1024 * 1024;
