//! treesync-core: Canonical directory trees and structural diffing
//!
//! Provides the tree model, the wire codec, tree serialization, content
//! hashing, and the two-pass structural differ.

pub mod diff;
pub mod error;
pub mod hash;
pub mod serialize;
pub mod tree;
pub mod wire;

pub use diff::{diff_trees, ChangeType, NodeDiff, NodeSnapshot};
pub use error::Error;
pub use hash::FileHash;
pub use serialize::{decode_tree, encode_tree};
pub use tree::{DirectoryTree, Node, NodeKind, NodeType};
