//! Content hashing using SHA-256
//!
//! Hashes are computed lazily, on the differ's demand, and memoized on the
//! file node for the lifetime of the tree. Files are streamed through the
//! hasher in fixed blocks; whole files are never resident.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Error;
use crate::tree::{DirectoryTree, Node, NodeKind};

/// A 32-byte SHA-256 digest over a file's raw bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileHash([u8; 32]);

impl FileHash {
    /// Hash arbitrary bytes.
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Stream a reader through the hasher in 64 KiB blocks.
    ///
    /// # Errors
    /// Propagates read failures.
    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self, Error> {
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 64 * 1024];

        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }

        Ok(Self(hasher.finalize().into()))
    }

    /// Wrap a raw digest.
    #[must_use]
    pub fn from_raw(raw: [u8; 32]) -> Self {
        Self(raw)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for FileHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "FileHash({})", hex.get(..16).unwrap_or(&hex))
    }
}

impl fmt::Display for FileHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "{}", hex.get(..16).unwrap_or(&hex))
    }
}

impl Node {
    /// Hash this file's content, memoizing the digest on the node.
    ///
    /// No-op for directories and for files already hashed. The file is
    /// resolved as `root.join(self.path)`.
    ///
    /// # Errors
    /// Propagates open/read failures.
    pub fn ensure_hash(&mut self, root: &Path) -> Result<(), Error> {
        let NodeKind::File { hash, .. } = &mut self.kind else {
            return Ok(());
        };
        if hash.is_some() {
            return Ok(());
        }

        let file = File::open(root.join(&self.path))?;
        *hash = Some(FileHash::from_reader(file)?);
        Ok(())
    }
}

impl DirectoryTree {
    /// Eagerly hash every file node in the tree.
    ///
    /// Used before a tree is sent to a peer: a received tree cannot be
    /// hashed on the receiving side, so the digests must travel with it.
    ///
    /// # Errors
    /// Propagates the first open/read failure.
    pub fn hash_all(&mut self) -> Result<(), Error> {
        let root = self.root_path.clone();
        hash_subtree(self.root_mut(), &root)
    }
}

fn hash_subtree(node: &mut Node, root: &Path) -> Result<(), Error> {
    node.ensure_hash(root)?;
    for child in node.children_mut() {
        hash_subtree(child, root)?;
    }
    Ok(())
}
