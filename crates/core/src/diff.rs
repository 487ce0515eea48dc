//! Two-pass structural diff over canonically ordered trees
//!
//! The first pass is metadata only (presence, kind, size); content hashes
//! are computed on demand, and only for file pairs whose sizes match, since
//! a size mismatch is already a sufficient modification witness.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::Error;
use crate::hash::FileHash;
use crate::tree::{DirectoryTree, Node, NodeType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChangeType {
    Added,
    Deleted,
    Modified,
}

/// A value copy of a node's observable state, so diff results outlive the
/// trees they were computed from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeSnapshot {
    pub path: PathBuf,
    pub node_type: NodeType,
    /// Nanoseconds since the Unix epoch.
    pub mtime: i64,
    /// File size in bytes; zero for directories.
    pub size: u64,
    pub hash: Option<FileHash>,
}

impl From<&Node> for NodeSnapshot {
    fn from(node: &Node) -> Self {
        Self {
            path: node.path().to_path_buf(),
            node_type: node.node_type(),
            mtime: node.mtime(),
            size: node.file_size().unwrap_or(0),
            hash: node.file_hash().copied(),
        }
    }
}

/// One record of divergence between two trees.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeDiff {
    pub change: ChangeType,
    pub old: Option<NodeSnapshot>,
    pub new: Option<NodeSnapshot>,
}

impl NodeDiff {
    fn added(node: &Node) -> Self {
        Self {
            change: ChangeType::Added,
            old: None,
            new: Some(NodeSnapshot::from(node)),
        }
    }

    fn deleted(node: &Node) -> Self {
        Self {
            change: ChangeType::Deleted,
            old: Some(NodeSnapshot::from(node)),
            new: None,
        }
    }

    fn modified(old: &Node, new: &Node) -> Self {
        Self {
            change: ChangeType::Modified,
            old: Some(NodeSnapshot::from(old)),
            new: Some(NodeSnapshot::from(new)),
        }
    }

    /// The affected relative path (from whichever side is populated).
    #[must_use]
    pub fn path(&self) -> &Path {
        match (&self.new, &self.old) {
            (Some(snapshot), _) | (None, Some(snapshot)) => &snapshot.path,
            (None, None) => Path::new(""),
        }
    }
}

/// Diff two trees by a merge-walk over their canonically ordered children.
///
/// Both trees are mutable because matching file pairs of equal size have
/// their content hashes computed and memoized in place. A hash failure
/// aborts the whole diff; there is no partial result.
///
/// Records come out in depth-first order. The walk itself uses an explicit
/// frame stack, so arbitrarily deep trees cannot exhaust the native stack.
pub fn diff_trees(
    old: &mut DirectoryTree,
    new: &mut DirectoryTree,
) -> Result<Vec<NodeDiff>, Error> {
    let old_root = old.root_path().to_path_buf();
    let new_root = new.root_path().to_path_buf();
    let mut diffs = Vec::new();

    let mut stack: Vec<(&mut [Node], &mut [Node])> = vec![(
        old.root_mut().children_mut(),
        new.root_mut().children_mut(),
    )];

    while let Some((mut a, mut b)) = stack.pop() {
        loop {
            if b.is_empty() {
                diffs.extend(a.iter().map(NodeDiff::deleted));
                break;
            }
            if a.is_empty() {
                diffs.extend(b.iter().map(NodeDiff::added));
                break;
            }

            // Within matched parents, name equality is path equality.
            match a[0].name().as_bytes().cmp(b[0].name().as_bytes()) {
                Ordering::Less => {
                    let [head, rest @ ..] = std::mem::take(&mut a) else {
                        break;
                    };
                    diffs.push(NodeDiff::deleted(head));
                    a = rest;
                }
                Ordering::Greater => {
                    let [head, rest @ ..] = std::mem::take(&mut b) else {
                        break;
                    };
                    diffs.push(NodeDiff::added(head));
                    b = rest;
                }
                Ordering::Equal => {
                    let [x, rest_a @ ..] = std::mem::take(&mut a) else {
                        break;
                    };
                    let [y, rest_b @ ..] = std::mem::take(&mut b) else {
                        break;
                    };
                    a = rest_a;
                    b = rest_b;

                    if x.is_dir() != y.is_dir() {
                        // A file-directory flip is a modification; no recursion.
                        diffs.push(NodeDiff::modified(x, y));
                    } else if x.is_file() {
                        if files_differ(x, y, &old_root, &new_root)? {
                            diffs.push(NodeDiff::modified(x, y));
                        }
                    } else {
                        // Resume this directory after the subdirectory frame.
                        stack.push((a, b));
                        stack.push((x.children_mut(), y.children_mut()));
                        break;
                    }
                }
            }
        }
    }

    Ok(diffs)
}

fn files_differ(
    a: &mut Node,
    b: &mut Node,
    old_root: &Path,
    new_root: &Path,
) -> Result<bool, Error> {
    if a.file_size() != b.file_size() {
        return Ok(true);
    }

    a.ensure_hash(old_root)?;
    b.ensure_hash(new_root)?;
    Ok(a.file_hash() != b.file_hash())
}
