//! Directory tree model with canonical child ordering
//!
//! A [`DirectoryTree`] is built by scanning a directory, lives for one
//! synchronization round, and is replaced wholesale after reconciliation.
//! Node paths are rewritten to be relative to the scan root, so they act as
//! portable tokens; the filesystem path for I/O is always
//! `root_path.join(node.path)`.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::Serialize;
use tracing::debug;

use crate::error::Error;
use crate::hash::FileHash;

/// A single entry in a scanned tree: a regular file or a directory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Node {
    /// Path relative to the owning tree's root; empty for the root node.
    pub(crate) path: PathBuf,
    /// Final component of `path`; empty for the root node.
    pub(crate) name: String,
    /// Modification time, nanoseconds since the Unix epoch.
    pub(crate) mtime: i64,
    pub(crate) kind: NodeKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum NodeKind {
    File {
        size: u64,
        hash: Option<FileHash>,
    },
    Directory {
        children: Vec<Node>,
    },
}

/// The kind of entry a node represents, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeType {
    File,
    Directory,
}

impl Node {
    /// Build a file node from a filesystem path.
    ///
    /// # Errors
    /// Returns [`Error::NotAFile`] if the entry is not a regular file.
    pub fn file(path: &Path) -> Result<Self, Error> {
        let meta = fs::symlink_metadata(path)?;
        if !meta.is_file() {
            return Err(Error::NotAFile(path.to_path_buf()));
        }

        Ok(Self {
            path: path.to_path_buf(),
            name: name_of(path),
            mtime: mtime_nanos(&meta),
            kind: NodeKind::File {
                size: meta.len(),
                hash: None,
            },
        })
    }

    /// Build a directory node by recursively enumerating a filesystem path.
    ///
    /// Non-regular entries (symlinks, sockets, devices) are skipped. Children
    /// end up in canonical order.
    ///
    /// # Errors
    /// Returns [`Error::NotADirectory`] if the entry is not a directory, or
    /// [`Error::Io`] if enumeration fails.
    pub fn directory(path: &Path) -> Result<Self, Error> {
        let meta = fs::symlink_metadata(path)?;
        if !meta.is_dir() {
            return Err(Error::NotADirectory(path.to_path_buf()));
        }

        let mut children = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_file() {
                children.push(Node::file(&entry.path())?);
            } else if file_type.is_dir() {
                children.push(Node::directory(&entry.path())?);
            } else {
                debug!(path = %entry.path().display(), "skipping non-regular entry");
            }
        }
        sort_canonical(&mut children);

        Ok(Self {
            path: path.to_path_buf(),
            name: name_of(path),
            mtime: mtime_nanos(&meta),
            kind: NodeKind::Directory { children },
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Modification time, nanoseconds since the Unix epoch.
    #[must_use]
    pub fn mtime(&self) -> i64 {
        self.mtime
    }

    #[must_use]
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    #[must_use]
    pub fn node_type(&self) -> NodeType {
        match self.kind {
            NodeKind::File { .. } => NodeType::File,
            NodeKind::Directory { .. } => NodeType::Directory,
        }
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Directory { .. })
    }

    #[must_use]
    pub fn is_file(&self) -> bool {
        matches!(self.kind, NodeKind::File { .. })
    }

    /// Children of a directory node; empty for files.
    #[must_use]
    pub fn children(&self) -> &[Node] {
        match &self.kind {
            NodeKind::Directory { children } => children,
            NodeKind::File { .. } => &[],
        }
    }

    pub(crate) fn children_mut(&mut self) -> &mut [Node] {
        match &mut self.kind {
            NodeKind::Directory { children } => children,
            NodeKind::File { .. } => &mut [],
        }
    }

    /// File size in bytes; `None` for directories.
    #[must_use]
    pub fn file_size(&self) -> Option<u64> {
        match &self.kind {
            NodeKind::File { size, .. } => Some(*size),
            NodeKind::Directory { .. } => None,
        }
    }

    /// Memoized content hash; `None` for directories and unhashed files.
    #[must_use]
    pub fn file_hash(&self) -> Option<&FileHash> {
        match &self.kind {
            NodeKind::File { hash, .. } => hash.as_ref(),
            NodeKind::Directory { .. } => None,
        }
    }

    /// Restore canonical child ordering after a structural mutation.
    pub fn sort_children(&mut self) {
        if let NodeKind::Directory { children } = &mut self.kind {
            sort_canonical(children);
        }
    }

    /// The node's relative path in on-wire form: forward-slash separators.
    #[must_use]
    pub fn wire_path(&self) -> String {
        wire_path(&self.path)
    }
}

/// Canonical order: directories before files, then byte-lexicographic name.
fn sort_canonical(children: &mut [Node]) {
    children.sort_by(|a, b| match (a.is_dir(), b.is_dir()) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => a.name.as_bytes().cmp(b.name.as_bytes()),
    });
}

fn name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn mtime_nanos(meta: &fs::Metadata) -> i64 {
    let Ok(modified) = meta.modified() else {
        return 0;
    };
    match modified.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as i64,
        Err(e) => -(e.duration().as_nanos() as i64),
    }
}

/// Render a relative path with forward-slash separators.
#[must_use]
pub fn wire_path(path: &Path) -> String {
    let mut out = String::new();
    for component in path.components() {
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(&component.as_os_str().to_string_lossy());
    }
    out
}

/// Parse a forward-slash wire path back into a [`PathBuf`].
#[must_use]
pub fn from_wire_path(s: &str) -> PathBuf {
    s.split('/').filter(|c| !c.is_empty()).collect()
}

/// A scanned directory tree: the owned root node, the absolute scan root,
/// and a relative-path index over every reachable node.
///
/// The index stores the child-index path from the root for each node and is
/// read-only; structural mutations invalidate it until
/// [`DirectoryTree::rebuild_index`] runs.
#[derive(Debug, Serialize)]
pub struct DirectoryTree {
    pub(crate) root_path: PathBuf,
    pub(crate) root: Node,
    #[serde(skip)]
    index: HashMap<PathBuf, Vec<usize>>,
}

impl DirectoryTree {
    /// Scan a directory into a canonical tree.
    ///
    /// Every node's path is rewritten relative to `root_path` (the root node
    /// ends up with an empty path and name) and the index is populated.
    ///
    /// # Errors
    /// Propagates construction and enumeration failures.
    pub fn scan(root_path: impl Into<PathBuf>) -> Result<Self, Error> {
        let root_path = root_path.into();
        let mut root = Node::directory(&root_path)?;

        let mut index = HashMap::new();
        relativize(&mut root, &root_path, &mut Vec::new(), &mut index)?;
        debug!(root = %root_path.display(), nodes = index.len(), "scanned directory tree");

        Ok(Self {
            root_path,
            root,
            index,
        })
    }

    /// Adopt an already-relative root node (deserializer output) and build
    /// the index over it.
    #[must_use]
    pub fn from_root(root_path: impl Into<PathBuf>, root: Node) -> Self {
        let mut tree = Self {
            root_path: root_path.into(),
            root,
            index: HashMap::new(),
        };
        tree.rebuild_index();
        tree
    }

    #[must_use]
    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    #[must_use]
    pub fn root(&self) -> &Node {
        &self.root
    }

    pub(crate) fn root_mut(&mut self) -> &mut Node {
        &mut self.root
    }

    /// Number of indexed nodes, the root included.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.index.len()
    }

    /// Look up a node by its relative path.
    #[must_use]
    pub fn node(&self, rel: &Path) -> Option<&Node> {
        let cursor = self.index.get(rel)?;
        let mut node = &self.root;
        for &i in cursor {
            node = node.children().get(i)?;
        }
        Some(node)
    }

    /// Relative paths of all indexed nodes, in unspecified order.
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.index.keys().map(PathBuf::as_path)
    }

    /// Rebuild the index after a structural mutation. Node paths must
    /// already be correct relative paths.
    pub fn rebuild_index(&mut self) {
        self.index.clear();
        index_node(&self.root, &mut Vec::new(), &mut self.index);
    }

    /// Write a `|--`-prefixed recursive listing of the tree.
    ///
    /// # Errors
    /// Propagates writer failures.
    pub fn print_tree<W: io::Write>(&self, w: &mut W) -> io::Result<()> {
        print_node(w, &self.root, "")
    }
}

fn relativize(
    node: &mut Node,
    root: &Path,
    cursor: &mut Vec<usize>,
    index: &mut HashMap<PathBuf, Vec<usize>>,
) -> Result<(), Error> {
    let rel = node
        .path
        .strip_prefix(root)
        .map_err(|_| Error::Io(io::Error::other("scanned node outside the scan root")))?
        .to_path_buf();
    node.name = name_of(&rel);
    node.path = rel;

    index.insert(node.path.clone(), cursor.clone());

    if let NodeKind::Directory { children } = &mut node.kind {
        for (i, child) in children.iter_mut().enumerate() {
            cursor.push(i);
            relativize(child, root, cursor, index)?;
            cursor.pop();
        }
    }
    Ok(())
}

fn index_node(node: &Node, cursor: &mut Vec<usize>, index: &mut HashMap<PathBuf, Vec<usize>>) {
    index.insert(node.path.clone(), cursor.clone());
    for (i, child) in node.children().iter().enumerate() {
        cursor.push(i);
        index_node(child, cursor, index);
        cursor.pop();
    }
}

fn print_node<W: io::Write>(w: &mut W, node: &Node, prefix: &str) -> io::Result<()> {
    let name = if node.name.is_empty() { "." } else { &node.name };
    writeln!(w, "{prefix}|--{name}")?;
    let child_prefix = format!("{prefix}|  ");
    for child in node.children() {
        print_node(w, child, &child_prefix)?;
    }
    Ok(())
}
