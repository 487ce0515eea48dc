//! Tree serialization: depth-first pre-order encode/decode
//!
//! Wire grammar, all integers big-endian:
//!
//! ```text
//! Node     := u8 kind | u64 mtime_nanos | str name | str rel_path
//!           | (kind==File) ? FileTail : DirTail
//! FileTail := u64 size | u8 has_hash | (has_hash ? 32 bytes digest : ε)
//! DirTail  := u32 child_count | child_count × Node
//! str      := u32 length | length bytes (UTF-8)
//! ```
//!
//! Relative paths travel with forward-slash separators. Decode validates
//! string lengths against the remaining buffer before allocating and never
//! pre-reserves child vectors from wire-supplied counts.

use std::io::Cursor;
use std::path::PathBuf;

use crate::error::Error;
use crate::hash::FileHash;
use crate::tree::{from_wire_path, DirectoryTree, Node, NodeKind};
use crate::wire;

const KIND_FILE: u8 = 0;
const KIND_DIRECTORY: u8 = 1;

/// Encode a tree's root subtree into a self-contained byte buffer.
///
/// # Errors
/// Infallible in practice (the sink is a `Vec`), but wire plumbing is kept
/// honest.
pub fn encode_tree(tree: &DirectoryTree) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    encode_node(&mut buf, tree.root())?;
    Ok(buf)
}

/// Decode a serialized tree, adopting `root_path` as the scan root, and
/// rebuild the index.
///
/// # Errors
/// Returns [`Error::MalformedTree`] on invalid tags, lengths overflowing the
/// buffer, truncation, or trailing garbage.
pub fn decode_tree(buf: &[u8], root_path: impl Into<PathBuf>) -> Result<DirectoryTree, Error> {
    let mut cursor = Cursor::new(buf);
    let root = decode_node(&mut cursor)?;

    if cursor.position() != buf.len() as u64 {
        return Err(Error::MalformedTree("trailing bytes after tree payload"));
    }
    if !root.is_dir() {
        return Err(Error::MalformedTree("root node is not a directory"));
    }

    Ok(DirectoryTree::from_root(root_path, root))
}

fn encode_node(buf: &mut Vec<u8>, node: &Node) -> Result<(), Error> {
    match node.kind() {
        NodeKind::File { size, hash } => {
            wire::write_u8(buf, KIND_FILE)?;
            encode_common(buf, node)?;
            wire::write_u64(buf, *size)?;
            match hash {
                Some(digest) => {
                    wire::write_u8(buf, 1)?;
                    buf.extend_from_slice(digest.as_bytes());
                }
                None => wire::write_u8(buf, 0)?,
            }
        }
        NodeKind::Directory { children } => {
            wire::write_u8(buf, KIND_DIRECTORY)?;
            encode_common(buf, node)?;
            wire::write_u32(buf, children.len() as u32)?;
            for child in children {
                encode_node(buf, child)?;
            }
        }
    }
    Ok(())
}

fn encode_common(buf: &mut Vec<u8>, node: &Node) -> Result<(), Error> {
    wire::write_u64(buf, node.mtime() as u64)?;
    wire::write_string(buf, node.name())?;
    wire::write_string(buf, &node.wire_path())?;
    Ok(())
}

fn decode_node(cursor: &mut Cursor<&[u8]>) -> Result<Node, Error> {
    let kind_tag = wire::read_u8(cursor).map_err(truncated)?;
    let mtime = wire::read_u64(cursor).map_err(truncated)? as i64;
    let name = read_bounded_string(cursor)?;
    let path = from_wire_path(&read_bounded_string(cursor)?);

    let kind = match kind_tag {
        KIND_FILE => {
            let size = wire::read_u64(cursor).map_err(truncated)?;
            let hash = match wire::read_u8(cursor).map_err(truncated)? {
                0 => None,
                1 => {
                    let mut digest = [0u8; 32];
                    wire::read_exact(cursor, &mut digest).map_err(truncated)?;
                    Some(FileHash::from_raw(digest))
                }
                _ => return Err(Error::MalformedTree("invalid hash presence flag")),
            };
            NodeKind::File { size, hash }
        }
        KIND_DIRECTORY => {
            let count = wire::read_u32(cursor).map_err(truncated)?;
            let mut children = Vec::new();
            for _ in 0..count {
                children.push(decode_node(cursor)?);
            }
            NodeKind::Directory { children }
        }
        _ => return Err(Error::MalformedTree("unknown node kind tag")),
    };

    Ok(Node {
        path,
        name,
        mtime,
        kind,
    })
}

fn read_bounded_string(cursor: &mut Cursor<&[u8]>) -> Result<String, Error> {
    let len = wire::read_u32(cursor).map_err(truncated)? as u64;
    let remaining = cursor.get_ref().len() as u64 - cursor.position();
    if len > remaining {
        return Err(Error::MalformedTree("string length exceeds payload"));
    }

    let mut buf = vec![0u8; len as usize];
    wire::read_exact(cursor, &mut buf).map_err(truncated)?;
    String::from_utf8(buf).map_err(|_| Error::MalformedTree("string is not valid UTF-8"))
}

fn truncated(e: Error) -> Error {
    match e {
        Error::ShortRead => Error::MalformedTree("truncated tree payload"),
        other => other,
    }
}
