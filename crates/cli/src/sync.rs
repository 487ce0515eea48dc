//! Push-style reconciliation built on the four session operations
//!
//! There is no request message in the protocol, so the policy leans on
//! determinism instead: both ends exchange fully hashed trees, compute the
//! identical diff over the identical pair, and therefore agree on exactly
//! which files travel. The server receives that many transfers and is done.

use std::path::{Path, PathBuf};

use color_eyre::eyre::eyre;
use color_eyre::Result;
use tracing::{info, warn};

use treesync_core::{diff_trees, ChangeType, DirectoryTree, Node, NodeDiff, NodeType};
use treesync_net::{Peer, Session};

/// Accept pushes forever, one session at a time.
pub async fn serve(root: &Path, port: u16, delete: bool) -> Result<()> {
    let peer = Peer::bind(port)?;
    info!(addr = %peer.local_addr()?, root = %root.display(), "serving");

    loop {
        let weak = peer.accept_one().await?;
        let Some(session) = weak.upgrade() else {
            continue;
        };

        if let Err(e) = handle_push(&session, root, delete).await {
            warn!(error = %e, "push session failed");
            session.close();
        }
    }
}

async fn handle_push(session: &Session, root: &Path, delete: bool) -> Result<()> {
    let mut local = DirectoryTree::scan(root)?;
    local.hash_all()?;

    let mut remote = session.receive_tree(root).await?;
    session.send_tree(&local).await?;

    let diffs = diff_trees(&mut local, &mut remote)?;
    prepare_destination(root, &diffs, delete)?;

    let incoming = transfer_set(&diffs, &remote);
    info!(
        changes = diffs.len(),
        transfers = incoming.len(),
        "reconciling push"
    );

    for _ in 0..incoming.len() {
        session.receive_file(&mut local).await?;
    }

    info!("push received");
    Ok(())
}

/// Push `root` to a serving peer.
pub async fn push(root: &Path, host: &str, port: u16, chunk_size: u32) -> Result<()> {
    let mut local = DirectoryTree::scan(root)?;
    local.hash_all()?;

    let peer = Peer::bind(0)?;
    let session = peer
        .connect(host, port)
        .await?
        .upgrade()
        .ok_or_else(|| eyre!("session closed before use"))?;

    session.send_tree(&local).await?;
    let mut remote = session.receive_tree(root).await?;

    // Mirror of the server's computation: old = server side, new = ours.
    let diffs = diff_trees(&mut remote, &mut local)?;
    let outgoing = transfer_set(&diffs, &local);
    info!(
        changes = diffs.len(),
        transfers = outgoing.len(),
        "pushing"
    );

    for path in &outgoing {
        let node = local
            .node(path)
            .ok_or_else(|| eyre!("tree index missing {}", path.display()))?;
        session.send_file(&local, node, chunk_size).await?;
    }

    session.close();
    info!("push complete");
    Ok(())
}

/// Files implied by a diff's `Added`/`Modified` records, in tree order. An
/// added directory contributes its whole file subtree; `Deleted` records
/// move nothing.
fn transfer_set(diffs: &[NodeDiff], new_tree: &DirectoryTree) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for diff in diffs {
        let Some(snapshot) = &diff.new else { continue };
        match diff.change {
            ChangeType::Deleted => {}
            ChangeType::Added | ChangeType::Modified => {
                if let Some(node) = new_tree.node(&snapshot.path) {
                    collect_files(node, &mut files);
                }
            }
        }
    }
    files
}

fn collect_files(node: &Node, out: &mut Vec<PathBuf>) {
    if node.is_file() {
        out.push(node.path().to_path_buf());
    }
    for child in node.children() {
        collect_files(child, out);
    }
}

/// Clear the ground before transfers arrive: a file⇄directory flip removes
/// the stale local entry, and `--delete` applies remote deletions.
fn prepare_destination(root: &Path, diffs: &[NodeDiff], delete: bool) -> Result<()> {
    for diff in diffs {
        match diff.change {
            ChangeType::Modified => {
                let (Some(old), Some(new)) = (&diff.old, &diff.new) else {
                    continue;
                };
                if old.node_type != new.node_type {
                    remove_entry(root, &old.path, old.node_type)?;
                }
            }
            ChangeType::Deleted if delete => {
                let Some(old) = &diff.old else { continue };
                remove_entry(root, &old.path, old.node_type)?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn remove_entry(root: &Path, rel: &Path, node_type: NodeType) -> Result<()> {
    let path = root.join(rel);
    info!(path = %path.display(), "removing stale entry");
    match node_type {
        NodeType::File => std::fs::remove_file(&path)?,
        NodeType::Directory => std::fs::remove_dir_all(&path)?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_transfer_set_expands_added_directories() {
        let old = TempDir::new().unwrap();
        let new = TempDir::new().unwrap();
        fs::create_dir_all(new.path().join("pkg/src")).unwrap();
        fs::write(new.path().join("pkg/src/lib.rs"), "lib").unwrap();
        fs::write(new.path().join("pkg/readme.md"), "docs").unwrap();
        fs::write(new.path().join("top.txt"), "top").unwrap();

        let mut old_tree = DirectoryTree::scan(old.path()).unwrap();
        let mut new_tree = DirectoryTree::scan(new.path()).unwrap();
        let diffs = diff_trees(&mut old_tree, &mut new_tree).unwrap();

        let files = transfer_set(&diffs, &new_tree);
        assert_eq!(
            files,
            [
                PathBuf::from("pkg/src/lib.rs"),
                PathBuf::from("pkg/readme.md"),
                PathBuf::from("top.txt"),
            ]
        );
    }

    #[test]
    fn test_transfer_set_skips_deletions() {
        let old = TempDir::new().unwrap();
        let new = TempDir::new().unwrap();
        fs::write(old.path().join("gone.txt"), "gone").unwrap();

        let mut old_tree = DirectoryTree::scan(old.path()).unwrap();
        let mut new_tree = DirectoryTree::scan(new.path()).unwrap();
        let diffs = diff_trees(&mut old_tree, &mut new_tree).unwrap();

        assert_eq!(diffs.len(), 1);
        assert!(transfer_set(&diffs, &new_tree).is_empty());
    }

    #[test]
    fn test_prepare_destination_resolves_type_flip() {
        let old = TempDir::new().unwrap();
        let new = TempDir::new().unwrap();
        fs::create_dir(old.path().join("x")).unwrap();
        fs::write(old.path().join("x/inner"), "inner").unwrap();
        fs::write(new.path().join("x"), "file now").unwrap();

        let mut old_tree = DirectoryTree::scan(old.path()).unwrap();
        let mut new_tree = DirectoryTree::scan(new.path()).unwrap();
        let diffs = diff_trees(&mut old_tree, &mut new_tree).unwrap();

        prepare_destination(old.path(), &diffs, false).unwrap();
        assert!(!old.path().join("x").exists());
    }
}
