//! End-to-end two-peer synchronization over real sockets
//!
//! Exercises the full data flow: scan, hash, tree exchange, deterministic
//! diff on both ends, and chunked file transfer until the destination
//! mirrors the source.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use treesync_core::{diff_trees, ChangeType, DirectoryTree, NodeDiff};
use treesync_net::Peer;

/// Files implied by a diff's `Added`/`Modified` records, in tree order. An
/// added directory contributes its whole file subtree. Both ends compute
/// this over the same pair of trees, so the counts always agree.
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

fn collect_files(node: &treesync_core::Node, out: &mut Vec<PathBuf>) {
    if node.is_file() {
        out.push(node.path().to_path_buf());
    }
    for child in node.children() {
        collect_files(child, out);
    }
}

#[tokio::test]
async fn test_push_between_two_peers() {
    let source = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();

    fs::create_dir_all(source.path().join("src/nested")).unwrap();
    fs::write(source.path().join("src/main.rs"), "fn main() {}").unwrap();
    fs::write(source.path().join("src/nested/mod.rs"), "pub mod x;").unwrap();
    fs::write(source.path().join("readme.md"), "# project").unwrap();
    fs::write(source.path().join("empty.dat"), "").unwrap();

    // The destination starts with one stale file and one shared file.
    fs::write(dest.path().join("readme.md"), "# outdated").unwrap();
    fs::write(dest.path().join("stale.log"), "old noise").unwrap();

    let server = Peer::bind(0).unwrap();
    let port = server.local_addr().unwrap().port();
    let client = Peer::bind(0).unwrap();

    let dest_root = dest.path().to_path_buf();
    let server_task = tokio::spawn(async move {
        let session = server.accept_one().await.unwrap().upgrade().unwrap();

        let mut local = DirectoryTree::scan(&dest_root).unwrap();
        local.hash_all().unwrap();

        let mut remote = session.receive_tree(&dest_root).await.unwrap();
        session.send_tree(&local).await.unwrap();

        let diffs = diff_trees(&mut local, &mut remote).unwrap();
        let expected = transfer_set(&diffs, &remote);
        for _ in 0..expected.len() {
            session.receive_file(&mut local).await.unwrap();
        }
        diffs
    });

    let session = client
        .connect("127.0.0.1", port)
        .await
        .unwrap()
        .upgrade()
        .unwrap();

    let mut local = DirectoryTree::scan(source.path()).unwrap();
    local.hash_all().unwrap();

    session.send_tree(&local).await.unwrap();
    let mut remote = session.receive_tree(source.path()).await.unwrap();

    let diffs = diff_trees(&mut remote, &mut local).unwrap();
    let to_send = transfer_set(&diffs, &local);
    assert!(!to_send.is_empty());

    for path in &to_send {
        let node = local.node(path).unwrap();
        session.send_file(&local, node, 8).await.unwrap();
    }

    let server_diffs = server_task.await.unwrap();

    // Both ends computed the identical diff over the identical tree pair.
    assert_eq!(server_diffs, diffs);

    // Every source file arrived intact.
    for rel in [
        "src/main.rs",
        "src/nested/mod.rs",
        "readme.md",
        "empty.dat",
    ] {
        assert_eq!(
            fs::read(dest.path().join(rel)).unwrap(),
            fs::read(source.path().join(rel)).unwrap(),
            "mismatch for {rel}"
        );
    }

    // The stale file was reported deleted but left alone by this policy.
    assert!(dest.path().join("stale.log").exists());
    assert!(diffs
        .iter()
        .any(|d| d.change == ChangeType::Deleted && d.path() == Path::new("stale.log")));
}

#[tokio::test]
async fn test_push_of_identical_trees_moves_nothing() {
    let source = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    for dir in [&source, &dest] {
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/same.txt"), "identical").unwrap();
    }

    let server = Peer::bind(0).unwrap();
    let port = server.local_addr().unwrap().port();
    let client = Peer::bind(0).unwrap();

    let dest_root = dest.path().to_path_buf();
    let server_task = tokio::spawn(async move {
        let session = server.accept_one().await.unwrap().upgrade().unwrap();
        let mut local = DirectoryTree::scan(&dest_root).unwrap();
        local.hash_all().unwrap();
        let mut remote = session.receive_tree(&dest_root).await.unwrap();
        session.send_tree(&local).await.unwrap();
        diff_trees(&mut local, &mut remote).unwrap()
    });

    let session = client
        .connect("127.0.0.1", port)
        .await
        .unwrap()
        .upgrade()
        .unwrap();
    let mut local = DirectoryTree::scan(source.path()).unwrap();
    local.hash_all().unwrap();
    session.send_tree(&local).await.unwrap();
    let mut remote = session.receive_tree(source.path()).await.unwrap();

    let diffs = diff_trees(&mut remote, &mut local).unwrap();
    assert!(diffs.is_empty());
    assert!(server_task.await.unwrap().is_empty());
}

#[tokio::test]
async fn test_sequential_transfers_on_one_session() {
    // No multiplexing: one logical operation completes before the next, and
    // a burst of file sends arrives fully delimited.
    let source = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    for i in 0..5 {
        fs::write(
            source.path().join(format!("file{i}.txt")),
            format!("body of file {i}"),
        )
        .unwrap();
    }

    let server = Peer::bind(0).unwrap();
    let port = server.local_addr().unwrap().port();
    let client = Peer::bind(0).unwrap();

    let dest_root = dest.path().to_path_buf();
    let server_task = tokio::spawn(async move {
        let session = server.accept_one().await.unwrap().upgrade().unwrap();
        let mut local = DirectoryTree::scan(&dest_root).unwrap();
        for _ in 0..5 {
            session.receive_file(&mut local).await.unwrap();
        }
        local
    });

    let session = client
        .connect("127.0.0.1", port)
        .await
        .unwrap()
        .upgrade()
        .unwrap();
    let local = DirectoryTree::scan(source.path()).unwrap();

    for i in 0..5 {
        let path = PathBuf::from(format!("file{i}.txt"));
        let node = local.node(&path).unwrap();
        session.send_file(&local, node, 4).await.unwrap();
    }

    let rebuilt = server_task.await.unwrap();
    assert_eq!(rebuilt.node_count(), 6); // root + five files
    for i in 0..5 {
        assert_eq!(
            fs::read_to_string(dest.path().join(format!("file{i}.txt"))).unwrap(),
            format!("body of file {i}")
        );
    }
}
