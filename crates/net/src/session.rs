//! Per-connection session: framed tree exchange and chunked file transfer
//!
//! A session owns one [`TcpStream`] and enforces at-most-one in-flight
//! logical operation. The stream lives behind an async mutex whose FIFO
//! lock queue serializes callers; a [`CancellationToken`] models the close
//! cascade, so an in-flight operation fails at its next suspension point
//! when the session is closed from outside.
//!
//! Outer framing is big-endian throughout: `u64` length prefixes around
//! tree payloads and file headers, `u32` prefixes on file chunks.

use std::io::{self, Cursor};
use std::path::{Component, Path};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use bytes::{BufMut, BytesMut};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use treesync_core::tree::from_wire_path;
use treesync_core::{decode_tree, encode_tree, wire, DirectoryTree, Node};

use crate::error::Error;
use crate::{MAX_FILE_CHUNK_SIZE, MAX_TREE_SIZE};

/// Callback fired exactly once when the session closes.
pub type OnClose = Box<dyn FnOnce() + Send>;

pub struct Session {
    io: Mutex<Option<TcpStream>>,
    cancel: CancellationToken,
    closed: AtomicBool,
    on_close: StdMutex<Option<OnClose>>,
}

impl Session {
    /// Wrap an established stream in a session.
    #[must_use]
    pub fn new(stream: TcpStream, on_close: Option<OnClose>) -> Arc<Self> {
        Arc::new(Self {
            io: Mutex::new(Some(stream)),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            on_close: StdMutex::new(on_close),
        })
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the session: fail any in-flight operation at its next
    /// suspension point, drop the socket, and fire the on-close callback.
    /// Idempotent; the callback runs at most once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();

        // Drop the socket now if no operation holds it; otherwise the
        // failing operation drops it on unwind.
        if let Ok(mut io) = self.io.try_lock() {
            io.take();
        }

        let callback = self
            .on_close
            .lock()
            .expect("on_close lock poisoned")
            .take();
        if let Some(callback) = callback {
            callback();
        }
        debug!("session closed");
    }

    /// Serialize a tree and send it as one length-prefixed frame.
    ///
    /// The `u64` length and the payload are assembled into a single buffer
    /// and written with one gather write for framing integrity.
    ///
    /// # Errors
    /// Any failure tears the session down before returning.
    pub async fn send_tree(&self, tree: &DirectoryTree) -> Result<(), Error> {
        let mut io = self.io.lock().await;
        let Some(stream) = io.as_mut() else {
            return Err(Error::SessionClosed);
        };

        let result = tokio::select! {
            () = self.cancel.cancelled() => Err(Error::SessionClosed),
            r = write_tree(stream, tree) => r,
        };
        self.teardown_on_error(io, result)
    }

    /// Receive one length-prefixed tree frame and deserialize it.
    ///
    /// The returned tree adopts `root_path` as its scan root, typically the
    /// local tree's root.
    ///
    /// # Errors
    /// [`Error::TreeTooLarge`] if the announced payload exceeds
    /// [`MAX_TREE_SIZE`]; any failure tears the session down.
    pub async fn receive_tree(&self, root_path: &Path) -> Result<DirectoryTree, Error> {
        let mut io = self.io.lock().await;
        let Some(stream) = io.as_mut() else {
            return Err(Error::SessionClosed);
        };

        let result = tokio::select! {
            () = self.cancel.cancelled() => Err(Error::SessionClosed),
            r = read_tree(stream, root_path) => r,
        };
        self.teardown_on_error(io, result)
    }

    /// Send one file's content: a `{rel_path, size}` header frame followed
    /// by length-prefixed chunks of at most `chunk_size` bytes.
    ///
    /// The final chunk may be short; a zero-size file sends no chunks.
    ///
    /// # Errors
    /// [`Error::InvalidChunkSize`] for an out-of-range `chunk_size`; any
    /// failure tears the session down.
    pub async fn send_file(
        &self,
        tree: &DirectoryTree,
        node: &Node,
        chunk_size: u32,
    ) -> Result<(), Error> {
        if chunk_size == 0 || chunk_size > MAX_FILE_CHUNK_SIZE {
            return Err(Error::InvalidChunkSize(chunk_size));
        }

        let mut io = self.io.lock().await;
        let Some(stream) = io.as_mut() else {
            return Err(Error::SessionClosed);
        };

        let result = tokio::select! {
            () = self.cancel.cancelled() => Err(Error::SessionClosed),
            r = write_file(stream, tree, node, chunk_size) => r,
        };
        self.teardown_on_error(io, result)
    }

    /// Receive one file transfer into `tree.root_path()/rel_path`, creating
    /// parent directories and truncating any prior content, then rebuild
    /// the tree from disk.
    ///
    /// # Errors
    /// Protocol violations (`HeaderTooLarge`, `ChunkTooLarge`,
    /// `InvalidPath`), `ShortRead`, or `WriteFailed`; any failure tears the
    /// session down.
    pub async fn receive_file(&self, tree: &mut DirectoryTree) -> Result<(), Error> {
        let mut io = self.io.lock().await;
        let Some(stream) = io.as_mut() else {
            return Err(Error::SessionClosed);
        };

        let result = tokio::select! {
            () = self.cancel.cancelled() => Err(Error::SessionClosed),
            r = read_file(stream, tree) => r,
        };
        self.teardown_on_error(io, result)
    }

    /// On failure, drop the socket and close the session; the error still
    /// reaches the caller.
    fn teardown_on_error<T>(
        &self,
        mut io: tokio::sync::MutexGuard<'_, Option<TcpStream>>,
        result: Result<T, Error>,
    ) -> Result<T, Error> {
        if result.is_err() {
            io.take();
            drop(io);
            self.close();
        }
        result
    }
}

async fn write_tree(stream: &mut TcpStream, tree: &DirectoryTree) -> Result<(), Error> {
    let payload = encode_tree(tree)?;

    let mut frame = BytesMut::with_capacity(8 + payload.len());
    frame.put_u64(payload.len() as u64);
    frame.extend_from_slice(&payload);
    stream.write_all(&frame).await?;

    debug!(bytes = payload.len(), "sent tree");
    Ok(())
}

async fn read_tree(stream: &mut TcpStream, root_path: &Path) -> Result<DirectoryTree, Error> {
    let size = read_u64(stream).await?;
    if size > MAX_TREE_SIZE {
        return Err(Error::TreeTooLarge(size));
    }

    let mut payload = vec![0u8; size as usize];
    read_exact(stream, &mut payload).await?;

    let tree = decode_tree(&payload, root_path)?;
    debug!(bytes = size, nodes = tree.node_count(), "received tree");
    Ok(tree)
}

async fn write_file(
    stream: &mut TcpStream,
    tree: &DirectoryTree,
    node: &Node,
    chunk_size: u32,
) -> Result<(), Error> {
    let Some(file_size) = node.file_size() else {
        return Err(Error::Tree(treesync_core::Error::NotAFile(
            node.path().to_path_buf(),
        )));
    };
    let mut file = File::open(tree.root_path().join(node.path())).await?;

    let mut header = Vec::new();
    wire::write_string(&mut header, &node.wire_path())?;
    wire::write_u64(&mut header, file_size)?;

    let mut frame = BytesMut::with_capacity(8 + header.len());
    frame.put_u64(header.len() as u64);
    frame.extend_from_slice(&header);
    stream.write_all(&frame).await?;

    let mut buf = vec![0u8; file_size.min(u64::from(chunk_size)) as usize];
    let mut remaining = file_size;
    while remaining > 0 {
        let to_read = remaining.min(u64::from(chunk_size)) as usize;
        file.read_exact(&mut buf[..to_read]).await?;

        stream.write_all(&(to_read as u32).to_be_bytes()).await?;
        stream.write_all(&buf[..to_read]).await?;
        remaining -= to_read as u64;
    }

    debug!(path = %node.wire_path(), bytes = file_size, "sent file");
    Ok(())
}

async fn read_file(stream: &mut TcpStream, tree: &mut DirectoryTree) -> Result<(), Error> {
    let header_size = read_u64(stream).await?;
    if header_size > u64::from(MAX_FILE_CHUNK_SIZE) {
        return Err(Error::HeaderTooLarge(header_size));
    }

    let mut header = vec![0u8; header_size as usize];
    read_exact(stream, &mut header).await?;

    let mut cursor = Cursor::new(header.as_slice());
    let rel = wire::read_string(&mut cursor).map_err(header_err)?;
    let file_size = wire::read_u64(&mut cursor).map_err(header_err)?;

    let rel_path = from_wire_path(&rel);
    if rel_path.as_os_str().is_empty()
        || rel_path
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(Error::InvalidPath(rel_path));
    }

    let abs_path = tree.root_path().join(&rel_path);
    if let Some(parent) = abs_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(Error::WriteFailed)?;
    }
    let mut file = File::create(&abs_path).await.map_err(Error::WriteFailed)?;

    let mut chunk = Vec::new();
    let mut received = 0u64;
    while received < file_size {
        let chunk_len = read_u32(stream).await?;
        if chunk_len == 0
            || chunk_len > MAX_FILE_CHUNK_SIZE
            || u64::from(chunk_len) > file_size - received
        {
            return Err(Error::ChunkTooLarge(chunk_len));
        }

        chunk.resize(chunk_len as usize, 0);
        read_exact(stream, &mut chunk).await?;
        file.write_all(&chunk).await.map_err(Error::WriteFailed)?;
        received += u64::from(chunk_len);
    }
    file.flush().await.map_err(Error::WriteFailed)?;
    drop(file);

    // The on-disk content changed underneath the tree; rebuild it.
    let root = tree.root_path().to_path_buf();
    *tree = DirectoryTree::scan(root)?;
    debug!(path = %rel_path.display(), bytes = file_size, "received file");
    Ok(())
}

async fn read_u32(stream: &mut TcpStream) -> Result<u32, Error> {
    let mut buf = [0u8; 4];
    read_exact(stream, &mut buf).await?;
    Ok(u32::from_be_bytes(buf))
}

async fn read_u64(stream: &mut TcpStream) -> Result<u64, Error> {
    let mut buf = [0u8; 8];
    read_exact(stream, &mut buf).await?;
    Ok(u64::from_be_bytes(buf))
}

/// Socket reads surface connection loss as [`Error::ShortRead`].
async fn read_exact(stream: &mut TcpStream, buf: &mut [u8]) -> Result<(), Error> {
    stream.read_exact(buf).await.map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => Error::ShortRead,
        _ => Error::Io(e),
    })?;
    Ok(())
}

/// Header parse failures: truncation is a short read, anything else is a
/// tree-codec failure.
fn header_err(e: treesync_core::Error) -> Error {
    match e {
        treesync_core::Error::ShortRead => Error::ShortRead,
        other => Error::Tree(other),
    }
}
