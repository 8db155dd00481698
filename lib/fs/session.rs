//! Open-file sessions.
//!
//! The drive only moves whole objects, so a ranged read streams the object and skips up to the
//! offset, and every write re-uploads the retained prefix followed by the new bytes. Nothing is
//! buffered between calls: each read and each write is a full round trip.

use std::sync::Arc;
use std::time::SystemTime;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt as _};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::tree::{Node, run_detached};
use super::{FsError, OpenMode};
use crate::remote::{ObjectReader, RemoteError, RemoteStore};

/// An open file: a node, the directions it was opened for and the store to reach it through.
pub struct FileSession<S: RemoteStore> {
    node: Arc<Node>,
    mode: OpenMode,
    store: Arc<S>,
    read_only: bool,
}

impl<S: RemoteStore> std::fmt::Debug for FileSession<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSession")
            .field("node", &self.node)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl<S: RemoteStore> FileSession<S> {
    pub(crate) fn new(node: Arc<Node>, mode: OpenMode, store: Arc<S>, read_only: bool) -> Self {
        Self {
            node,
            mode,
            store,
            read_only,
        }
    }

    /// The file this session is open on.
    #[must_use]
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Directions the session was opened for.
    #[must_use]
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Read up to `len` bytes starting at `offset`.
    ///
    /// Returns fewer bytes at end of file and nothing at all past it.
    #[instrument(name = "FileSession::read", skip(self, cancel), fields(path = %self.node.path()))]
    pub async fn read(
        &self,
        offset: u64,
        len: u32,
        cancel: &CancellationToken,
    ) -> Result<Bytes, FsError> {
        self.ensure_live()?;
        if !self.mode.readable() {
            return Err(FsError::BadHandle);
        }
        if len == 0 {
            return Ok(Bytes::new());
        }

        let store = Arc::clone(&self.store);
        let path = self.node.path().to_owned();
        run_detached(cancel, async move {
            let mut reader = store.read(&path).await?;
            Ok::<_, RemoteError>(read_range(&mut reader, offset, len).await?)
        })
        .await
    }

    /// Write `data` at `offset` by re-uploading the whole object.
    ///
    /// The uploaded object is the first `offset` bytes of the current one followed by `data`.
    /// If the object is shorter than `offset` the gap is not zero-filled: `data` lands right
    /// after the existing bytes. Once the upload has succeeded the cached size becomes
    /// `offset + data.len()`, whatever the remote now holds.
    #[instrument(
        name = "FileSession::write",
        skip(self, data, cancel),
        fields(path = %self.node.path(), len = data.len())
    )]
    pub async fn write(
        &self,
        offset: u64,
        data: Bytes,
        cancel: &CancellationToken,
    ) -> Result<u32, FsError> {
        self.ensure_live()?;
        if self.read_only {
            return Err(FsError::ReadOnly);
        }
        if !self.mode.writable() {
            return Err(FsError::BadHandle);
        }
        let written = u32::try_from(data.len()).map_err(|_| FsError::FileTooLarge)?;

        let store = Arc::clone(&self.store);
        let path = self.node.path().to_owned();
        let size = offset.saturating_add(u64::from(written));
        let uploaded = run_detached(cancel, async move {
            let prefix = if offset > 0 {
                read_prefix(store.read(&path).await?, offset).await?
            } else {
                Bytes::new()
            };
            let body = reconstruct(&prefix, &data);
            let len = body.len() as u64;
            store.write_whole(&path, body).await?;
            Ok::<_, RemoteError>(len)
        })
        .await?;

        debug!(uploaded, size, "object replaced");
        self.node.record(size, SystemTime::now());
        Ok(written)
    }

    fn ensure_live(&self) -> Result<(), FsError> {
        if self.node.is_detached() {
            Err(FsError::Stale)
        } else {
            Ok(())
        }
    }
}

/// Skip `offset` bytes of `reader`, then read up to `len` more.
pub(crate) async fn read_range<R: AsyncRead + Unpin>(
    reader: &mut R,
    offset: u64,
    len: u32,
) -> std::io::Result<Bytes> {
    if offset > 0 {
        let mut skip = (&mut *reader).take(offset);
        let skipped = tokio::io::copy(&mut skip, &mut tokio::io::sink()).await?;
        if skipped < offset {
            return Ok(Bytes::new());
        }
    }

    let mut buf = Vec::new();
    reader.take(u64::from(len)).read_to_end(&mut buf).await?;
    Ok(Bytes::from(buf))
}

/// Read at most the first `limit` bytes of an object.
pub(crate) async fn read_prefix(reader: ObjectReader, limit: u64) -> std::io::Result<Bytes> {
    let mut buf = Vec::new();
    reader.take(limit).read_to_end(&mut buf).await?;
    Ok(Bytes::from(buf))
}

/// The object body for a write: the retained prefix, then the new bytes.
fn reconstruct(prefix: &[u8], data: &[u8]) -> Bytes {
    let mut body = BytesMut::with_capacity(prefix.len() + data.len());
    body.extend_from_slice(prefix);
    body.extend_from_slice(data);
    body.freeze()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::io::Cursor;

    use super::*;

    #[tokio::test]
    async fn range_is_clipped_at_end_of_object() {
        let mut reader = Cursor::new(b"0123456789".to_vec());
        let bytes = read_range(&mut reader, 7, 10).await.unwrap();
        assert_eq!(bytes.as_ref(), b"789");
    }

    #[tokio::test]
    async fn range_past_end_is_empty() {
        let mut reader = Cursor::new(b"0123".to_vec());
        assert!(read_range(&mut reader, 9, 4).await.unwrap().is_empty());

        let mut reader = Cursor::new(b"0123".to_vec());
        assert!(read_range(&mut reader, 4, 4).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn prefix_stops_at_limit_or_end() {
        let reader: ObjectReader = Box::pin(Cursor::new(b"0123456789".to_vec()));
        assert_eq!(read_prefix(reader, 4).await.unwrap().as_ref(), b"0123");

        let reader: ObjectReader = Box::pin(Cursor::new(b"ab".to_vec()));
        assert_eq!(read_prefix(reader, 4).await.unwrap().as_ref(), b"ab");
    }

    #[test]
    fn reconstruction_appends_after_prefix() {
        assert_eq!(reconstruct(b"0123", b"XY").as_ref(), b"0123XY");
        assert_eq!(reconstruct(b"", b"new").as_ref(), b"new");
    }
}
