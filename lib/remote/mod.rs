//! The remote object store seam.
//!
//! The filesystem core never speaks HTTP. It sees the drive through [`RemoteStore`]: five
//! whole-object operations on absolute, slash-separated paths. [`DriveStore`] is the production
//! implementation; [`memory::MemoryStore`] backs the test suite.

mod drive;
#[doc(hidden)]
pub mod memory;

pub use drive::DriveStore;

use std::future::Future;
use std::pin::Pin;
use std::time::SystemTime;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::AsyncRead;

/// A sequential stream over a remote object's bytes, starting at offset zero.
pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

/// One child reported by [`RemoteStore::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    /// Name within the listed directory.
    pub name: String,
    /// Whether the child is a directory.
    pub is_dir: bool,
    /// Size in bytes.
    pub size: u64,
    /// Last modification time as reported by the store.
    pub modified_at: SystemTime,
}

/// Failure of a remote operation.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The store has no object at this path.
    #[error("remote object not found: {path}")]
    NotFound {
        /// The path that was requested.
        path: String,
    },

    /// The store answered with a non-success status.
    #[error("remote store answered {status}: {message}")]
    Status {
        /// Numeric status code.
        status: u16,
        /// Whatever the store said about it.
        message: String,
    },

    /// A content stream broke mid-transfer.
    #[error("remote stream failed")]
    Stream(#[from] std::io::Error),

    /// The request never produced a status (connection, timeout, decoding, task failure).
    #[error("remote transport failed")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Whole-object operations on a remote drive.
///
/// Implementations are shared across every in-flight filesystem call, so each method takes
/// `&self` and must be safe to call concurrently.
pub trait RemoteStore: Send + Sync + 'static {
    /// List the direct children of the directory at `path`.
    fn list(
        &self,
        path: &str,
    ) -> impl Future<Output = Result<Vec<RemoteEntry>, RemoteError>> + Send;

    /// Open the object at `path` for sequential reading from its first byte.
    fn read(&self, path: &str) -> impl Future<Output = Result<ObjectReader, RemoteError>> + Send;

    /// Replace the object at `path` with `body`, creating it if absent.
    fn write_whole(
        &self,
        path: &str,
        body: Bytes,
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;

    /// Delete the object or directory at `path`.
    fn delete(&self, path: &str) -> impl Future<Output = Result<(), RemoteError>> + Send;

    /// Create a directory at `path`.
    fn make_directory(&self, path: &str) -> impl Future<Output = Result<(), RemoteError>> + Send;
}
