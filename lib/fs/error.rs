use thiserror::Error;

use crate::remote::RemoteError;

/// Why a filesystem operation failed.
#[derive(Debug, Error)]
pub enum FsError {
    /// The name is absent from the authoritative remote listing.
    #[error("no such file or directory")]
    NotFound,

    /// A directory operation was aimed at a file.
    #[error("not a directory")]
    NotADirectory,

    /// A file operation was aimed at a directory.
    #[error("is a directory")]
    IsADirectory,

    /// The mount is read-only.
    #[error("read-only filesystem")]
    ReadOnly,

    /// The requested attribute change cannot be expressed on the remote.
    #[error("unsupported attribute change: {0}")]
    NotSupported(&'static str),

    /// The node was removed from the tree after it was opened or looked up.
    #[error("stale file handle")]
    Stale,

    /// The caller gave up before the remote answered.
    #[error("operation cancelled")]
    Cancelled,

    /// The session was not opened for this direction, or no such handle exists.
    #[error("bad file handle")]
    BadHandle,

    /// The name cannot be represented on the remote.
    #[error("invalid file name")]
    InvalidName,

    /// A single transfer exceeds what one request can carry.
    #[error("file too large")]
    FileTooLarge,

    /// The remote operation failed.
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl FsError {
    /// The errno reported to the kernel.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotFound => libc::ENOENT,
            Self::NotADirectory => libc::ENOTDIR,
            Self::IsADirectory => libc::EISDIR,
            Self::ReadOnly => libc::EROFS,
            Self::NotSupported(_) => libc::ENOTSUP,
            Self::Stale => libc::ESTALE,
            Self::Cancelled => libc::EINTR,
            Self::BadHandle => libc::EBADF,
            Self::InvalidName => libc::EINVAL,
            Self::FileTooLarge => libc::EFBIG,
            Self::Remote(_) => libc::EIO,
        }
    }
}

impl From<FsError> for std::io::Error {
    fn from(err: FsError) -> Self {
        Self::from_raw_os_error(err.errno())
    }
}
