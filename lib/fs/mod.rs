//! The filesystem core: a lazily populated tree of remote paths and the open-file sessions on it.
/// Attribute translation and `setattr` validation.
pub mod attr;
/// Filesystem error kinds and their errno mapping.
pub mod error;
/// FUSE adapter: maps [`fuser::Filesystem`] callbacks onto [`tree::NodeTree`].
pub mod fuser;
/// Open-file sessions: ranged reads and read-modify-write uploads.
pub mod session;
/// The node tree and its inode arena.
pub mod tree;

pub use attr::{AttrChange, Attributes};
pub use error::FsError;
pub use session::FileSession;
pub use tree::{DirEntry, Node, NodeTree};

use bitflags::bitflags;

/// Type representing an inode identifier.
pub type InodeAddr = u64;

/// Type representing a file handle.
pub type FileHandle = u64;

/// Inode address of the mount root.
pub const ROOT_ADDR: InodeAddr = 1;

bitflags! {
    /// Permission bits for an inode, similar to Unix file permissions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InodePerms: u16 {
        /// Other: execute permission.
        const OTHER_EXECUTE = 1 << 0;
        /// Other: write permission.
        const OTHER_WRITE   = 1 << 1;
        /// Other: read permission.
        const OTHER_READ    = 1 << 2;

        /// Group: execute permission.
        const GROUP_EXECUTE = 1 << 3;
        /// Group: write permission.
        const GROUP_WRITE   = 1 << 4;
        /// Group: read permission.
        const GROUP_READ    = 1 << 5;

        /// Owner: execute permission.
        const OWNER_EXECUTE = 1 << 6;
        /// Owner: write permission.
        const OWNER_WRITE   = 1 << 7;
        /// Owner: read permission.
        const OWNER_READ    = 1 << 8;
    }
}

impl InodePerms {
    /// `0755`.
    pub const DIRECTORY_DEFAULT: Self = Self::from_bits_truncate(0o755);
    /// `0644`.
    pub const FILE_DEFAULT: Self = Self::from_bits_truncate(0o644);
    /// Every write bit.
    pub const ANY_WRITE: Self = Self::OWNER_WRITE
        .union(Self::GROUP_WRITE)
        .union(Self::OTHER_WRITE);

    /// Apply a umask.
    #[must_use]
    pub const fn masked(self, umask: u16) -> Self {
        Self::from_bits_truncate(self.bits() & !umask)
    }
}

bitflags! {
    /// Flags passed to `open(2)`, as far as this filesystem cares about them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: i32 {
        /// Open for writing only.
        const WRONLY = libc::O_WRONLY;
        /// Open for reading and writing.
        const RDWR = libc::O_RDWR;
        /// Append on each write.
        const APPEND = libc::O_APPEND;
        /// Truncate to zero length.
        const TRUNC = libc::O_TRUNC;
        /// Create file if it does not exist.
        const CREAT = libc::O_CREAT;
        /// Error if file already exists (with `CREAT`).
        const EXCL = libc::O_EXCL;

        // Keep the kernel's other bits intact when round-tripping.
        const _ = !0;
    }
}

/// Which directions a [`FileSession`] may transfer data in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// `O_RDONLY`.
    Read,
    /// `O_WRONLY`.
    Write,
    /// `O_RDWR`.
    ReadWrite,
}

impl OpenMode {
    /// Decode the access mode bits of `flags`.
    #[must_use]
    pub fn from_flags(flags: OpenFlags) -> Self {
        match flags.bits() & libc::O_ACCMODE {
            libc::O_WRONLY => Self::Write,
            libc::O_RDWR => Self::ReadWrite,
            _ => Self::Read,
        }
    }

    /// Whether reads are allowed.
    #[must_use]
    pub fn readable(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    /// Whether writes are allowed.
    #[must_use]
    pub fn writable(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

/// Kind of a node. The remote has no links or special files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// A regular file.
    File,
    /// A directory.
    Directory,
}

impl NodeKind {
    /// Kind of a remote listing entry.
    #[must_use]
    pub fn of_remote(is_dir: bool) -> Self {
        if is_dir { Self::Directory } else { Self::File }
    }
}

/// Mount-wide options that shape attributes and gate mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountOptions {
    /// Reject every mutating operation with `EROFS`.
    pub read_only: bool,
    /// Owner reported for every node.
    pub uid: u32,
    /// Group reported for every node.
    pub gid: u32,
    /// Mask applied to the default permission bits.
    pub umask: u16,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            uid: 0,
            gid: 0,
            umask: 0o022,
        }
    }
}

impl MountOptions {
    /// Permission bits reported for nodes of `kind`.
    #[must_use]
    pub fn perms_for(&self, kind: NodeKind) -> InodePerms {
        let base = match kind {
            NodeKind::Directory => InodePerms::DIRECTORY_DEFAULT,
            NodeKind::File => InodePerms::FILE_DEFAULT,
        };
        let perms = base.masked(self.umask);
        if self.read_only {
            perms.difference(InodePerms::ANY_WRITE)
        } else {
            perms
        }
    }
}

/// Filesystem statistics returned by [`tree::NodeTree::statfs`].
///
/// The drive does not report capacity, so block counts are synthetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FsStats {
    /// Filesystem block size (bytes).
    pub block_size: u32,
    /// Total number of data blocks.
    pub total_blocks: u64,
    /// Number of free blocks.
    pub free_blocks: u64,
    /// Number of blocks available to unprivileged users.
    pub available_blocks: u64,
    /// Number of inodes currently known.
    pub total_inodes: u64,
    /// Number of free file nodes.
    pub free_inodes: u64,
    /// Maximum filename length (bytes).
    pub max_filename_length: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_mode_decoding() {
        assert_eq!(
            OpenMode::from_flags(OpenFlags::from_bits_retain(libc::O_RDONLY)),
            OpenMode::Read
        );
        assert_eq!(
            OpenMode::from_flags(OpenFlags::WRONLY | OpenFlags::TRUNC),
            OpenMode::Write
        );
        let rw = OpenMode::from_flags(OpenFlags::RDWR | OpenFlags::APPEND);
        assert!(rw.readable() && rw.writable());
    }

    #[test]
    fn default_perms_follow_umask_and_read_only() {
        let rw = MountOptions::default();
        assert_eq!(rw.perms_for(NodeKind::Directory).bits(), 0o755);
        assert_eq!(rw.perms_for(NodeKind::File).bits(), 0o644);

        let strict = MountOptions {
            umask: 0o077,
            ..rw
        };
        assert_eq!(strict.perms_for(NodeKind::File).bits(), 0o600);

        let ro = MountOptions {
            read_only: true,
            ..rw
        };
        assert_eq!(ro.perms_for(NodeKind::File).bits(), 0o444);
        assert_eq!(ro.perms_for(NodeKind::Directory).bits(), 0o555);
    }
}
