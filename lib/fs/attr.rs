use std::time::SystemTime;

use super::{FsError, InodeAddr, InodePerms, MountOptions, NodeKind};

/// Attributes of one node, already shaped by the mount options.
///
/// The remote only knows size and modification time; everything else is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attributes {
    /// Inode address.
    pub addr: InodeAddr,
    /// File or directory.
    pub kind: NodeKind,
    /// Size in bytes.
    pub size: u64,
    /// Permission bits after umask and read-only masking.
    pub perms: InodePerms,
    /// Owner.
    pub uid: u32,
    /// Group.
    pub gid: u32,
    /// Reported as mtime, atime and ctime alike.
    pub modified_at: SystemTime,
}

impl Attributes {
    /// Derive attributes from the cached size and modification time.
    #[must_use]
    pub fn derive(
        addr: InodeAddr,
        kind: NodeKind,
        size: u64,
        modified_at: SystemTime,
        options: &MountOptions,
    ) -> Self {
        Self {
            addr,
            kind,
            size,
            perms: options.perms_for(kind),
            uid: options.uid,
            gid: options.gid,
            modified_at,
        }
    }

    /// Number of 512-byte blocks.
    #[must_use]
    pub fn blocks(&self) -> u64 {
        self.size.div_ceil(512)
    }

    /// Link count: directories report the conventional 2.
    #[must_use]
    pub fn nlink(&self) -> u32 {
        match self.kind {
            NodeKind::Directory => 2,
            NodeKind::File => 1,
        }
    }
}

/// The fields of a `setattr` request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttrChange {
    /// New mode bits.
    pub mode: Option<u32>,
    /// New owner.
    pub uid: Option<u32>,
    /// New group.
    pub gid: Option<u32>,
    /// New size.
    pub size: Option<u64>,
    /// Whether any timestamp was set.
    pub times: bool,
    /// New BSD flags.
    pub flags: Option<u32>,
}

impl AttrChange {
    /// Reject everything except a size change and return the requested size, if any.
    ///
    /// Timestamps riding along with a size change are accepted: the kernel attaches them to every
    /// truncate and the upload refreshes the modification time anyway.
    pub fn check(&self) -> Result<Option<u64>, FsError> {
        if self.mode.is_some() {
            return Err(FsError::NotSupported("mode"));
        }
        if self.uid.is_some() || self.gid.is_some() {
            return Err(FsError::NotSupported("ownership"));
        }
        if self.flags.is_some() {
            return Err(FsError::NotSupported("flags"));
        }
        if self.times && self.size.is_none() {
            return Err(FsError::NotSupported("timestamps"));
        }
        Ok(self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_follow_mount_options() {
        let options = MountOptions {
            read_only: false,
            uid: 1000,
            gid: 100,
            umask: 0o027,
        };
        let attrs = Attributes::derive(7, NodeKind::File, 1025, SystemTime::UNIX_EPOCH, &options);

        assert_eq!(attrs.perms.bits(), 0o640);
        assert_eq!((attrs.uid, attrs.gid), (1000, 100));
        assert_eq!(attrs.blocks(), 3);
        assert_eq!(attrs.nlink(), 1);
    }

    #[test]
    fn only_size_changes_pass() {
        let truncate = AttrChange {
            size: Some(0),
            times: true,
            ..AttrChange::default()
        };
        assert_eq!(truncate.check().ok(), Some(Some(0)));
        assert_eq!(AttrChange::default().check().ok(), Some(None));

        let chmod = AttrChange {
            mode: Some(0o600),
            ..AttrChange::default()
        };
        assert!(matches!(chmod.check(), Err(FsError::NotSupported("mode"))));

        let touch = AttrChange {
            times: true,
            ..AttrChange::default()
        };
        assert!(matches!(touch.check(), Err(FsError::NotSupported(_))));

        let chown = AttrChange {
            gid: Some(5),
            ..AttrChange::default()
        };
        assert_eq!(chown.check().map_err(|e| e.errno()), Err(libc::ENOTSUP));
    }
}
