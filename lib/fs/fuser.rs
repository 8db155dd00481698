//! FUSE adapter: maps [`fuser::Filesystem`] callbacks onto a [`NodeTree`].
//!
//! Callbacks never block the FUSE session thread. Anything that may reach the remote is moved
//! onto the runtime as its own task and replies from there, so slow requests do not hold up the
//! rest of the mount.

use std::ffi::OsStr;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument as _, debug, instrument, warn};

use super::tree::{DirEntry, NodeTree};
use super::{AttrChange, Attributes, FileHandle, FileSession, FsError, NodeKind, OpenFlags};
use crate::remote::RemoteStore;

/// How long the kernel may cache attributes and entries before asking again.
const ATTR_TTL: Duration = Duration::from_secs(1);

const BLOCK_SIZE: u32 = 4096;

/// Every open file bypasses the page cache, so reads and writes always reach the session.
const OPEN_FLAGS: u32 = fuser::consts::FOPEN_DIRECT_IO;

/// Trait abstracting the `.error(errno)` method common to all fuser reply types.
trait FuseReply {
    fn error(self, errno: i32);
}

macro_rules! impl_fuse_reply {
    ($($ty:ty),* $(,)?) => {
        $(impl FuseReply for $ty {
            fn error(self, errno: i32) {
                // Calls the inherent fuser method (not this trait method).
                self.error(errno);
            }
        })*
    };
}

impl_fuse_reply!(
    fuser::ReplyEntry,
    fuser::ReplyAttr,
    fuser::ReplyCreate,
    fuser::ReplyDirectory,
    fuser::ReplyOpen,
    fuser::ReplyData,
    fuser::ReplyWrite,
    fuser::ReplyEmpty,
);

/// Send either the success reply or the error's errno.
trait FuseResultExt<T> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R));
}

impl<T> FuseResultExt<T> for Result<T, FsError> {
    fn fuse_reply<R: FuseReply>(self, reply: R, on_ok: impl FnOnce(T, R)) {
        match self {
            Ok(val) => on_ok(val, reply),
            Err(FsError::Remote(e)) => {
                warn!(error = %e, "remote operation failed");
                reply.error(libc::EIO);
            }
            Err(e) => {
                debug!(error = %e, "replying error");
                reply.error(e.errno());
            }
        }
    }
}

fn to_file_attr(attrs: &Attributes) -> fuser::FileAttr {
    fuser::FileAttr {
        ino: attrs.addr,
        size: attrs.size,
        blocks: attrs.blocks(),
        atime: attrs.modified_at,
        mtime: attrs.modified_at,
        ctime: attrs.modified_at,
        crtime: attrs.modified_at,
        kind: to_file_type(attrs.kind),
        perm: attrs.perms.bits(),
        nlink: attrs.nlink(),
        uid: attrs.uid,
        gid: attrs.gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

fn to_file_type(kind: NodeKind) -> fuser::FileType {
    match kind {
        NodeKind::Directory => fuser::FileType::Directory,
        NodeKind::File => fuser::FileType::RegularFile,
    }
}

/// State shared by every in-flight callback.
struct Shared<S: RemoteStore> {
    tree: Arc<NodeTree<S>>,
    files: scc::HashMap<FileHandle, Arc<FileSession<S>>>,
    listings: scc::HashMap<FileHandle, Arc<[DirEntry]>>,
    next_fh: AtomicU64,
}

impl<S: RemoteStore> Shared<S> {
    fn allocate_fh(&self) -> FileHandle {
        self.next_fh.fetch_add(1, Ordering::Relaxed)
    }

    fn open_session(&self, session: FileSession<S>) -> FileHandle {
        let fh = self.allocate_fh();
        // Handles are never reused, so the slot is always free.
        let _ = self.files.insert_sync(fh, Arc::new(session));
        fh
    }

    fn session(&self, fh: FileHandle) -> Result<Arc<FileSession<S>>, FsError> {
        self.files
            .read_sync(&fh, |_, session| Arc::clone(session))
            .ok_or(FsError::BadHandle)
    }
}

/// Bridges a [`NodeTree`] to the [`fuser::Filesystem`] trait.
pub struct FuserAdapter<S: RemoteStore> {
    shared: Arc<Shared<S>>,
    runtime: tokio::runtime::Handle,
    shutdown: CancellationToken,
}

impl<S: RemoteStore> FuserAdapter<S> {
    /// Serve `tree`, running remote work on `runtime`.
    ///
    /// Each callback gets a child of `shutdown`; cancelling it abandons every pending call.
    pub fn new(
        tree: Arc<NodeTree<S>>,
        runtime: tokio::runtime::Handle,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                tree,
                files: scc::HashMap::new(),
                listings: scc::HashMap::new(),
                next_fh: AtomicU64::new(1),
            }),
            runtime,
            shutdown,
        }
    }

    /// Run `work` on the runtime inside the current span.
    fn dispatch<F, Fut>(&self, work: F)
    where
        F: FnOnce(Arc<Shared<S>>, CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let task = work(Arc::clone(&self.shared), self.shutdown.child_token());
        self.runtime.spawn(task.in_current_span());
    }
}

impl<S: RemoteStore> fuser::Filesystem for FuserAdapter<S> {
    #[instrument(name = "FuserAdapter::lookup", skip(self, _req, reply))]
    fn lookup(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEntry,
    ) {
        // A name the remote cannot hold cannot exist there.
        let Some(name) = name.to_str().map(str::to_owned) else {
            reply.error(libc::ENOENT);
            return;
        };
        self.dispatch(|shared, cancel| async move {
            let result = async {
                let parent = shared.tree.node(parent)?;
                let node = shared.tree.lookup(&parent, &name, &cancel).await?;
                shared.tree.remember(&node);
                Ok::<_, FsError>(shared.tree.getattr(&node))
            }
            .await;
            result.fuse_reply(reply, |attrs, reply| {
                reply.entry(&ATTR_TTL, &to_file_attr(&attrs), 0);
            });
        });
    }

    #[instrument(name = "FuserAdapter::forget", skip(self, _req))]
    fn forget(&mut self, _req: &fuser::Request<'_>, ino: u64, nlookup: u64) {
        self.shared.tree.forget(ino, nlookup);
    }

    #[instrument(name = "FuserAdapter::getattr", skip(self, _req, _fh, reply))]
    fn getattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _fh: Option<u64>,
        reply: fuser::ReplyAttr,
    ) {
        let tree = &self.shared.tree;
        tree.node(ino)
            .map(|node| tree.getattr(&node))
            .fuse_reply(reply, |attrs, reply| {
                reply.attr(&ATTR_TTL, &to_file_attr(&attrs));
            });
    }

    #[instrument(
        name = "FuserAdapter::setattr",
        skip(self, _req, atime, mtime, ctime, _fh, crtime, chgtime, bkuptime, reply)
    )]
    fn setattr(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<fuser::TimeOrNow>,
        mtime: Option<fuser::TimeOrNow>,
        ctime: Option<SystemTime>,
        _fh: Option<u64>,
        crtime: Option<SystemTime>,
        chgtime: Option<SystemTime>,
        bkuptime: Option<SystemTime>,
        flags: Option<u32>,
        reply: fuser::ReplyAttr,
    ) {
        let change = AttrChange {
            mode,
            uid,
            gid,
            size,
            times: atime.is_some()
                || mtime.is_some()
                || ctime.is_some()
                || crtime.is_some()
                || chgtime.is_some()
                || bkuptime.is_some(),
            flags,
        };
        self.dispatch(|shared, cancel| async move {
            let result = async {
                let node = shared.tree.node(ino)?;
                match change.check()? {
                    Some(size) => shared.tree.truncate(&node, size, &cancel).await,
                    None => Ok(shared.tree.getattr(&node)),
                }
            }
            .await;
            result.fuse_reply(reply, |attrs, reply| {
                reply.attr(&ATTR_TTL, &to_file_attr(&attrs));
            });
        });
    }

    #[instrument(name = "FuserAdapter::mkdir", skip(self, _req, _mode, _umask, reply))]
    fn mkdir(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: fuser::ReplyEntry,
    ) {
        let Some(name) = name.to_str().map(str::to_owned) else {
            reply.error(libc::EINVAL);
            return;
        };
        self.dispatch(|shared, cancel| async move {
            let result = async {
                let parent = shared.tree.node(parent)?;
                let node = shared.tree.mkdir(&parent, &name, &cancel).await?;
                shared.tree.remember(&node);
                Ok::<_, FsError>(shared.tree.getattr(&node))
            }
            .await;
            result.fuse_reply(reply, |attrs, reply| {
                reply.entry(&ATTR_TTL, &to_file_attr(&attrs), 0);
            });
        });
    }

    #[instrument(name = "FuserAdapter::unlink", skip(self, _req, reply))]
    fn unlink(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        self.remove(parent, name, reply);
    }

    #[instrument(name = "FuserAdapter::rmdir", skip(self, _req, reply))]
    fn rmdir(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        reply: fuser::ReplyEmpty,
    ) {
        self.remove(parent, name, reply);
    }

    #[instrument(name = "FuserAdapter::open", skip(self, _req, reply))]
    fn open(&mut self, _req: &fuser::Request<'_>, ino: u64, flags: i32, reply: fuser::ReplyOpen) {
        let flags = OpenFlags::from_bits_retain(flags);
        let shared = &self.shared;
        shared
            .tree
            .node(ino)
            .and_then(|node| shared.tree.open(&node, flags))
            .map(|session| shared.open_session(session))
            .fuse_reply(reply, |fh, reply| {
                debug!(handle = fh, "replying...");
                reply.opened(fh, OPEN_FLAGS);
            });
    }

    #[instrument(
        name = "FuserAdapter::read",
        skip(self, _req, _ino, _flags, _lock_owner, reply)
    )]
    fn read(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyData,
    ) {
        self.dispatch(|shared, cancel| async move {
            let result = async {
                let session = shared.session(fh)?;
                session.read(offset.cast_unsigned(), size, &cancel).await
            }
            .await;
            result.fuse_reply(reply, |data, reply| {
                debug!(read_bytes = data.len(), "replying...");
                reply.data(&data);
            });
        });
    }

    #[instrument(
        name = "FuserAdapter::write",
        skip(self, _req, _ino, data, _write_flags, _flags, _lock_owner, reply),
        fields(len = data.len())
    )]
    fn write(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: fuser::ReplyWrite,
    ) {
        let data = Bytes::copy_from_slice(data);
        self.dispatch(|shared, cancel| async move {
            let result = async {
                let session = shared.session(fh)?;
                session.write(offset.cast_unsigned(), data, &cancel).await
            }
            .await;
            result.fuse_reply(reply, |written, reply| reply.written(written));
        });
    }

    #[instrument(name = "FuserAdapter::flush", skip(self, _req, _ino, _lock_owner, reply))]
    fn flush(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        reply: fuser::ReplyEmpty,
    ) {
        // Writes are uploaded before they are acknowledged; there is never anything to flush.
        self.shared.session(fh).fuse_reply(reply, |_, reply| reply.ok());
    }

    #[instrument(name = "FuserAdapter::fsync", skip(self, _req, _ino, _datasync, reply))]
    fn fsync(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _datasync: bool,
        reply: fuser::ReplyEmpty,
    ) {
        self.shared.session(fh).fuse_reply(reply, |_, reply| reply.ok());
    }

    #[instrument(
        name = "FuserAdapter::release",
        skip(self, _req, _ino, _flags, _lock_owner, _flush, reply)
    )]
    fn release(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        if self.shared.files.remove_sync(&fh).is_some() {
            reply.ok();
        } else {
            debug!("file handle not open, replying error");
            reply.error(libc::EBADF);
        }
    }

    #[instrument(name = "FuserAdapter::opendir", skip(self, _req, _flags, reply))]
    fn opendir(
        &mut self,
        _req: &fuser::Request<'_>,
        ino: u64,
        _flags: i32,
        reply: fuser::ReplyOpen,
    ) {
        self.dispatch(|shared, cancel| async move {
            let result = async {
                let dir = shared.tree.node(ino)?;
                let entries = shared.tree.readdir(&dir, &cancel).await?;
                let fh = shared.allocate_fh();
                let _ = shared.listings.insert_sync(fh, Arc::from(entries));
                Ok::<_, FsError>(fh)
            }
            .await;
            result.fuse_reply(reply, |fh, reply| reply.opened(fh, 0));
        });
    }

    #[instrument(name = "FuserAdapter::readdir", skip(self, _req, _ino, reply))]
    fn readdir(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        mut reply: fuser::ReplyDirectory,
    ) {
        let Some(listing) = self
            .shared
            .listings
            .read_sync(&fh, |_, listing| Arc::clone(listing))
        else {
            reply.error(libc::EBADF);
            return;
        };

        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        for (idx, entry) in listing.iter().enumerate().skip(start) {
            let Ok(next) = i64::try_from(idx + 1) else {
                break;
            };
            if reply.add(entry.addr, next, to_file_type(entry.kind), &entry.name) {
                debug!("buffer full for now, stopping readdir");
                break;
            }
        }
        reply.ok();
    }

    #[instrument(name = "FuserAdapter::releasedir", skip(self, _req, _ino, _flags, reply))]
    fn releasedir(
        &mut self,
        _req: &fuser::Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        reply: fuser::ReplyEmpty,
    ) {
        self.shared.listings.remove_sync(&fh);
        reply.ok();
    }

    #[instrument(name = "FuserAdapter::create", skip(self, _req, _mode, _umask, reply))]
    fn create(
        &mut self,
        _req: &fuser::Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        let Some(name) = name.to_str().map(str::to_owned) else {
            reply.error(libc::EINVAL);
            return;
        };
        let flags = OpenFlags::from_bits_retain(flags);
        self.dispatch(|shared, cancel| async move {
            let result = async {
                let parent = shared.tree.node(parent)?;
                let node = shared.tree.create(&parent, &name, &cancel).await?;
                let session = shared.tree.open(&node, flags)?;
                let fh = shared.open_session(session);
                shared.tree.remember(&node);
                Ok::<_, FsError>((shared.tree.getattr(&node), fh))
            }
            .await;
            result.fuse_reply(reply, |(attrs, fh), reply| {
                reply.created(&ATTR_TTL, &to_file_attr(&attrs), 0, fh, OPEN_FLAGS);
            });
        });
    }

    #[instrument(name = "FuserAdapter::statfs", skip(self, _req, _ino, reply))]
    fn statfs(&mut self, _req: &fuser::Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        let stats = self.shared.tree.statfs();
        debug!(?stats, "replying...");
        reply.statfs(
            stats.total_blocks,
            stats.free_blocks,
            stats.available_blocks,
            stats.total_inodes,
            stats.free_inodes,
            stats.block_size,
            stats.max_filename_length,
            stats.block_size,
        );
    }

    fn destroy(&mut self) {
        debug!("filesystem destroyed, abandoning in-flight calls");
        self.shutdown.cancel();
    }
}

impl<S: RemoteStore> FuserAdapter<S> {
    fn remove(&self, parent: u64, name: &OsStr, reply: fuser::ReplyEmpty) {
        let Some(name) = name.to_str().map(str::to_owned) else {
            reply.error(libc::ENOENT);
            return;
        };
        self.dispatch(|shared, cancel| async move {
            let result = async {
                let parent = shared.tree.node(parent)?;
                shared.tree.remove(&parent, &name, &cancel).await
            }
            .await;
            result.fuse_reply(reply, |(), reply| reply.ok());
        });
    }
}
