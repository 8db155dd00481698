//! A lazily populated mirror of the remote directory tree.
//!
//! Every [`Node`] is created on first sight (a lookup miss, a listing, a create) and lives in
//! the inode arena until it is both detached from the tree and forgotten by the kernel. Each
//! directory guards its children with its own lock, so traffic in one directory never waits on
//! another. Remote calls run on detached tasks: a caller that gives up stops waiting, but the
//! remote operation runs to completion and only the cache update is skipped.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::SystemTime;

use bytes::{Bytes, BytesMut};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument as _, debug, info, instrument, trace};

use super::session::{self, FileSession};
use super::{
    Attributes, FsError, FsStats, InodeAddr, MountOptions, NodeKind, OpenFlags, OpenMode,
    ROOT_ADDR,
};
use crate::remote::{RemoteError, RemoteStore};

/// Block size reported by `statfs`.
const BLOCK_SIZE: u32 = 4096;

/// Synthetic capacity reported by `statfs` (1 TiB); the drive does not expose quotas.
const SYNTHETIC_BLOCKS: u64 = (1 << 40) / BLOCK_SIZE as u64;

const MAX_NAME_LEN: u32 = 255;

#[derive(Debug, Clone, Copy)]
struct NodeMeta {
    size: u64,
    modified_at: SystemTime,
}

/// One file or directory of the mounted tree.
pub struct Node {
    addr: InodeAddr,
    path: String,
    kind: NodeKind,
    meta: RwLock<NodeMeta>,
    children: RwLock<BTreeMap<String, Arc<Node>>>,
    detached: AtomicBool,
    /// Outstanding kernel lookup references.
    lookups: AtomicU64,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("addr", &self.addr)
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("detached", &self.is_detached())
            .finish_non_exhaustive()
    }
}

impl Node {
    fn new(
        addr: InodeAddr,
        path: String,
        kind: NodeKind,
        size: u64,
        modified_at: SystemTime,
    ) -> Self {
        Self {
            addr,
            path,
            kind,
            meta: RwLock::new(NodeMeta { size, modified_at }),
            children: RwLock::new(BTreeMap::new()),
            detached: AtomicBool::new(false),
            lookups: AtomicU64::new(0),
        }
    }

    /// Inode address.
    #[must_use]
    pub fn addr(&self) -> InodeAddr {
        self.addr
    }

    /// Absolute remote path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// File or directory.
    #[must_use]
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Cached size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.read_meta().size
    }

    /// Cached modification time.
    #[must_use]
    pub fn modified_at(&self) -> SystemTime {
        self.read_meta().modified_at
    }

    /// Whether the node has been dropped from the tree.
    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    /// The cached child called `name`, without touching the remote.
    #[must_use]
    pub fn cached_child(&self, name: &str) -> Option<Arc<Self>> {
        self.read_children().get(name).cloned()
    }

    /// Names of the cached children, in order.
    #[must_use]
    pub fn cached_names(&self) -> Vec<String> {
        self.read_children().keys().cloned().collect()
    }

    pub(crate) fn record(&self, size: u64, modified_at: SystemTime) {
        *self.meta.write().unwrap_or_else(PoisonError::into_inner) = NodeMeta { size, modified_at };
    }

    fn read_meta(&self) -> NodeMeta {
        *self.meta.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_children(&self) -> RwLockReadGuard<'_, BTreeMap<String, Arc<Self>>> {
        self.children.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_children(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Arc<Self>>> {
        self.children.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One entry produced by [`NodeTree::readdir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Name within the directory.
    pub name: String,
    /// Inode address of the child.
    pub addr: InodeAddr,
    /// Kind of the child.
    pub kind: NodeKind,
}

/// The mounted tree: the root node, the inode arena and the store everything is fetched from.
pub struct NodeTree<S: RemoteStore> {
    store: Arc<S>,
    options: MountOptions,
    root: Arc<Node>,
    inodes: scc::HashMap<InodeAddr, Arc<Node>>,
    next_addr: AtomicU64,
}

impl<S: RemoteStore> fmt::Debug for NodeTree<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeTree")
            .field("options", &self.options)
            .field("inodes", &self.inodes.len())
            .finish_non_exhaustive()
    }
}

impl<S: RemoteStore> NodeTree<S> {
    /// A tree holding only the root directory; nothing is fetched until first use.
    pub fn new(store: Arc<S>, options: MountOptions) -> Self {
        let root = Arc::new(Node::new(
            ROOT_ADDR,
            "/".to_owned(),
            NodeKind::Directory,
            0,
            SystemTime::now(),
        ));
        let inodes = scc::HashMap::new();
        // Fresh map, the insert cannot collide.
        let _ = inodes.insert_sync(ROOT_ADDR, Arc::clone(&root));
        Self {
            store,
            options,
            root,
            inodes,
            next_addr: AtomicU64::new(ROOT_ADDR + 1),
        }
    }

    /// The root directory.
    #[must_use]
    pub fn root(&self) -> &Arc<Node> {
        &self.root
    }

    /// Mount options this tree was built with.
    #[must_use]
    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    /// Resolve an inode address handed back by the kernel.
    pub fn node(&self, addr: InodeAddr) -> Result<Arc<Node>, FsError> {
        self.inodes
            .read_sync(&addr, |_, node| Arc::clone(node))
            .ok_or(FsError::Stale)
    }

    /// Number of nodes in the arena, root included.
    #[must_use]
    pub fn inode_count(&self) -> usize {
        self.inodes.len()
    }

    /// Attributes from the cached state; never touches the remote.
    #[must_use]
    pub fn getattr(&self, node: &Node) -> Attributes {
        let meta = node.read_meta();
        Attributes::derive(
            node.addr,
            node.kind,
            meta.size,
            meta.modified_at,
            &self.options,
        )
    }

    /// Resolve `name` inside `parent`.
    ///
    /// A cached child is returned as-is. Otherwise the parent is listed remotely and, if the
    /// name appears, a node is created for it; concurrent misses on the same name all end up
    /// with the node that was inserted first.
    #[instrument(name = "NodeTree::lookup", skip(self, parent, cancel), fields(parent = %parent.path))]
    pub async fn lookup(
        &self,
        parent: &Arc<Node>,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<Node>, FsError> {
        ensure_directory(parent)?;
        if let Some(child) = parent.cached_child(name) {
            trace!("cache hit");
            return Ok(child);
        }

        let entries = self.list(parent, cancel).await?;
        let Some(entry) = entries.into_iter().find(|entry| entry.name == name) else {
            debug!("name absent from remote listing");
            return Err(FsError::NotFound);
        };

        let mut children = parent.write_children();
        let node = match children.entry(entry.name) {
            Entry::Occupied(existing) => Arc::clone(existing.get()),
            Entry::Vacant(slot) => {
                let node = self.register(
                    child_path(&parent.path, name),
                    NodeKind::of_remote(entry.is_dir),
                    entry.size,
                    entry.modified_at,
                );
                Arc::clone(slot.insert(node))
            }
        };
        Ok(node)
    }

    /// List `dir` remotely and reconcile its cached children with the result.
    ///
    /// Children that survive with the same kind keep their identity and get fresh size and
    /// modification time. New names get new nodes. Everything else is detached, so sessions
    /// still open on it fail with [`FsError::Stale`].
    #[instrument(name = "NodeTree::readdir", skip(self, dir, cancel), fields(dir = %dir.path))]
    pub async fn readdir(
        &self,
        dir: &Arc<Node>,
        cancel: &CancellationToken,
    ) -> Result<Vec<DirEntry>, FsError> {
        ensure_directory(dir)?;
        let entries = self.list(dir, cancel).await?;

        let mut listing = Vec::with_capacity(entries.len());
        let mut children = dir.write_children();
        let mut fresh = BTreeMap::new();
        for entry in entries {
            let Entry::Vacant(slot) = fresh.entry(entry.name) else {
                debug!("ignoring duplicate name in remote listing");
                continue;
            };
            let kind = NodeKind::of_remote(entry.is_dir);
            let node = match children.remove(slot.key()) {
                Some(existing) if existing.kind == kind => {
                    existing.record(entry.size, entry.modified_at);
                    existing
                }
                replaced => {
                    if let Some(old) = replaced {
                        self.retire(&old);
                    }
                    self.register(
                        child_path(&dir.path, slot.key()),
                        kind,
                        entry.size,
                        entry.modified_at,
                    )
                }
            };
            listing.push(DirEntry {
                name: slot.key().clone(),
                addr: node.addr,
                kind,
            });
            slot.insert(node);
        }

        let vanished = std::mem::replace(&mut *children, fresh);
        drop(children);
        for (name, node) in vanished {
            debug!(%name, "entry vanished from remote listing");
            self.retire(&node);
        }

        Ok(listing)
    }

    /// Create an empty file called `name` in `parent`.
    #[instrument(name = "NodeTree::create", skip(self, parent, cancel), fields(parent = %parent.path))]
    pub async fn create(
        &self,
        parent: &Arc<Node>,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<Node>, FsError> {
        self.ensure_writable()?;
        ensure_directory(parent)?;
        validate_name(name)?;

        let path = child_path(&parent.path, name);
        let store = Arc::clone(&self.store);
        let target = path.clone();
        run_detached(cancel, async move {
            store.write_whole(&target, Bytes::new()).await
        })
        .await?;

        info!(%path, "created file");
        Ok(self.adopt(parent, name, path, NodeKind::File))
    }

    /// Create a directory called `name` in `parent`.
    #[instrument(name = "NodeTree::mkdir", skip(self, parent, cancel), fields(parent = %parent.path))]
    pub async fn mkdir(
        &self,
        parent: &Arc<Node>,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<Node>, FsError> {
        self.ensure_writable()?;
        ensure_directory(parent)?;
        validate_name(name)?;

        let path = child_path(&parent.path, name);
        let store = Arc::clone(&self.store);
        let target = path.clone();
        run_detached(cancel, async move { store.make_directory(&target).await }).await?;

        info!(%path, "created directory");
        Ok(self.adopt(parent, name, path, NodeKind::Directory))
    }

    /// Delete `name` from `parent`, file or directory alike.
    ///
    /// Whether a directory must be empty is up to the remote.
    #[instrument(name = "NodeTree::remove", skip(self, parent, cancel), fields(parent = %parent.path))]
    pub async fn remove(
        &self,
        parent: &Arc<Node>,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), FsError> {
        self.ensure_writable()?;
        ensure_directory(parent)?;

        let path = child_path(&parent.path, name);
        let store = Arc::clone(&self.store);
        let target = path.clone();
        run_detached(cancel, async move { store.delete(&target).await }).await?;

        let removed = parent.write_children().remove(name);
        if let Some(node) = removed {
            self.retire(&node);
        }
        info!(%path, "removed");
        Ok(())
    }

    /// Open a session on a file.
    pub fn open(&self, node: &Arc<Node>, flags: OpenFlags) -> Result<FileSession<S>, FsError> {
        if node.kind == NodeKind::Directory {
            return Err(FsError::IsADirectory);
        }
        if node.is_detached() {
            return Err(FsError::Stale);
        }
        let mode = OpenMode::from_flags(flags);
        if mode.writable() && self.options.read_only {
            return Err(FsError::ReadOnly);
        }
        Ok(FileSession::new(
            Arc::clone(node),
            mode,
            Arc::clone(&self.store),
            self.options.read_only,
        ))
    }

    /// Resize a file to exactly `size` bytes, zero-filling when it grows.
    #[instrument(name = "NodeTree::truncate", skip(self, node, cancel), fields(path = %node.path))]
    pub async fn truncate(
        &self,
        node: &Arc<Node>,
        size: u64,
        cancel: &CancellationToken,
    ) -> Result<Attributes, FsError> {
        self.ensure_writable()?;
        if node.kind == NodeKind::Directory {
            return Err(FsError::IsADirectory);
        }
        if node.is_detached() {
            return Err(FsError::Stale);
        }
        if node.size() == size {
            return Ok(self.getattr(node));
        }

        let store = Arc::clone(&self.store);
        let path = node.path.clone();
        run_detached(cancel, async move {
            let body = if size == 0 {
                Bytes::new()
            } else {
                let reader = store.read(&path).await?;
                resize(session::read_prefix(reader, size).await?, size)
            };
            store.write_whole(&path, body).await?;
            Ok::<_, RemoteError>(())
        })
        .await?;

        node.record(size, SystemTime::now());
        Ok(self.getattr(node))
    }

    /// Count one more kernel reference to `node`.
    pub fn remember(&self, node: &Node) {
        node.lookups.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop `count` kernel references to `addr`, evicting it once it is unreferenced and
    /// already detached.
    pub fn forget(&self, addr: InodeAddr, count: u64) {
        let Ok(node) = self.node(addr) else {
            return;
        };
        let previous = node
            .lookups
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |held| {
                Some(held.saturating_sub(count))
            })
            .unwrap_or_default();
        if previous <= count && node.is_detached() {
            trace!(addr, "evicting forgotten node");
            self.inodes.remove_sync(&addr);
        }
    }

    /// Synthetic filesystem statistics.
    #[must_use]
    pub fn statfs(&self) -> FsStats {
        FsStats {
            block_size: BLOCK_SIZE,
            total_blocks: SYNTHETIC_BLOCKS,
            free_blocks: SYNTHETIC_BLOCKS,
            available_blocks: SYNTHETIC_BLOCKS,
            total_inodes: self.inodes.len() as u64,
            free_inodes: u64::from(u32::MAX),
            max_filename_length: MAX_NAME_LEN,
        }
    }

    async fn list(
        &self,
        dir: &Node,
        cancel: &CancellationToken,
    ) -> Result<Vec<crate::remote::RemoteEntry>, FsError> {
        let store = Arc::clone(&self.store);
        let path = dir.path.clone();
        run_detached(cancel, async move { store.list(&path).await }).await
    }

    fn ensure_writable(&self) -> Result<(), FsError> {
        if self.options.read_only {
            Err(FsError::ReadOnly)
        } else {
            Ok(())
        }
    }

    fn register(
        &self,
        path: String,
        kind: NodeKind,
        size: u64,
        modified_at: SystemTime,
    ) -> Arc<Node> {
        let addr = self.next_addr.fetch_add(1, Ordering::Relaxed);
        let node = Arc::new(Node::new(addr, path, kind, size, modified_at));
        // Addresses are never reused, so the slot is always free.
        let _ = self.inodes.insert_sync(addr, Arc::clone(&node));
        node
    }

    /// Install a node freshly created remotely, reusing a cached node of the same kind.
    fn adopt(&self, parent: &Node, name: &str, path: String, kind: NodeKind) -> Arc<Node> {
        let now = SystemTime::now();
        let mut children = parent.write_children();
        if let Some(existing) = children.get(name)
            && existing.kind == kind
        {
            existing.record(0, now);
            return Arc::clone(existing);
        }

        let node = self.register(path, kind, 0, now);
        if let Some(old) = children.insert(name.to_owned(), Arc::clone(&node)) {
            self.retire(&old);
        }
        node
    }

    /// Detach `node` and everything below it.
    fn retire(&self, node: &Arc<Node>) {
        node.detached.store(true, Ordering::Release);
        if node.lookups.load(Ordering::Acquire) == 0 {
            self.inodes.remove_sync(&node.addr);
        }
        let orphans = std::mem::take(&mut *node.write_children());
        for child in orphans.into_values() {
            self.retire(&child);
        }
    }
}

/// Run a remote operation on its own task and wait for it unless `cancel` fires first.
///
/// Cancellation abandons the wait, not the operation: the task keeps running and its result
/// is discarded, so the caller must not touch the cache after [`FsError::Cancelled`].
pub(crate) async fn run_detached<T, F>(cancel: &CancellationToken, call: F) -> Result<T, FsError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, RemoteError>> + Send + 'static,
{
    if cancel.is_cancelled() {
        return Err(FsError::Cancelled);
    }

    let task = tokio::spawn(call.in_current_span());
    tokio::select! {
        joined = task => match joined {
            Ok(result) => result.map_err(FsError::from),
            Err(join_err) => Err(FsError::Remote(RemoteError::Transport(Box::new(join_err)))),
        },
        () = cancel.cancelled() => {
            debug!("caller cancelled; remote operation left to finish in the background");
            Err(FsError::Cancelled)
        }
    }
}

fn ensure_directory(node: &Node) -> Result<(), FsError> {
    match node.kind {
        NodeKind::Directory => Ok(()),
        NodeKind::File => Err(FsError::NotADirectory),
    }
}

fn validate_name(name: &str) -> Result<(), FsError> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']) {
        return Err(FsError::InvalidName);
    }
    Ok(())
}

/// Absolute path of `name` inside `parent`.
#[must_use]
pub fn child_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

#[expect(
    clippy::cast_possible_truncation,
    reason = "the prefix was read into memory, so `size` exceeds it only when growing"
)]
fn resize(prefix: Bytes, size: u64) -> Bytes {
    if prefix.len() as u64 >= size {
        return prefix;
    }
    let mut grown = BytesMut::from(prefix.as_ref());
    grown.resize(size as usize, 0);
    grown.freeze()
}
