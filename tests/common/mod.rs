#![allow(dead_code, missing_docs, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use drivefs::fs::{MountOptions, Node, NodeTree};
use drivefs::remote::memory::{MemoryStore, Op};
use tokio_util::sync::CancellationToken;

pub type Tree = NodeTree<MemoryStore>;

pub fn options() -> MountOptions {
    MountOptions {
        read_only: false,
        uid: 1000,
        gid: 1000,
        umask: 0o022,
    }
}

/// Build a writable tree on top of `store`, returning both.
pub fn mount(store: MemoryStore) -> (Arc<Tree>, Arc<MemoryStore>) {
    mount_with(store, options())
}

pub fn mount_read_only(store: MemoryStore) -> (Arc<Tree>, Arc<MemoryStore>) {
    mount_with(
        store,
        MountOptions {
            read_only: true,
            ..options()
        },
    )
}

pub fn mount_with(store: MemoryStore, options: MountOptions) -> (Arc<Tree>, Arc<MemoryStore>) {
    let store = Arc::new(store);
    let tree = Arc::new(NodeTree::new(Arc::clone(&store), options));
    (tree, store)
}

/// A token nobody cancels.
pub fn live() -> CancellationToken {
    CancellationToken::new()
}

/// Resolve an absolute path one component at a time.
pub async fn resolve(tree: &Tree, path: &str) -> Arc<Node> {
    let mut node = Arc::clone(tree.root());
    for name in path.split('/').filter(|part| !part.is_empty()) {
        node = tree
            .lookup(&node, name, &live())
            .await
            .unwrap_or_else(|e| panic!("lookup of {name} in {path} failed: {e}"));
    }
    node
}

/// Poll until `store` has seen at least `count` calls of `op`, or panic after a second.
pub async fn wait_for_calls(store: &MemoryStore, op: Op, count: usize) {
    for _ in 0..200 {
        if store.calls(op) >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "expected {count} {op:?} calls within 1 second, saw {}",
        store.calls(op)
    );
}

/// Poll until `check` holds, or panic after a second.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("{what} did not happen within 1 second");
}
