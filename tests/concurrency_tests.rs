#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use drivefs::fs::{FsError, OpenFlags};
use drivefs::remote::memory::{MemoryStore, Op};
use tokio_util::sync::CancellationToken;

use common::{eventually, live, mount, resolve, wait_for_calls};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_lookups_agree_on_one_node() {
    let store = MemoryStore::new();
    store.put_file("/shared.txt", "contents");
    let (tree, _store) = mount(store);

    let mut handles = Vec::new();
    for _ in 0..16 {
        let tree = Arc::clone(&tree);
        handles.push(tokio::spawn(async move {
            let root = Arc::clone(tree.root());
            tree.lookup(&root, "shared.txt", &live())
                .await
                .unwrap()
                .addr()
        }));
    }

    let mut addrs = Vec::new();
    for handle in handles {
        addrs.push(handle.await.unwrap());
    }
    addrs.dedup();
    assert_eq!(addrs.len(), 1, "every lookup must resolve to the same inode");
    assert_eq!(tree.root().cached_names(), ["shared.txt"]);
    // Losers of the insert race never register a node.
    assert_eq!(tree.inode_count(), 2);
    assert!(tree.node(addrs[0]).is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writes_resolve_to_one_writer() {
    let store = MemoryStore::new();
    store.put_file("/f", "");
    let (tree, store) = mount(store);
    let node = resolve(&tree, "/f").await;

    let first = tree.open(&node, OpenFlags::WRONLY).unwrap();
    let second = tree.open(&node, OpenFlags::WRONLY).unwrap();

    let (live_a, live_b) = (live(), live());
    let (a, b) = tokio::join!(
        first.write(0, Bytes::from_static(b"AAAA"), &live_a),
        second.write(100, Bytes::from_static(b"BBBB"), &live_b),
    );
    assert_eq!(a.unwrap(), 4);
    assert_eq!(b.unwrap(), 4);

    // Each upload replaces the whole object, so normally the last upload wins outright. The
    // merged form is the same two writes run one after the other: the offset-100 writer reads
    // "AAAA" as its prefix and, with no zero-fill, appends right after it.
    let content = store.file("/f").unwrap();
    let allowed: [&[u8]; 3] = [b"AAAA", b"BBBB", b"AAAABBBB"];
    assert!(
        allowed.contains(&content.as_ref()),
        "unexpected content {content:?}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelled_write_finishes_remotely_without_touching_cache() {
    let store = MemoryStore::new();
    store.put_file("/f", "");
    let (tree, store) = mount(store);
    let node = resolve(&tree, "/f").await;
    let session = Arc::new(tree.open(&node, OpenFlags::WRONLY).unwrap());

    store.pause();
    let cancel = CancellationToken::new();
    let task = {
        let session = Arc::clone(&session);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            session
                .write(0, Bytes::from_static(b"late data"), &cancel)
                .await
        })
    };

    wait_for_calls(&store, Op::Write, 1).await;
    cancel.cancel();
    let result = task.await.unwrap();
    assert!(matches!(result, Err(FsError::Cancelled)));
    assert_eq!(FsError::Cancelled.errno(), libc::EINTR);

    store.resume();
    eventually("the abandoned upload landing", || {
        store.file("/f").is_some_and(|data| data.as_ref() == b"late data")
    })
    .await;
    assert_eq!(node.size(), 0, "cache must not see a cancelled write");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelled_lookup_leaves_directory_uncached() {
    let store = MemoryStore::new();
    store.put_file("/f", "x");
    let (tree, store) = mount(store);

    store.pause();
    let cancel = CancellationToken::new();
    let task = {
        let tree = Arc::clone(&tree);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let root = Arc::clone(tree.root());
            tree.lookup(&root, "f", &cancel).await.map(|node| node.addr())
        })
    };

    wait_for_calls(&store, Op::List, 1).await;
    cancel.cancel();
    assert!(matches!(task.await.unwrap(), Err(FsError::Cancelled)));

    store.resume();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(tree.root().cached_child("f").is_none());
    assert_eq!(tree.inode_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn already_cancelled_call_never_reaches_remote() {
    let store = MemoryStore::new();
    store.put_file("/f", "x");
    let (tree, store) = mount(store);
    let root = Arc::clone(tree.root());

    let cancel = CancellationToken::new();
    cancel.cancel();

    assert!(matches!(
        tree.lookup(&root, "f", &cancel).await,
        Err(FsError::Cancelled)
    ));
    assert!(matches!(
        tree.create(&root, "g", &cancel).await,
        Err(FsError::Cancelled)
    ));
    assert_eq!(store.total_calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_remote_call_does_not_block_cached_work() {
    let store = MemoryStore::new();
    store.put_file("/a/slow.txt", "slow");
    store.put_file("/b/fast.txt", "fast");
    let (tree, store) = mount(store);

    let a = resolve(&tree, "/a").await;
    let fast = resolve(&tree, "/b/fast.txt").await;
    let b = resolve(&tree, "/b").await;

    store.pause();
    let blocked = {
        let tree = Arc::clone(&tree);
        let a = Arc::clone(&a);
        tokio::spawn(async move { tree.readdir(&a, &live()).await.map(|l| l.len()) })
    };
    wait_for_calls(&store, Op::List, 4).await;

    // Cache hits and attribute reads proceed while /a's listing is parked.
    let hit = tokio::time::timeout(Duration::from_secs(1), tree.lookup(&b, "fast.txt", &live()))
        .await
        .expect("cached lookup must not wait on an unrelated listing")
        .unwrap();
    assert!(Arc::ptr_eq(&hit, &fast));
    assert_eq!(tree.getattr(&fast).size, 4);
    assert!(!blocked.is_finished());

    store.resume();
    assert_eq!(blocked.await.unwrap().unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_creates_in_one_directory_all_land() {
    let (tree, store) = mount(MemoryStore::new());

    let mut handles = Vec::new();
    for i in 0..8 {
        let tree = Arc::clone(&tree);
        handles.push(tokio::spawn(async move {
            let root = Arc::clone(tree.root());
            tree.create(&root, &format!("file-{i}"), &live()).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(tree.root().cached_names().len(), 8);
    for i in 0..8 {
        assert!(store.file(&format!("/file-{i}")).is_some());
    }
}
