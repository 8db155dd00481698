#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use std::sync::Arc;

use bytes::Bytes;
use drivefs::fs::{FsError, OpenFlags, OpenMode};
use drivefs::remote::memory::{MemoryStore, Op};

use common::{live, mount, resolve};

fn with_file(path: &str, contents: &'static [u8]) -> MemoryStore {
    let store = MemoryStore::new();
    store.put_file(path, Bytes::from_static(contents));
    store
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn read_returns_the_requested_range() {
    let (tree, _store) = mount(with_file("/f", b"0123456789"));
    let node = resolve(&tree, "/f").await;
    let session = tree.open(&node, OpenFlags::empty()).unwrap();
    assert_eq!(session.mode(), OpenMode::Read);

    assert_eq!(session.read(0, 4, &live()).await.unwrap().as_ref(), b"0123");
    assert_eq!(session.read(3, 4, &live()).await.unwrap().as_ref(), b"3456");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn read_is_short_at_end_and_empty_past_it() {
    let (tree, _store) = mount(with_file("/f", b"0123456789"));
    let node = resolve(&tree, "/f").await;
    let session = tree.open(&node, OpenFlags::empty()).unwrap();

    assert_eq!(session.read(8, 100, &live()).await.unwrap().as_ref(), b"89");
    assert!(session.read(10, 4, &live()).await.unwrap().is_empty());
    assert!(session.read(1_000, 4, &live()).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zero_length_read_skips_the_remote() {
    let (tree, store) = mount(with_file("/f", b"abc"));
    let node = resolve(&tree, "/f").await;
    let session = tree.open(&node, OpenFlags::empty()).unwrap();

    assert!(session.read(0, 0, &live()).await.unwrap().is_empty());
    assert_eq!(store.calls(Op::Read), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn every_read_goes_to_the_remote() {
    let (tree, store) = mount(with_file("/f", b"first"));
    let node = resolve(&tree, "/f").await;
    let session = tree.open(&node, OpenFlags::empty()).unwrap();

    assert_eq!(session.read(0, 64, &live()).await.unwrap().as_ref(), b"first");
    store.put_file("/f", "second");
    assert_eq!(session.read(0, 64, &live()).await.unwrap().as_ref(), b"second");
    assert_eq!(store.calls(Op::Read), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn write_at_zero_replaces_content_without_downloading() {
    let (tree, store) = mount(with_file("/f", b""));
    let node = resolve(&tree, "/f").await;
    let session = tree.open(&node, OpenFlags::RDWR).unwrap();

    let written = session
        .write(0, Bytes::from_static(b"hello"), &live())
        .await
        .unwrap();
    assert_eq!(written, 5);
    assert_eq!(store.calls(Op::Read), 0);
    assert_eq!(store.file("/f").unwrap().as_ref(), b"hello");
    assert_eq!(node.size(), 5);
    assert_eq!(tree.getattr(&node).size, 5);

    assert_eq!(session.read(0, 64, &live()).await.unwrap().as_ref(), b"hello");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sequential_writes_append() {
    let (tree, store) = mount(with_file("/f", b""));
    let node = resolve(&tree, "/f").await;
    let session = tree.open(&node, OpenFlags::WRONLY).unwrap();

    session
        .write(0, Bytes::from_static(b"hello"), &live())
        .await
        .unwrap();
    session
        .write(5, Bytes::from_static(b" world"), &live())
        .await
        .unwrap();

    assert_eq!(store.file("/f").unwrap().as_ref(), b"hello world");
    assert_eq!(node.size(), 11);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn write_at_offset_keeps_the_prefix_only() {
    let (tree, store) = mount(with_file("/f", b"0123456789"));
    let node = resolve(&tree, "/f").await;
    let session = tree.open(&node, OpenFlags::RDWR).unwrap();

    session
        .write(4, Bytes::from_static(b"abc"), &live())
        .await
        .unwrap();
    assert_eq!(store.file("/f").unwrap().as_ref(), b"0123abc");
    assert_eq!(node.size(), 7);
    assert_eq!(store.calls(Op::Read), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn write_at_zero_replaces_the_whole_object() {
    let (tree, store) = mount(with_file("/f", b"0123456789"));
    let node = resolve(&tree, "/f").await;
    let session = tree.open(&node, OpenFlags::WRONLY).unwrap();

    session
        .write(0, Bytes::from_static(b"ab"), &live())
        .await
        .unwrap();
    assert_eq!(store.calls(Op::Read), 0);
    assert_eq!(store.file("/f").unwrap().as_ref(), b"ab");
    assert_eq!(node.size(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn write_past_end_does_not_zero_fill() {
    let (tree, store) = mount(with_file("/f", b"ab"));
    let node = resolve(&tree, "/f").await;
    let session = tree.open(&node, OpenFlags::WRONLY).unwrap();

    session
        .write(5, Bytes::from_static(b"Z"), &live())
        .await
        .unwrap();
    assert_eq!(store.file("/f").unwrap().as_ref(), b"abZ");
    // The cached size follows the write position, not the shorter uploaded body.
    assert_eq!(node.size(), 6);
    assert_eq!(tree.getattr(&node).size, 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_upload_leaves_cached_size_alone() {
    let (tree, store) = mount(with_file("/f", b"abc"));
    let node = resolve(&tree, "/f").await;
    let session = tree.open(&node, OpenFlags::RDWR).unwrap();
    store.fail(Op::Write);

    let err = session
        .write(0, Bytes::from_static(b"longer content"), &live())
        .await
        .unwrap_err();
    assert!(matches!(err, FsError::Remote(_)));
    assert_eq!(err.errno(), libc::EIO);
    assert_eq!(node.size(), 3);
    assert_eq!(store.file("/f").unwrap().as_ref(), b"abc");

    store.heal(Op::Write);
    session
        .write(0, Bytes::from_static(b"longer content"), &live())
        .await
        .unwrap();
    assert_eq!(node.size(), 14);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_download_aborts_the_write() {
    let (tree, store) = mount(with_file("/f", b"abcdef"));
    let node = resolve(&tree, "/f").await;
    let session = tree.open(&node, OpenFlags::RDWR).unwrap();
    store.fail(Op::Read);

    let err = session
        .write(2, Bytes::from_static(b"Z"), &live())
        .await
        .unwrap_err();
    assert!(matches!(err, FsError::Remote(_)));
    assert_eq!(store.calls(Op::Write), 0);
    assert_eq!(store.file("/f").unwrap().as_ref(), b"abcdef");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sessions_enforce_their_open_mode() {
    let (tree, store) = mount(with_file("/f", b"abc"));
    let node = resolve(&tree, "/f").await;

    let reader = tree.open(&node, OpenFlags::empty()).unwrap();
    let err = reader
        .write(0, Bytes::from_static(b"x"), &live())
        .await
        .unwrap_err();
    assert!(matches!(err, FsError::BadHandle));
    assert_eq!(err.errno(), libc::EBADF);

    let writer = tree.open(&node, OpenFlags::WRONLY).unwrap();
    assert!(matches!(
        writer.read(0, 3, &live()).await,
        Err(FsError::BadHandle)
    ));

    assert_eq!(store.calls(Op::Read) + store.calls(Op::Write), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn opening_a_directory_is_rejected() {
    let store = MemoryStore::new();
    store.put_dir("/dir");
    let (tree, _store) = mount(store);
    let dir = resolve(&tree, "/dir").await;

    assert!(matches!(
        tree.open(&dir, OpenFlags::empty()),
        Err(FsError::IsADirectory)
    ));
    assert!(matches!(
        tree.open(tree.root(), OpenFlags::empty()),
        Err(FsError::IsADirectory)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_goes_stale_when_file_vanishes() {
    let (tree, store) = mount(with_file("/f", b"abc"));
    let root = Arc::clone(tree.root());
    let node = resolve(&tree, "/f").await;
    let session = tree.open(&node, OpenFlags::RDWR).unwrap();

    store.remove("/f");
    tree.readdir(&root, &live()).await.unwrap();
    let calls = store.total_calls();

    assert!(matches!(
        session.read(0, 3, &live()).await,
        Err(FsError::Stale)
    ));
    let err = session
        .write(0, Bytes::from_static(b"x"), &live())
        .await
        .unwrap_err();
    assert!(matches!(err, FsError::Stale));
    assert_eq!(err.errno(), libc::ESTALE);
    assert_eq!(store.total_calls(), calls);

    assert!(matches!(
        tree.open(&node, OpenFlags::empty()),
        Err(FsError::Stale)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn truncate_shrinks_and_grows_with_zeros() {
    let (tree, store) = mount(with_file("/f", b"0123456789"));
    let node = resolve(&tree, "/f").await;

    let attr = tree.truncate(&node, 4, &live()).await.unwrap();
    assert_eq!(attr.size, 4);
    assert_eq!(store.file("/f").unwrap().as_ref(), b"0123");

    let attr = tree.truncate(&node, 6, &live()).await.unwrap();
    assert_eq!(attr.size, 6);
    assert_eq!(store.file("/f").unwrap().as_ref(), b"0123\0\0");

    tree.truncate(&node, 0, &live()).await.unwrap();
    assert!(store.file("/f").unwrap().is_empty());
    assert_eq!(node.size(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn truncate_to_current_size_is_a_no_op() {
    let (tree, store) = mount(with_file("/f", b"abc"));
    let node = resolve(&tree, "/f").await;
    let calls = store.total_calls();

    let attr = tree.truncate(&node, 3, &live()).await.unwrap();
    assert_eq!(attr.size, 3);
    assert_eq!(store.total_calls(), calls);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn truncate_to_zero_skips_the_download() {
    let (tree, store) = mount(with_file("/f", b"abc"));
    let node = resolve(&tree, "/f").await;

    tree.truncate(&node, 0, &live()).await.unwrap();
    assert_eq!(store.calls(Op::Read), 0);
    assert_eq!(store.calls(Op::Write), 1);
}
