//! In-memory [`RemoteStore`] for tests.
//!
//! Besides storing objects it counts calls per operation, can be told to fail an operation, and
//! can hold every call at a gate so tests can observe work while it is in flight.

use std::collections::{BTreeMap, HashSet};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

use bytes::Bytes;
use tokio::sync::watch;

use super::{ObjectReader, RemoteEntry, RemoteError, RemoteStore};

/// The five remote operations, for counting and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// [`RemoteStore::list`].
    List,
    /// [`RemoteStore::read`].
    Read,
    /// [`RemoteStore::write_whole`].
    Write,
    /// [`RemoteStore::delete`].
    Delete,
    /// [`RemoteStore::make_directory`].
    MakeDirectory,
}

impl Op {
    const ALL: [Self; 5] = [
        Self::List,
        Self::Read,
        Self::Write,
        Self::Delete,
        Self::MakeDirectory,
    ];

    fn slot(self) -> usize {
        match self {
            Self::List => 0,
            Self::Read => 1,
            Self::Write => 2,
            Self::Delete => 3,
            Self::MakeDirectory => 4,
        }
    }
}

#[derive(Debug, Clone)]
enum Object {
    File { data: Bytes, modified: SystemTime },
    Directory { modified: SystemTime },
}

/// A remote drive held entirely in memory.
#[derive(Debug)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, Object>>,
    calls: [AtomicUsize; 5],
    failing: Mutex<HashSet<Op>>,
    paused: watch::Sender<bool>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// An empty drive containing only the root directory.
    #[must_use]
    pub fn new() -> Self {
        let mut objects = BTreeMap::new();
        objects.insert(
            "/".to_owned(),
            Object::Directory {
                modified: SystemTime::now(),
            },
        );
        Self {
            objects: Mutex::new(objects),
            calls: Default::default(),
            failing: Mutex::default(),
            paused: watch::Sender::new(false),
        }
    }

    /// Store a file, creating any missing parent directories.
    pub fn put_file(&self, path: &str, data: impl Into<Bytes>) {
        let mut objects = self.lock();
        create_parents(&mut objects, path);
        objects.insert(
            path.to_owned(),
            Object::File {
                data: data.into(),
                modified: SystemTime::now(),
            },
        );
    }

    /// Create a directory, including any missing parents.
    pub fn put_dir(&self, path: &str) {
        let mut objects = self.lock();
        create_parents(&mut objects, path);
        objects.insert(
            path.to_owned(),
            Object::Directory {
                modified: SystemTime::now(),
            },
        );
    }

    /// Remove a path and everything below it, bypassing counters and gates.
    pub fn remove(&self, path: &str) {
        let mut objects = self.lock();
        let prefix = format!("{}/", path.trim_end_matches('/'));
        objects.retain(|key, _| key != path && !key.starts_with(&prefix));
    }

    /// Contents of the file at `path`, if there is one.
    #[must_use]
    pub fn file(&self, path: &str) -> Option<Bytes> {
        match self.lock().get(path) {
            Some(Object::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    /// Whether a directory exists at `path`.
    #[must_use]
    pub fn is_dir(&self, path: &str) -> bool {
        matches!(self.lock().get(path), Some(Object::Directory { .. }))
    }

    /// Number of calls made so far for `op`, including failed ones.
    #[must_use]
    pub fn calls(&self, op: Op) -> usize {
        self.calls[op.slot()].load(Ordering::SeqCst)
    }

    /// Total calls across every operation.
    #[must_use]
    pub fn total_calls(&self) -> usize {
        Op::ALL.iter().map(|op| self.calls(*op)).sum()
    }

    /// Make every subsequent `op` fail with a 500 until [`MemoryStore::heal`] is called.
    pub fn fail(&self, op: Op) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(op);
    }

    /// Undo [`MemoryStore::fail`].
    pub fn heal(&self, op: Op) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&op);
    }

    /// Hold every call that starts from now on until [`MemoryStore::resume`].
    ///
    /// Held calls are already counted, so a test can wait for the counter to move and know the
    /// call is parked at the gate.
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    /// Release every held call.
    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Object>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn enter(&self, op: Op, path: &str) -> Result<(), RemoteError> {
        self.calls[op.slot()].fetch_add(1, Ordering::SeqCst);
        let mut gate = self.paused.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = gate.wait_for(|paused| !*paused).await;

        let failing = self
            .failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&op);
        if failing {
            return Err(RemoteError::Status {
                status: 500,
                message: format!("injected {op:?} failure for {path}"),
            });
        }
        Ok(())
    }
}

fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

fn name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn create_parents(objects: &mut BTreeMap<String, Object>, path: &str) {
    let mut cursor = parent_of(path);
    while let Some(dir) = cursor {
        objects.entry(dir.to_owned()).or_insert(Object::Directory {
            modified: SystemTime::now(),
        });
        cursor = parent_of(dir);
    }
}

fn require_parent_dir(objects: &BTreeMap<String, Object>, path: &str) -> Result<(), RemoteError> {
    match parent_of(path).and_then(|parent| objects.get(parent)) {
        Some(Object::Directory { .. }) => Ok(()),
        _ => Err(RemoteError::NotFound {
            path: parent_of(path).unwrap_or(path).to_owned(),
        }),
    }
}

impl RemoteStore for MemoryStore {
    async fn list(&self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        self.enter(Op::List, path).await?;
        let objects = self.lock();
        if !matches!(objects.get(path), Some(Object::Directory { .. })) {
            return Err(RemoteError::NotFound {
                path: path.to_owned(),
            });
        }

        Ok(objects
            .iter()
            .filter(|(key, _)| parent_of(key) == Some(path))
            .map(|(key, object)| match object {
                Object::File { data, modified } => RemoteEntry {
                    name: name_of(key).to_owned(),
                    is_dir: false,
                    size: data.len() as u64,
                    modified_at: *modified,
                },
                Object::Directory { modified } => RemoteEntry {
                    name: name_of(key).to_owned(),
                    is_dir: true,
                    size: 0,
                    modified_at: *modified,
                },
            })
            .collect())
    }

    async fn read(&self, path: &str) -> Result<ObjectReader, RemoteError> {
        self.enter(Op::Read, path).await?;
        match self.lock().get(path) {
            Some(Object::File { data, .. }) => Ok(Box::pin(Cursor::new(data.clone()))),
            _ => Err(RemoteError::NotFound {
                path: path.to_owned(),
            }),
        }
    }

    async fn write_whole(&self, path: &str, body: Bytes) -> Result<(), RemoteError> {
        self.enter(Op::Write, path).await?;
        let mut objects = self.lock();
        require_parent_dir(&objects, path)?;
        if matches!(objects.get(path), Some(Object::Directory { .. })) {
            return Err(RemoteError::Status {
                status: 409,
                message: format!("{path} is a directory"),
            });
        }
        objects.insert(
            path.to_owned(),
            Object::File {
                data: body,
                modified: SystemTime::now(),
            },
        );
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), RemoteError> {
        self.enter(Op::Delete, path).await?;
        if !self.lock().contains_key(path) {
            return Err(RemoteError::NotFound {
                path: path.to_owned(),
            });
        }
        self.remove(path);
        Ok(())
    }

    async fn make_directory(&self, path: &str) -> Result<(), RemoteError> {
        self.enter(Op::MakeDirectory, path).await?;
        let mut objects = self.lock();
        require_parent_dir(&objects, path)?;
        if objects.contains_key(path) {
            return Err(RemoteError::Status {
                status: 409,
                message: format!("{path} already exists"),
            });
        }
        objects.insert(
            path.to_owned(),
            Object::Directory {
                modified: SystemTime::now(),
            },
        );
        Ok(())
    }
}
