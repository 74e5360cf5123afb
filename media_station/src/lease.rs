use futures::Stream;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

/// Reference counts for files that are currently being served. The janitor
/// consults this before deleting anything. Paths are keyed by their canonical
/// form so two spellings of one file share a count.
#[derive(Clone, Default)]
pub struct Leases {
    held: Arc<Mutex<HashMap<PathBuf, usize>>>,
}

impl Leases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin `path` until the returned guard is dropped.
    pub fn acquire(&self, path: &Path) -> Lease {
        let key = lease_key(path);
        *self.held.lock().entry(key.clone()).or_insert(0) += 1;
        Lease {
            leases: self.clone(),
            key,
        }
    }

    #[cfg(test)]
    pub fn is_leased(&self, path: &Path) -> bool {
        self.held.lock().contains_key(&lease_key(path))
    }

    /// Run `remove` for `path` only if nobody holds a lease on it. The lock is
    /// held across the call so a lease cannot be taken in between.
    /// Returns `None` when the file was leased.
    pub fn remove_unless_leased<F>(&self, path: &Path, remove: F) -> Option<io::Result<()>>
    where
        F: FnOnce(&Path) -> io::Result<()>,
    {
        let key = lease_key(path);
        let guard = self.held.lock();
        if guard.contains_key(&key) {
            return None;
        }
        let res = remove(path);
        drop(guard);
        Some(res)
    }

    fn release(&self, path: &Path) {
        let mut guard = self.held.lock();
        if let Some(count) = guard.get_mut(path) {
            *count -= 1;
            if *count == 0 {
                guard.remove(path);
            }
        }
    }
}

/// A file that does not exist (yet) keys on the path as given.
fn lease_key(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

pub struct Lease {
    leases: Leases,
    key: PathBuf,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.leases.release(&self.key);
    }
}

/// Body stream that keeps its file leased until the stream is dropped.
pub struct LeasedStream<S> {
    inner: S,
    _lease: Lease,
}

impl<S> LeasedStream<S> {
    pub fn new(inner: S, lease: Lease) -> Self {
        Self {
            inner,
            _lease: lease,
        }
    }
}

impl<S: Stream + Unpin> Stream for LeasedStream<S> {
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
