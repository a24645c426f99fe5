//! Active-session registry.
//!
//! One workspace may have at most one in-flight login session. The registry
//! is the single authority for that invariant: `upsert` hands back the
//! displaced session so the caller can tear it down, and the epoch guard
//! lets the expiry timer and cancellation race the normal completion path
//! without double-cleanup.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

struct Entry<S> {
    epoch: u64,
    session: Arc<S>,
}

pub struct SessionRegistry<S> {
    inner: Mutex<HashMap<String, Entry<S>>>,
    epochs: AtomicU64,
}

impl<S> Default for SessionRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> SessionRegistry<S> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            epochs: AtomicU64::new(1),
        }
    }

    /// Allocate a unique epoch for a new session attempt.
    pub fn next_epoch(&self) -> u64 {
        self.epochs.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a session for a workspace, returning the displaced session
    /// (if any) for teardown by the caller.
    pub async fn upsert(&self, workspace_id: &str, epoch: u64, session: Arc<S>) -> Option<Arc<S>> {
        let mut map = self.inner.lock().await;
        map.insert(workspace_id.to_string(), Entry { epoch, session })
            .map(|e| e.session)
    }

    pub async fn get(&self, workspace_id: &str) -> Option<Arc<S>> {
        let map = self.inner.lock().await;
        map.get(workspace_id).map(|e| Arc::clone(&e.session))
    }

    /// Remove unconditionally (cancel, completion).
    pub async fn remove(&self, workspace_id: &str) -> Option<Arc<S>> {
        let mut map = self.inner.lock().await;
        map.remove(workspace_id).map(|e| e.session)
    }

    /// Remove only if the registered session still belongs to `epoch`.
    /// Used by the expiry timer so a superseding attempt is never torn
    /// down by its predecessor's timer.
    pub async fn remove_if_epoch(&self, workspace_id: &str, epoch: u64) -> Option<Arc<S>> {
        let mut map = self.inner.lock().await;
        match map.get(workspace_id) {
            Some(entry) if entry.epoch == epoch => map.remove(workspace_id).map(|e| e.session),
            _ => None,
        }
    }

    /// Remove and return every registered session (engine shutdown).
    pub async fn drain(&self) -> Vec<Arc<S>> {
        let mut map = self.inner.lock().await;
        map.drain().map(|(_, e)| e.session).collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}
