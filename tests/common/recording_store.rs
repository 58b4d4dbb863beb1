// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cursor store wrapper that records calls and can fail commits.

use dashmap::DashMap;
use relay_replication_engine::{BoxFuture, Cursor, CursorStore, MemoryCursorStore, ReplicationError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Records loads and commits and injects commit failures per scope.
pub struct RecordingCursorStore<C: CursorStore = MemoryCursorStore> {
    inner: Arc<C>,
    loads: AtomicUsize,
    commits: AtomicUsize,
    history: DashMap<String, Vec<Cursor>>,
    failing: DashMap<String, ()>,
}

#[allow(dead_code)]
impl<C: CursorStore> RecordingCursorStore<C> {
    pub fn wrap(inner: Arc<C>) -> Self {
        Self {
            inner,
            loads: AtomicUsize::new(0),
            commits: AtomicUsize::new(0),
            history: DashMap::new(),
            failing: DashMap::new(),
        }
    }

    pub fn inner(&self) -> &Arc<C> {
        &self.inner
    }

    /// Make every commit for `scope` fail as if the process died mid-write.
    pub fn fail_commits_for(&self, scope: &str) {
        self.failing.insert(scope.to_string(), ());
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Successful commits for `scope`, in order.
    pub fn history(&self, scope: &str) -> Vec<Cursor> {
        self.history.get(scope).map(|h| h.clone()).unwrap_or_default()
    }
}

impl RecordingCursorStore<MemoryCursorStore> {
    pub fn in_memory() -> Self {
        Self::wrap(Arc::new(MemoryCursorStore::new()))
    }
}

impl<C: CursorStore> CursorStore for RecordingCursorStore<C> {
    fn load<'a>(&'a self, scope: &'a str) -> BoxFuture<'a, Cursor> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.inner.load(scope)
    }

    fn commit<'a>(&'a self, scope: &'a str, cursor: &'a Cursor) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.commits.fetch_add(1, Ordering::SeqCst);
            if self.failing.contains_key(scope) {
                return Err(ReplicationError::CursorCommit {
                    scope: scope.to_string(),
                    message: "simulated crash during commit".to_string(),
                });
            }
            self.inner.commit(scope, cursor).await?;
            self.history.entry(scope.to_string()).or_default().push(cursor.clone());
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        self.inner.close()
    }
}
