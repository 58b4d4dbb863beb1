// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Progress reporter.
//!
//! Aggregate counters for the running cycle, updated by every worker and
//! readable at any time. These reset every cycle; lifetime totals are exported
//! through [`crate::metrics`] where the events happen.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

/// Live counters for one cycle.
#[derive(Debug, Default)]
pub struct ProgressReporter {
    scopes_total: AtomicU64,
    scopes_processed: AtomicU64,
    scopes_succeeded: AtomicU64,
    scopes_failed: AtomicU64,
    batches_committed: AtomicU64,
    events_fetched: AtomicU64,
    events_filtered: AtomicU64,
    events_published: AtomicU64,
    events_failed: AtomicU64,
    retries: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub scopes_total: u64,
    pub scopes_processed: u64,
    pub scopes_succeeded: u64,
    pub scopes_failed: u64,
    pub batches_committed: u64,
    pub events_fetched: u64,
    pub events_filtered: u64,
    pub events_published: u64,
    pub events_failed: u64,
    pub retries: u64,
}

impl std::fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "scopes {}/{} ({} ok, {} failed), events fetched={} published={} filtered={} failed={}, batches={}, retries={}",
            self.scopes_processed,
            self.scopes_total,
            self.scopes_succeeded,
            self.scopes_failed,
            self.events_fetched,
            self.events_published,
            self.events_filtered,
            self.events_failed,
            self.batches_committed,
            self.retries,
        )
    }
}

impl ProgressReporter {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero every counter and set the number of scopes in the cycle.
    pub fn reset(&self, scopes_total: usize) {
        for counter in [
            &self.scopes_processed,
            &self.scopes_succeeded,
            &self.scopes_failed,
            &self.batches_committed,
            &self.events_fetched,
            &self.events_filtered,
            &self.events_published,
            &self.events_failed,
            &self.retries,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.scopes_total.store(scopes_total as u64, Ordering::Relaxed);
    }

    pub fn add_fetched(&self, count: usize) {
        self.events_fetched.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn add_filtered(&self, count: usize) {
        self.events_filtered.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn add_published(&self, count: usize) {
        self.events_published.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn add_failed_events(&self, count: usize) {
        self.events_failed.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn add_retries(&self, count: usize) {
        self.retries.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn batch_committed(&self) {
        self.batches_committed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished scope.
    pub fn scope_finished(&self, succeeded: bool) {
        self.scopes_processed.fetch_add(1, Ordering::Relaxed);
        if succeeded {
            self.scopes_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.scopes_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Current counter values.
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            scopes_total: self.scopes_total.load(Ordering::Relaxed),
            scopes_processed: self.scopes_processed.load(Ordering::Relaxed),
            scopes_succeeded: self.scopes_succeeded.load(Ordering::Relaxed),
            scopes_failed: self.scopes_failed.load(Ordering::Relaxed),
            batches_committed: self.batches_committed.load(Ordering::Relaxed),
            events_fetched: self.events_fetched.load(Ordering::Relaxed),
            events_filtered: self.events_filtered.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
            events_failed: self.events_failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }

    /// Log a snapshot every `interval` until the returned task is aborted.
    pub fn spawn_logger(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let reporter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let snapshot = reporter.snapshot();
                info!(
                    scopes_processed = snapshot.scopes_processed,
                    scopes_total = snapshot.scopes_total,
                    events_published = snapshot.events_published,
                    events_failed = snapshot.events_failed,
                    "Replication progress: {}",
                    snapshot
                );
            }
        })
    }
}
