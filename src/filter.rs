// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Dedup/filter stage.
//!
//! Removes events that should not be published: kinds or publishers outside
//! the allow-lists, events whose id or signature does not verify, and events
//! this engine already delivered everywhere. Kept events are passed through
//! unmodified and in their original order.
//!
//! Dropping an event here never blocks the cursor: the whole fetched batch is
//! what the cursor advances over, filtered or not.

use crate::config::FilterConfig;
use crate::event::{Batch, Event, EventDefect};
use crate::metrics;
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

/// Why an event was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// Kind not in the allow-list.
    Kind,
    /// Author not in the publisher allow-list.
    Publisher,
    /// Already delivered to every destination by this engine.
    AlreadySeen,
    /// Id does not match the event content, or the event is malformed.
    InvalidId,
    /// Signature does not verify against the author key.
    InvalidSignature,
}

impl DropReason {
    /// Label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kind => "kind",
            Self::Publisher => "publisher",
            Self::AlreadySeen => "already_seen",
            Self::InvalidId => "invalid_id",
            Self::InvalidSignature => "invalid_signature",
        }
    }
}

/// Inclusion criteria.
#[derive(Debug, Clone, Default)]
pub struct FilterCriteria {
    kinds: Option<HashSet<u16>>,
    publishers: Option<HashSet<String>>,
    verify_events: bool,
}

impl FilterCriteria {
    /// Build from configuration. Empty lists allow everything.
    pub fn from_config(config: &FilterConfig) -> Self {
        Self {
            kinds: (!config.kinds.is_empty()).then(|| config.kinds.iter().copied().collect()),
            publishers: (!config.publishers.is_empty())
                .then(|| config.publishers.iter().map(|p| p.trim().to_string()).collect()),
            verify_events: config.verify_events,
        }
    }

    /// Criteria that keep every event.
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// The first reason `event` fails the criteria, if any.
    pub fn check(&self, event: &Event) -> Option<DropReason> {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return Some(DropReason::Kind);
            }
        }
        if let Some(publishers) = &self.publishers {
            if !publishers.contains(&event.pubkey) {
                return Some(DropReason::Publisher);
            }
        }
        if self.verify_events {
            return match event.verify() {
                Ok(()) => None,
                Err(EventDefect::InvalidSignature) => Some(DropReason::InvalidSignature),
                Err(EventDefect::InvalidId | EventDefect::Malformed) => Some(DropReason::InvalidId),
            };
        }
        None
    }
}

/// Bounded set of event ids confirmed published during this engine's lifetime.
///
/// Evicts the oldest id once `capacity` is reached. Shared by all workers.
#[derive(Debug)]
pub struct RecentlySeen {
    capacity: usize,
    inner: Mutex<SeenInner>,
}

#[derive(Debug, Default)]
struct SeenInner {
    ids: HashSet<String>,
    order: VecDeque<String>,
}

impl RecentlySeen {
    /// Create a set holding at most `capacity` ids. Zero disables it.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(SeenInner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SeenInner> {
        // A poisoned lock only means another worker panicked mid-insert; the
        // set is still a valid (if slightly stale) cache.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether `id` was recorded.
    pub fn contains(&self, id: &str) -> bool {
        self.lock().ids.contains(id)
    }

    /// Record `id`, evicting the oldest entry at capacity.
    pub fn insert(&self, id: &str) {
        if self.capacity == 0 {
            return;
        }
        let mut inner = self.lock();
        if !inner.ids.insert(id.to_string()) {
            return;
        }
        inner.order.push_back(id.to_string());
        while inner.order.len() > self.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.ids.remove(&evicted);
            }
        }
    }

    /// Number of ids held.
    pub fn len(&self) -> usize {
        self.lock().ids.len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum ids held.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Drop counts by reason.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DropCounts {
    pub kind: usize,
    pub publisher: usize,
    pub already_seen: usize,
    pub invalid_id: usize,
    pub invalid_signature: usize,
}

impl DropCounts {
    fn record(&mut self, reason: DropReason) {
        match reason {
            DropReason::Kind => self.kind += 1,
            DropReason::Publisher => self.publisher += 1,
            DropReason::AlreadySeen => self.already_seen += 1,
            DropReason::InvalidId => self.invalid_id += 1,
            DropReason::InvalidSignature => self.invalid_signature += 1,
        }
    }

    /// Total dropped.
    pub fn total(&self) -> usize {
        self.kind + self.publisher + self.already_seen + self.invalid_id + self.invalid_signature
    }
}

/// Output of the filter stage.
#[derive(Debug, Clone, Default)]
pub struct Filtered {
    /// Events to publish, in batch order.
    pub events: Vec<Event>,
    /// What was dropped and why.
    pub dropped: DropCounts,
}

/// Apply `criteria` and the recently-seen set to a batch.
pub fn filter_batch(batch: &Batch, criteria: &FilterCriteria, seen: &RecentlySeen) -> Filtered {
    let mut filtered = Filtered::default();

    for event in batch.iter() {
        let reason = criteria
            .check(event)
            .or_else(|| seen.contains(&event.id).then_some(DropReason::AlreadySeen));
        match reason {
            Some(reason) => filtered.dropped.record(reason),
            None => filtered.events.push(event.clone()),
        }
    }

    let dropped = &filtered.dropped;
    metrics::record_events_filtered(DropReason::Kind.as_str(), dropped.kind);
    metrics::record_events_filtered(DropReason::Publisher.as_str(), dropped.publisher);
    metrics::record_events_filtered(DropReason::AlreadySeen.as_str(), dropped.already_seen);
    metrics::record_events_filtered(DropReason::InvalidId.as_str(), dropped.invalid_id);
    metrics::record_events_filtered(DropReason::InvalidSignature.as_str(), dropped.invalid_signature);

    filtered
}
