// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process relays.
//!
//! A [`MemoryRelayNetwork`] maps endpoints to [`MemoryRelay`]s and implements
//! [`RelayClient`], so the engine can run end to end without sockets. Relays
//! are created on first reference; an endpoint can be marked unreachable to
//! simulate an outage.

use super::{Ack, QueryFilter, RelayClient, RelaySession};
use crate::cursor::Cursor;
use crate::error::{ReplicationError, Result};
use crate::event::Event;
use crate::BoxFuture;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// One relay's event store.
#[derive(Debug)]
pub struct MemoryRelay {
    endpoint: String,
    events: DashMap<String, Event>,
    reachable: AtomicBool,
    publish_attempts: AtomicU64,
    queries: AtomicU64,
}

impl MemoryRelay {
    /// Create an empty, reachable relay.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            events: DashMap::new(),
            reachable: AtomicBool::new(true),
            publish_attempts: AtomicU64::new(0),
            queries: AtomicU64::new(0),
        }
    }

    /// Endpoint this relay answers on.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Store an event directly (seeding a source relay).
    pub fn insert(&self, event: Event) {
        self.events.insert(event.id.clone(), event);
    }

    /// All stored events in `(created_at, id)` order.
    pub fn events(&self) -> Vec<Event> {
        let mut events: Vec<Event> = self.events.iter().map(|e| e.value().clone()).collect();
        events.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        events
    }

    /// Whether an event id is stored.
    pub fn contains(&self, id: &str) -> bool {
        self.events.contains_key(id)
    }

    /// Number of stored events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Publish calls received, including duplicates and rejections.
    pub fn publish_attempts(&self) -> u64 {
        self.publish_attempts.load(Ordering::Relaxed)
    }

    /// Query calls received.
    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    /// Whether sessions can reach this relay.
    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::Acquire)
    }

    fn check_reachable(&self) -> Result<()> {
        if self.is_reachable() {
            Ok(())
        } else {
            Err(ReplicationError::connection(&self.endpoint, "relay unreachable"))
        }
    }

    /// Events matching `filter` strictly after `after`, ascending.
    pub fn query(&self, filter: &QueryFilter, after: &Cursor) -> Result<Vec<Event>> {
        self.check_reachable()?;
        self.queries.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .events()
            .into_iter()
            .filter(|e| filter.matches(e) && after.precedes(e))
            .take(filter.limit)
            .collect())
    }

    /// Store an event. Idempotent by id; events whose id or signature does
    /// not verify are rejected permanently.
    pub fn publish(&self, event: &Event) -> Result<Ack> {
        self.check_reachable()?;
        self.publish_attempts.fetch_add(1, Ordering::Relaxed);

        if let Err(defect) = event.verify() {
            return Err(ReplicationError::publish_rejected(
                &event.id,
                &self.endpoint,
                format!("invalid: {}", defect),
                false,
            ));
        }

        match self.events.entry(event.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(Ack::Duplicate),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(event.clone());
                Ok(Ack::Accepted)
            }
        }
    }
}

/// A set of in-process relays addressed by endpoint.
#[derive(Debug, Default)]
pub struct MemoryRelayNetwork {
    relays: DashMap<String, Arc<MemoryRelay>>,
}

impl MemoryRelayNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// The relay at `endpoint`, created on first use.
    pub fn relay(&self, endpoint: &str) -> Arc<MemoryRelay> {
        Arc::clone(
            self.relays
                .entry(endpoint.to_string())
                .or_insert_with(|| Arc::new(MemoryRelay::new(endpoint)))
                .value(),
        )
    }

    /// Mark an endpoint reachable or unreachable.
    pub fn set_reachable(&self, endpoint: &str, reachable: bool) {
        self.relay(endpoint).reachable.store(reachable, Ordering::Release);
    }
}

impl RelayClient for MemoryRelayNetwork {
    fn connect<'a>(&'a self, endpoint: &'a str) -> BoxFuture<'a, Box<dyn RelaySession>> {
        Box::pin(async move {
            let relay = self.relay(endpoint);
            relay.check_reachable()?;
            Ok(Box::new(MemorySession { relay }) as Box<dyn RelaySession>)
        })
    }
}

struct MemorySession {
    relay: Arc<MemoryRelay>,
}

impl RelaySession for MemorySession {
    fn endpoint(&self) -> &str {
        self.relay.endpoint()
    }

    fn query<'a>(&'a mut self, filter: &'a QueryFilter, after: &'a Cursor) -> BoxFuture<'a, Vec<Event>> {
        Box::pin(async move { self.relay.query(filter, after) })
    }

    fn publish<'a>(&'a mut self, event: &'a Event) -> BoxFuture<'a, Ack> {
        Box::pin(async move { self.relay.publish(event) })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}
