// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fault-injecting relay client.
//!
//! Wraps a [`MemoryRelayNetwork`] and injects failures per author, per event
//! or per endpoint. Authors are test names, resolved through [`pubkey`]. Records every accepted publish in arrival order so tests
//! can assert ordering.

use super::fixtures::pubkey;
use dashmap::DashMap;
use relay_replication_engine::{
    Ack, BoxFuture, Cursor, Event, MemoryRelayNetwork, QueryFilter, RelayClient, RelaySession,
    ReplicationError, StopHandle,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A publish the destination accepted or acknowledged as duplicate.
#[derive(Debug, Clone)]
#[allow(dead_code)]
pub struct PublishRecord {
    pub endpoint: String,
    pub event_id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub ack: Ack,
}

#[derive(Default)]
struct Faults {
    /// Remaining transient publish failures per author.
    transient_publish: DashMap<String, usize>,
    /// Authors whose events are permanently rejected.
    rejected_authors: DashMap<String, ()>,
    /// Event ids permanently rejected.
    rejected_ids: DashMap<String, ()>,
    /// Authors whose queries fail with a connection error.
    query_down_authors: DashMap<String, ()>,
    /// Extra latency per endpoint for queries.
    query_delay: DashMap<String, Duration>,
    /// Stop the engine after this many successful publishes.
    stop_after: Mutex<Option<(usize, StopHandle)>>,
}

/// Relay client with injectable faults.
#[derive(Clone)]
pub struct FlakyRelay {
    network: Arc<MemoryRelayNetwork>,
    faults: Arc<Faults>,
    log: Arc<Mutex<Vec<PublishRecord>>>,
    connects: Arc<AtomicUsize>,
    queries_in_flight: Arc<AtomicUsize>,
    max_queries_in_flight: Arc<AtomicUsize>,
}

#[allow(dead_code)]
impl FlakyRelay {
    pub fn new(network: Arc<MemoryRelayNetwork>) -> Self {
        Self {
            network,
            faults: Arc::new(Faults::default()),
            log: Arc::new(Mutex::new(Vec::new())),
            connects: Arc::new(AtomicUsize::new(0)),
            queries_in_flight: Arc::new(AtomicUsize::new(0)),
            max_queries_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn network(&self) -> &Arc<MemoryRelayNetwork> {
        &self.network
    }

    /// Fail the next `times` publishes of `author`'s events with a transient rejection.
    pub fn fail_publishes(&self, author: &str, times: usize) {
        self.faults.transient_publish.insert(pubkey(author), times);
    }

    /// Permanently reject every event by `author`.
    pub fn reject_author(&self, author: &str) {
        self.faults.rejected_authors.insert(pubkey(author), ());
    }

    /// Permanently reject one event.
    pub fn reject_event(&self, event_id: &str) {
        self.faults.rejected_ids.insert(event_id.to_string(), ());
    }

    /// Lift every permanent rejection.
    pub fn clear_rejections(&self) {
        self.faults.rejected_authors.clear();
        self.faults.rejected_ids.clear();
    }

    /// Make queries for `author` fail with a connection error.
    pub fn break_queries_for(&self, author: &str) {
        self.faults.query_down_authors.insert(pubkey(author), ());
    }

    /// Delay every query to `endpoint`.
    pub fn delay_queries(&self, endpoint: &str, delay: Duration) {
        self.faults.query_delay.insert(endpoint.to_string(), delay);
    }

    /// Request a stop once `publishes` publishes have been acknowledged.
    pub fn stop_after_publishes(&self, publishes: usize, handle: StopHandle) {
        *self.faults.stop_after.lock().unwrap() = Some((publishes, handle));
    }

    /// Cancel a pending [`stop_after_publishes`](Self::stop_after_publishes).
    pub fn cancel_stop(&self) {
        *self.faults.stop_after.lock().unwrap() = None;
    }

    /// Every acknowledged publish in arrival order.
    pub fn publish_log(&self) -> Vec<PublishRecord> {
        self.log.lock().unwrap().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn max_queries_in_flight(&self) -> usize {
        self.max_queries_in_flight.load(Ordering::SeqCst)
    }

    fn check_publish(&self, endpoint: &str, event: &Event) -> Result<(), ReplicationError> {
        if self.faults.rejected_authors.contains_key(&event.pubkey)
            || self.faults.rejected_ids.contains_key(&event.id)
        {
            return Err(ReplicationError::publish_rejected(
                &event.id,
                endpoint,
                "blocked: rejected by test",
                false,
            ));
        }
        if let Some(mut remaining) = self.faults.transient_publish.get_mut(&event.pubkey) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ReplicationError::publish_rejected(
                    &event.id,
                    endpoint,
                    "rate-limited: slow down",
                    true,
                ));
            }
        }
        Ok(())
    }

    fn record(&self, endpoint: &str, event: &Event, ack: Ack) {
        let total = {
            let mut log = self.log.lock().unwrap();
            log.push(PublishRecord {
                endpoint: endpoint.to_string(),
                event_id: event.id.clone(),
                pubkey: event.pubkey.clone(),
                created_at: event.created_at,
                ack,
            });
            log.len()
        };
        if let Some((limit, handle)) = self.faults.stop_after.lock().unwrap().as_ref() {
            if total >= *limit {
                handle.stop();
            }
        }
    }
}

impl RelayClient for FlakyRelay {
    fn connect<'a>(&'a self, endpoint: &'a str) -> BoxFuture<'a, Box<dyn RelaySession>> {
        Box::pin(async move {
            let inner = self.network.connect(endpoint).await?;
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FlakySession {
                relay: self.clone(),
                endpoint: endpoint.to_string(),
                inner,
            }) as Box<dyn RelaySession>)
        })
    }
}

struct FlakySession {
    relay: FlakyRelay,
    endpoint: String,
    inner: Box<dyn RelaySession>,
}

impl RelaySession for FlakySession {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn query<'a>(&'a mut self, filter: &'a QueryFilter, after: &'a Cursor) -> BoxFuture<'a, Vec<Event>> {
        Box::pin(async move {
            let faults = &self.relay.faults;
            if filter.authors.iter().any(|a| faults.query_down_authors.contains_key(a)) {
                return Err(ReplicationError::connection(&self.endpoint, "connection reset by test"));
            }

            let in_flight = self.relay.queries_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.relay.max_queries_in_flight.fetch_max(in_flight, Ordering::SeqCst);
            let delay = faults.query_delay.get(&self.endpoint).map(|d| *d);
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let result = self.inner.query(filter, after).await;
            self.relay.queries_in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        })
    }

    fn publish<'a>(&'a mut self, event: &'a Event) -> BoxFuture<'a, Ack> {
        Box::pin(async move {
            self.relay.check_publish(&self.endpoint, event)?;
            let ack = self.inner.publish(event).await?;
            self.relay.record(&self.endpoint, event, ack);
            Ok(ack)
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        self.inner.close()
    }
}
