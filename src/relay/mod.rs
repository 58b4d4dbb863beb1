// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Relay client abstraction.
//!
//! The engine only needs four capabilities from a relay: connect, query events
//! matching a filter, publish an event, close. The wire protocol lives behind
//! [`RelayClient`] / [`RelaySession`]; a daemon plugs in a websocket client,
//! tests and standalone runs use [`MemoryRelayNetwork`].
//!
//! # Session Lifecycle
//!
//! ```text
//! Disconnected ──session()──→ Connected ──query/publish──→ Connected
//!      ↑                          │
//!      └──────── reset() ←────────┘  (timeout or connection error)
//! ```
//!
//! Sessions are **lazy** and **per worker**: a [`RelayLink`] connects on first
//! use, and after a timeout or connection error it drops the session so the
//! next attempt reconnects. Sessions are not assumed safe for concurrent use,
//! so the session methods take `&mut self`.
//!
//! # Timeouts
//!
//! Every network wait goes through [`bounded()`], which turns an expired wait
//! into [`ReplicationError::Timeout`] rather than a connection error so retry
//! policy and logs can tell them apart.

mod memory;

pub use memory::{MemoryRelay, MemoryRelayNetwork};

use crate::cursor::Cursor;
use crate::error::{ReplicationError, Result};
use crate::event::Event;
use crate::metrics;
use crate::scope::Scope;
use crate::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Constraints for a relay query.
///
/// Empty lists mean "no constraint".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryFilter {
    /// Event authors.
    pub authors: Vec<String>,
    /// Event kinds.
    pub kinds: Vec<u16>,
    /// Specific event ids.
    pub ids: Vec<String>,
    /// Maximum events to return.
    pub limit: usize,
}

impl QueryFilter {
    /// Filter for the events of one scope.
    pub fn for_scope(scope: &Scope, kinds: &[u16], limit: usize) -> Self {
        Self {
            authors: scope.authors(),
            kinds: kinds.to_vec(),
            ids: Vec::new(),
            limit,
        }
    }

    /// Filter matching specific event ids.
    pub fn by_ids(ids: Vec<String>) -> Self {
        let limit = ids.len();
        Self {
            authors: Vec::new(),
            kinds: Vec::new(),
            ids,
            limit,
        }
    }

    /// Whether an event satisfies the author/kind/id constraints.
    pub fn matches(&self, event: &Event) -> bool {
        (self.authors.is_empty() || self.authors.iter().any(|a| a == &event.pubkey))
            && (self.kinds.is_empty() || self.kinds.contains(&event.kind))
            && (self.ids.is_empty() || self.ids.iter().any(|id| id == &event.id))
    }
}

/// Positive publish acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// The relay stored the event.
    Accepted,
    /// The relay already held the event.
    Duplicate,
}

/// An open session with one relay.
pub trait RelaySession: Send {
    /// Endpoint this session is connected to.
    fn endpoint(&self) -> &str;

    /// Events matching `filter` strictly after `after`, ascending, at most
    /// `filter.limit`. Must be side-effect-free so it can be retried.
    fn query<'a>(&'a mut self, filter: &'a QueryFilter, after: &'a Cursor) -> BoxFuture<'a, Vec<Event>>;

    /// Publish one event. Publishing an event the relay already holds must
    /// return [`Ack::Duplicate`], not an error.
    fn publish<'a>(&'a mut self, event: &'a Event) -> BoxFuture<'a, Ack>;

    /// Close the session.
    fn close(&mut self) -> BoxFuture<'_, ()>;
}

/// Factory for relay sessions.
pub trait RelayClient: Send + Sync + 'static {
    /// Open a session; fails with [`ReplicationError::Connection`].
    fn connect<'a>(&'a self, endpoint: &'a str) -> BoxFuture<'a, Box<dyn RelaySession>>;
}

/// Run `future`, failing with [`ReplicationError::Timeout`] after `limit`.
pub async fn bounded<T, F>(operation: &str, endpoint: &str, limit: Duration, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(ReplicationError::timeout(operation, endpoint, limit)),
    }
}

/// Errors after which a session can no longer be trusted.
fn poisons_session(error: &ReplicationError) -> bool {
    matches!(
        error,
        ReplicationError::Connection { .. } | ReplicationError::Timeout { .. }
    )
}

/// One worker's lazily connected session to one endpoint.
pub struct RelayLink<R: RelayClient> {
    client: Arc<R>,
    endpoint: String,
    connect_timeout: Duration,
    session: Option<Box<dyn RelaySession>>,
    connects: u32,
}

impl<R: RelayClient> RelayLink<R> {
    /// Create a link (not yet connected).
    pub fn new(client: Arc<R>, endpoint: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            connect_timeout,
            session: None,
            connects: 0,
        }
    }

    /// Endpoint this link talks to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Whether a session is currently open.
    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Number of sessions opened so far.
    pub fn connect_count(&self) -> u32 {
        self.connects
    }

    /// The open session, connecting first if needed.
    pub async fn session(&mut self) -> Result<&mut Box<dyn RelaySession>> {
        if self.session.is_none() {
            let start = Instant::now();
            let result = bounded(
                "connect",
                &self.endpoint,
                self.connect_timeout,
                self.client.connect(&self.endpoint),
            )
            .await;
            metrics::record_relay_connection(&self.endpoint, result.is_ok());

            let session = result.inspect_err(|e| {
                warn!(endpoint = %self.endpoint, error = %e, "Relay connection failed");
            })?;
            self.connects += 1;
            if self.connects > 1 {
                info!(endpoint = %self.endpoint, connects = self.connects, "Reconnected to relay");
            } else {
                debug!(endpoint = %self.endpoint, elapsed_ms = start.elapsed().as_millis() as u64, "Connected to relay");
            }
            self.session = Some(session);
        }

        self.session
            .as_mut()
            .ok_or_else(|| ReplicationError::Internal("relay session missing after connect".into()))
    }

    /// Query through this link, bounded by `limit`.
    ///
    /// A timeout or connection error drops the session.
    pub async fn query(&mut self, filter: &QueryFilter, after: &Cursor, limit: Duration) -> Result<Vec<Event>> {
        let endpoint = self.endpoint.clone();
        let start = Instant::now();
        let result = match self.session().await {
            Ok(session) => bounded("query", &endpoint, limit, session.query(filter, after)).await,
            Err(e) => Err(e),
        };
        metrics::record_relay_operation(&endpoint, "query", start.elapsed());
        self.settle(result).await
    }

    /// Publish through this link, bounded by `limit`.
    ///
    /// A timeout or connection error drops the session.
    pub async fn publish(&mut self, event: &Event, limit: Duration) -> Result<Ack> {
        let endpoint = self.endpoint.clone();
        let start = Instant::now();
        let result = match self.session().await {
            Ok(session) => bounded("publish", &endpoint, limit, session.publish(event)).await,
            Err(e) => Err(e),
        };
        metrics::record_relay_operation(&endpoint, "publish", start.elapsed());
        self.settle(result).await
    }

    async fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if poisons_session(e) {
                self.reset().await;
            }
        }
        result
    }

    /// Close and drop the current session, if any.
    pub async fn reset(&mut self) {
        if let Some(mut session) = self.session.take() {
            let closed = bounded("close", &self.endpoint, self.connect_timeout, session.close()).await;
            if let Err(e) = closed {
                debug!(endpoint = %self.endpoint, error = %e, "Ignoring error while closing relay session");
            }
        }
    }

    /// Close the link at the end of a worker's cycle.
    pub async fn close(&mut self) {
        self.reset().await;
    }
}
