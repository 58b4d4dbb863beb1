// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Relay Replication Engine
//!
//! A checkpointed replicator for relay event streams (Nostr-style relays).
//!
//! ## Architecture
//!
//! The engine pulls the events of many scopes (one identity, or a named set of
//! publishers) from a source relay and republishes them, unmodified, to one or
//! more destination relays. Each scope has a durable cursor, so a restart
//! neither re-processes committed work nor skips uncommitted work:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                       relay-replication-engine                            │
//! │                                                                           │
//! │  ┌─────────────┐    ┌──────────────┐    ┌──────────┐    ┌─────────────┐   │
//! │  │ Scheduler   │───►│ BatchFetcher │───►│ Filter + │───►│ Publisher   │   │
//! │  │ (bounded    │    │ (source      │    │ dedup    │    │ (every      │   │
//! │  │  workers)   │    │  relay)      │    │          │    │  dest)      │   │
//! │  └─────────────┘    └──────────────┘    └──────────┘    └─────────────┘   │
//! │         │                                                      │          │
//! │         ▼                                                      ▼          │
//! │  ┌─────────────┐                                     ┌─────────────────┐  │
//! │  │ CursorStore │◄──── commit after full-batch ───────│ PublishReport   │  │
//! │  │ (SQLite)    │      success only                   │                 │  │
//! │  └─────────────┘                                     └─────────────────┘  │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Delivery Guarantee
//!
//! At-least-once. A batch is committed only after every kept event was
//! acknowledged by every destination; a crash before the commit replays the
//! batch, and destinations treat the repeats as duplicates.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use relay_replication_engine::{MemoryRelayNetwork, ReplicationConfig, ReplicationEngine};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let relays = Arc::new(MemoryRelayNetwork::new());
//!     let engine = match ReplicationConfig::load("replicator.json") {
//!         Ok(config) => ReplicationEngine::with_sqlite(config, relays).await,
//!         Err(e) => Err(e),
//!     };
//!     // 2 for bad configuration, 4 for an unusable cursor store.
//!     let engine = engine.unwrap_or_else(|e| std::process::exit(e.exit_code()));
//!
//!     let code = match engine.run_configured_cycle().await {
//!         Ok(report) => report.exit_code(),
//!         Err(e) => e.exit_code(),
//!     };
//!     engine.close().await.ok();
//!     std::process::exit(code);
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod cursor;
pub mod error;
pub mod event;
pub mod fetch;
pub mod filter;
pub mod metrics;
pub mod progress;
pub mod publish;
pub mod relay;
pub mod resilience;
pub mod scope;
pub mod shutdown;
pub mod verify;

use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by the relay and cursor store traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = error::Result<T>> + Send + 'a>>;

// Re-exports for convenience
pub use config::{
    FilterConfig, ReplicationConfig, ReplicationMode, ReplicationSettings, StartPosition,
};
pub use coordinator::{CycleReport, CycleStatus, ReplicationEngine, ScopeOutcome, ScopeState};
pub use cursor::{Cursor, CursorStore, MemoryCursorStore, SqliteCursorStore};
pub use error::{ReplicationError, Result};
pub use event::{Batch, Event, EventDefect};
pub use progress::{ProgressReporter, ProgressSnapshot};
pub use relay::{Ack, MemoryRelay, MemoryRelayNetwork, QueryFilter, RelayClient, RelaySession};
pub use scope::{Identity, Scope};
pub use shutdown::{StopHandle, StopSignal};
pub use verify::{SyncVerifier, VerificationReport};
