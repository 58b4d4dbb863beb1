// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication engine coordinator.
//!
//! The work scheduler that ties together:
//! - Scope derivation via [`crate::scope`]
//! - Cursor persistence via [`crate::cursor::CursorStore`]
//! - Fetch / filter / publish per scope via [`worker`]
//! - Aggregate counters via [`crate::progress::ProgressReporter`]
//!
//! # Architecture
//!
//! A cycle replicates a set of scopes, each until it is caught up:
//! 1. Duplicate scopes are collapsed (one worker per cursor key)
//! 2. One task per scope is spawned on a `JoinSet`
//! 3. A bulkhead permit gates each task, so at most `concurrency` run at once
//! 4. Each worker claims its scope and runs the per-scope state machine
//! 5. Outcomes are collected into a [`CycleReport`]
//!
//! A failing scope never affects its siblings: every worker's result,
//! including a panic, becomes that scope's outcome.

mod claims;
mod types;
mod worker;

pub use claims::{ScopeClaim, ScopeClaims};
pub use types::{CycleReport, CycleStatus, ScopeOutcome, ScopeState};

use crate::config::ReplicationConfig;
use crate::cursor::{CursorStore, SqliteCursorStore};
use crate::error::{ReplicationError, Result};
use crate::fetch::BatchFetcher;
use crate::filter::{FilterCriteria, RecentlySeen};
use crate::metrics;
use crate::progress::{ProgressReporter, ProgressSnapshot};
use crate::publish::Publisher;
use crate::relay::RelayClient;
use crate::resilience::Bulkhead;
use crate::scope::{scopes_for, Scope};
use crate::shutdown::{stop_channel, StopHandle, StopSignal};
use crate::verify::SyncVerifier;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use worker::{run_scope, WorkerShared};

/// The replication engine.
///
/// Generic over the relay transport and the cursor store so a daemon can plug
/// in a websocket client and SQLite, and tests can use in-memory versions.
pub struct ReplicationEngine<R: RelayClient, C: CursorStore> {
    config: ReplicationConfig,
    shared: Arc<WorkerShared<R, C>>,
    bulkhead: Bulkhead,
    stop_handle: StopHandle,
    stop_signal: StopSignal,
}

impl<R: RelayClient> ReplicationEngine<R, SqliteCursorStore> {
    /// Create an engine backed by the SQLite cursor store named in the config.
    ///
    /// The scope list is resolved first, so a run with nothing to replicate
    /// never creates or opens the database.
    pub async fn with_sqlite(config: ReplicationConfig, relay: Arc<R>) -> Result<Self> {
        config.validate()?;
        scopes_for(&config)?;
        let cursors = SqliteCursorStore::open(&config.cursor.sqlite_path).await?;
        Self::new(config, relay, Arc::new(cursors))
    }
}

impl<R: RelayClient, C: CursorStore> ReplicationEngine<R, C> {
    /// Create an engine.
    ///
    /// Fails with [`ReplicationError::Config`] if the configuration is invalid.
    pub fn new(config: ReplicationConfig, relay: Arc<R>, cursors: Arc<C>) -> Result<Self> {
        config.validate()?;

        let settings = &config.settings;
        let shared = WorkerShared {
            relay,
            cursors,
            fetcher: BatchFetcher::from_settings(settings, &config.filter.kinds),
            publisher: Publisher::from_settings(settings),
            criteria: Arc::new(FilterCriteria::from_config(&config.filter)),
            seen: Arc::new(RecentlySeen::new(settings.dedup_capacity)),
            progress: Arc::new(ProgressReporter::new()),
            claims: ScopeClaims::new(),
            default_source: config.source.clone(),
            destinations: config.destinations.clone(),
            connect_timeout: settings.connect_timeout_duration(),
            start: settings.start_position(),
        };
        let (stop_handle, stop_signal) = stop_channel();

        Ok(Self {
            bulkhead: Bulkhead::new(settings.concurrency),
            shared: Arc::new(shared),
            stop_handle,
            stop_signal,
            config,
        })
    }

    /// The engine's configuration.
    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Handle for requesting a cooperative stop.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop_handle.clone()
    }

    /// Live progress counters.
    pub fn progress(&self) -> Arc<ProgressReporter> {
        Arc::clone(&self.shared.progress)
    }

    /// Shared scope claims.
    pub fn claims(&self) -> &ScopeClaims {
        &self.shared.claims
    }

    /// The cursor store.
    pub fn cursors(&self) -> &Arc<C> {
        &self.shared.cursors
    }

    /// Scopes named by the configuration.
    pub fn scopes(&self) -> Result<Vec<Scope>> {
        scopes_for(&self.config)
    }

    /// Derive scopes from the configuration and run one cycle over them.
    pub async fn run_configured_cycle(&self) -> Result<CycleReport> {
        let scopes = self.scopes()?;
        self.run_cycle(scopes).await
    }

    /// Replicate every scope until it is caught up, fails, or a stop is requested.
    ///
    /// Only configuration problems are returned as `Err`; everything else is
    /// reported per scope in the [`CycleReport`].
    pub async fn run_cycle(&self, scopes: Vec<Scope>) -> Result<CycleReport> {
        if scopes.is_empty() {
            error!("No scopes to replicate");
            return Err(ReplicationError::Config("no scopes to replicate".to_string()));
        }

        let start = Instant::now();
        let scopes = distinct(scopes);
        let progress = &self.shared.progress;
        progress.reset(scopes.len());

        info!(
            scopes = scopes.len(),
            concurrency = self.bulkhead.max_concurrent(),
            destinations = self.shared.destinations.len(),
            "Starting replication cycle"
        );

        let logger = self
            .config
            .settings
            .progress_log_interval_duration()
            .map(|interval| progress.spawn_logger(interval));

        let keys: Vec<String> = scopes.iter().map(Scope::key).collect();
        let mut slots: Vec<Option<ScopeOutcome>> = vec![None; scopes.len()];
        let mut workers = JoinSet::new();

        for (index, scope) in scopes.into_iter().enumerate() {
            let shared = Arc::clone(&self.shared);
            let bulkhead = self.bulkhead.clone();
            let stop = self.stop_signal.clone();

            workers.spawn(async move {
                let scope_key = scope.key();
                let _permit = match bulkhead.acquire().await {
                    Ok(permit) => permit,
                    Err(e) => return (index, ScopeOutcome::failed(scope_key, e.to_string())),
                };
                metrics::set_active_scopes(shared.claims.len() + 1);

                // Run the worker as its own task so a panic is contained to its scope.
                let outcome = match tokio::spawn(run_scope(shared, scope, stop)).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(scope = %scope_key, error = %e, "Scope worker panicked");
                        let err = ReplicationError::Internal(format!("worker panicked: {}", e));
                        metrics::record_scope_outcome("Failed", Some(err.kind()));
                        ScopeOutcome::failed(scope_key, err.to_string())
                    }
                };
                (index, outcome)
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((index, outcome)) => slots[index] = Some(outcome),
                Err(e) => error!(error = %e, "Scope task failed to complete"),
            }
        }
        if let Some(logger) = logger {
            logger.abort();
        }
        metrics::set_active_scopes(0);

        let outcomes: Vec<ScopeOutcome> = slots
            .into_iter()
            .zip(keys)
            .map(|(slot, key)| slot.unwrap_or_else(|| ScopeOutcome::failed(key, "scope task lost")))
            .collect();

        // Panicked workers never reached the progress counters.
        let progress_snapshot = self.reconcile_progress(&outcomes);
        let report = CycleReport {
            outcomes,
            progress: progress_snapshot,
            elapsed: start.elapsed(),
        };

        let status = report.status();
        metrics::record_cycle(status.as_str(), report.elapsed);
        let failed = report.failed().count();
        if failed > 0 {
            warn!(
                status = %status,
                failed,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "Replication cycle finished with failures: {}",
                report.progress
            );
        } else {
            info!(
                status = %status,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "Replication cycle finished: {}",
                report.progress
            );
        }

        Ok(report)
    }

    fn reconcile_progress(&self, outcomes: &[ScopeOutcome]) -> ProgressSnapshot {
        let mut snapshot = self.shared.progress.snapshot();
        let terminal = outcomes.iter().filter(|o| o.final_state.is_terminal()).count() as u64;
        let missing = terminal.saturating_sub(snapshot.scopes_processed);
        for _ in 0..missing {
            self.shared.progress.scope_finished(false);
        }
        if missing > 0 {
            snapshot = self.shared.progress.snapshot();
        }
        snapshot
    }

    /// A verifier sharing this engine's relay client and cursor store.
    pub fn verifier(&self) -> SyncVerifier<R, C> {
        let settings = &self.config.settings;
        SyncVerifier::new(
            Arc::clone(&self.shared.relay),
            Arc::clone(&self.shared.cursors),
            self.config.source.clone(),
            self.config.destinations.clone(),
            self.config.filter.kinds.clone(),
            FilterCriteria::from_config(&self.config.filter),
            settings.connect_timeout_duration(),
            settings.query_timeout_duration(),
        )
    }

    /// Release the cursor store.
    pub async fn close(&self) -> Result<()> {
        info!("Closing replication engine");
        self.shared.cursors.close().await
    }
}

/// Collapse scopes with the same key, keeping the first.
fn distinct(scopes: Vec<Scope>) -> Vec<Scope> {
    let mut seen = HashSet::new();
    let before = scopes.len();
    let scopes: Vec<Scope> = scopes.into_iter().filter(|s| seen.insert(s.key())).collect();
    if scopes.len() < before {
        warn!(duplicates = before - scopes.len(), "Collapsed duplicate scopes");
    }
    scopes
}
