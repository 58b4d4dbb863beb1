// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-scope worker.
//!
//! Each worker owns one scope for the duration of a cycle:
//! 1. Claims the scope and loads its committed cursor (or the configured
//!    start position if nothing was ever committed)
//! 2. Fetches the next batch strictly after the cursor
//! 3. Filters it
//! 4. Publishes the kept events to every destination
//! 5. Commits the batch's last position, only if every kept event was
//!    acknowledged everywhere
//! 6. Repeats until the source returns an empty batch
//!
//! # Stop Handling
//!
//! The stop signal is checked between batches and observed during backoff
//! sleeps. A batch interrupted by a stop is never committed; the next cycle
//! replays it (destinations treat the repeats as duplicates).

use super::claims::ScopeClaims;
use super::types::{ScopeOutcome, ScopeState};
use crate::config::StartPosition;
use crate::cursor::{Cursor, CursorStore};
use crate::error::ReplicationError;
use crate::fetch::BatchFetcher;
use crate::filter::{filter_batch, FilterCriteria, RecentlySeen};
use crate::metrics;
use crate::progress::ProgressReporter;
use crate::publish::{PublishReport, Publisher};
use crate::relay::{RelayClient, RelayLink};
use crate::scope::Scope;
use crate::shutdown::StopSignal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, info_span, warn, Instrument};

/// Everything a worker needs, shared by all workers of an engine.
pub(crate) struct WorkerShared<R: RelayClient, C: CursorStore> {
    pub relay: Arc<R>,
    pub cursors: Arc<C>,
    pub fetcher: BatchFetcher,
    pub publisher: Publisher,
    pub criteria: Arc<FilterCriteria>,
    pub seen: Arc<RecentlySeen>,
    pub progress: Arc<ProgressReporter>,
    pub claims: ScopeClaims,
    pub default_source: String,
    pub destinations: Vec<String>,
    pub connect_timeout: Duration,
    pub start: StartPosition,
}

/// Replicate one scope until it is caught up, fails, or a stop is requested.
pub(crate) async fn run_scope<R: RelayClient, C: CursorStore>(
    shared: Arc<WorkerShared<R, C>>,
    scope: Scope,
    stop: StopSignal,
) -> ScopeOutcome {
    let scope_key = scope.key();
    let span = info_span!("scope", scope = %scope_key);

    async move {
        let shared: &WorkerShared<R, C> = &shared;
        if stop.is_stopped() {
            debug!("Stop requested before scope started");
            return ScopeOutcome::not_started(&scope_key);
        }

        let _claim = match shared.claims.claim(&scope_key) {
            Ok(claim) => claim,
            Err(e) => {
                warn!(error = %e, "Scope already claimed");
                return shared.finish(ScopeOutcome::failed(&scope_key, e.to_string()), Some(&e));
            }
        };

        let committed = match shared.cursors.load(&scope_key).await {
            Ok(cursor) => cursor,
            Err(e) => {
                warn!(error = %e, "Failed to load cursor");
                return shared.finish(ScopeOutcome::failed(&scope_key, e.to_string()), Some(&e));
            }
        };
        let cursor = if committed.is_beginning() {
            shared.start.resolve(unix_now())
        } else {
            committed
        };

        let mut worker = ScopeWorker {
            shared,
            scope: &scope,
            stop: &stop,
            outcome: ScopeOutcome::pending(&scope_key, cursor.clone()),
            cursor,
            source: RelayLink::new(
                Arc::clone(&shared.relay),
                scope.source(&shared.default_source),
                shared.connect_timeout,
            ),
            destinations: shared
                .destinations
                .iter()
                .map(|d| RelayLink::new(Arc::clone(&shared.relay), d.as_str(), shared.connect_timeout))
                .collect(),
        };

        info!(cursor = %worker.cursor, source = %worker.source.endpoint(), "Replicating scope");
        let error = worker.run().await;
        worker.close().await;

        let cursor = worker.cursor;
        let outcome = worker.outcome;
        match &error {
            Some(e) => warn!(
                state = %outcome.final_state,
                cursor = %cursor,
                published = outcome.events_published,
                error = %e,
                "Scope failed"
            ),
            None if outcome.stopped => info!(cursor = %cursor, "Scope stopped"),
            None => info!(
                cursor = %cursor,
                batches = outcome.batches,
                published = outcome.events_published,
                "Scope caught up"
            ),
        }
        shared.finish(outcome, error.as_ref())
    }
    .instrument(span)
    .await
}

fn unix_now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}

impl<R: RelayClient, C: CursorStore> WorkerShared<R, C> {
    fn finish(&self, outcome: ScopeOutcome, error: Option<&ReplicationError>) -> ScopeOutcome {
        if outcome.final_state.is_terminal() {
            self.progress.scope_finished(!outcome.is_failed());
        }
        metrics::record_scope_outcome(&outcome.final_state.to_string(), error.map(ReplicationError::kind));
        outcome
    }
}

struct ScopeWorker<'a, R: RelayClient, C: CursorStore> {
    shared: &'a WorkerShared<R, C>,
    scope: &'a Scope,
    stop: &'a StopSignal,
    outcome: ScopeOutcome,
    cursor: Cursor,
    source: RelayLink<R>,
    destinations: Vec<RelayLink<R>>,
}

impl<R: RelayClient, C: CursorStore> ScopeWorker<'_, R, C> {
    fn transition(&mut self, next: ScopeState) {
        debug!(from = %self.outcome.final_state, to = %next, "Scope state transition");
        self.outcome.final_state = next;
    }

    /// Drive the state machine. Returns the error that failed the scope.
    async fn run(&mut self) -> Option<ReplicationError> {
        loop {
            if self.stop.is_stopped() {
                self.outcome.stopped = true;
                return None;
            }

            self.transition(ScopeState::Fetching);
            let fetched = match self
                .shared
                .fetcher
                .fetch_next(&mut self.source, self.scope, &self.cursor, self.stop)
                .await
            {
                Ok(fetched) => fetched,
                Err(ReplicationError::Shutdown) => return self.stopped(),
                Err(e) => return self.fail(e),
            };
            self.add_retries(fetched.retries);

            let batch = fetched.batch;
            let Some(next_cursor) = batch.last_position() else {
                self.transition(ScopeState::Idle);
                return None;
            };
            self.outcome.events_fetched += batch.len();
            self.shared.progress.add_fetched(batch.len());

            self.transition(ScopeState::Filtering);
            let filtered = filter_batch(&batch, &self.shared.criteria, &self.shared.seen);
            let dropped = filtered.dropped.total();
            self.outcome.events_filtered += dropped;
            self.shared.progress.add_filtered(dropped);
            if dropped > 0 {
                debug!(fetched = batch.len(), dropped, "Filtered batch");
            }

            self.transition(ScopeState::Publishing);
            let report = self
                .shared
                .publisher
                .publish_batch(&mut self.destinations, &filtered.events, &self.shared.seen, self.stop)
                .await;
            self.record_publish(&report);

            if report.aborted {
                return self.stopped();
            }
            if let Some(first) = report.failed.first() {
                return self.fail(ReplicationError::publish_rejected(
                    &first.event_id,
                    &first.endpoint,
                    format!(
                        "{} of {} event(s) not delivered, batch not committed ({})",
                        report.failed_events(),
                        filtered.events.len(),
                        first.error
                    ),
                    first.transient,
                ));
            }

            self.transition(ScopeState::Committing);
            if let Err(e) = self.shared.cursors.commit(&self.outcome.scope_key, &next_cursor).await {
                return self.fail(e);
            }
            debug!(cursor = %next_cursor, events = batch.len(), "Committed batch");
            self.cursor = next_cursor;
            self.outcome.cursor_after = Some(self.cursor.clone());
            self.outcome.batches += 1;
            self.shared.progress.batch_committed();

            self.transition(ScopeState::Pending);
        }
    }

    fn record_publish(&mut self, report: &PublishReport) {
        let failed = report.failed_events();
        self.outcome.events_published += report.published;
        self.outcome.events_failed += failed;
        self.shared.progress.add_published(report.published);
        self.shared.progress.add_failed_events(failed);
        self.add_retries(report.retries);
    }

    fn add_retries(&mut self, retries: usize) {
        self.outcome.retries += retries;
        self.shared.progress.add_retries(retries);
    }

    fn stopped(&mut self) -> Option<ReplicationError> {
        self.transition(ScopeState::Pending);
        self.outcome.stopped = true;
        None
    }

    fn fail(&mut self, error: ReplicationError) -> Option<ReplicationError> {
        self.transition(ScopeState::Failed);
        self.outcome.error = Some(error.to_string());
        Some(error)
    }

    async fn close(&mut self) {
        self.source.close().await;
        for link in &mut self.destinations {
            link.close().await;
        }
    }
}
