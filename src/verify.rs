// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync verification.
//!
//! Spot-checks that what a scope's cursor claims was replicated is actually
//! present at every destination. Samples source events after a starting
//! position, keeps those at or before the committed cursor (and that pass the
//! filter, since dropped events are never published), then asks each
//! destination for those ids.
//!
//! Verification is read-only: it never publishes or moves a cursor.

use crate::cursor::{Cursor, CursorStore};
use crate::error::Result;
use crate::event::Batch;
use crate::filter::FilterCriteria;
use crate::metrics;
use crate::relay::{QueryFilter, RelayClient, RelayLink};
use crate::scope::Scope;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// An event missing from a destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingEvent {
    pub event_id: String,
    pub endpoint: String,
}

/// Result of verifying one scope.
#[derive(Debug, Clone)]
pub struct VerificationReport {
    pub scope_key: String,
    /// Committed cursor at verification time.
    pub committed: Cursor,
    /// Source events checked against every destination.
    pub checked: usize,
    pub missing: Vec<MissingEvent>,
}

impl VerificationReport {
    /// True when every checked event was found everywhere.
    pub fn is_consistent(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Compares source and destination relays for replicated scopes.
pub struct SyncVerifier<R: RelayClient, C: CursorStore> {
    relay: Arc<R>,
    cursors: Arc<C>,
    default_source: String,
    destinations: Vec<String>,
    kinds: Vec<u16>,
    criteria: FilterCriteria,
    connect_timeout: Duration,
    query_timeout: Duration,
}

impl<R: RelayClient, C: CursorStore> SyncVerifier<R, C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        relay: Arc<R>,
        cursors: Arc<C>,
        default_source: impl Into<String>,
        destinations: Vec<String>,
        kinds: Vec<u16>,
        criteria: FilterCriteria,
        connect_timeout: Duration,
        query_timeout: Duration,
    ) -> Self {
        Self {
            relay,
            cursors,
            default_source: default_source.into(),
            destinations,
            kinds,
            criteria,
            connect_timeout,
            query_timeout,
        }
    }

    /// Check up to `sample` source events after `from` against every destination.
    pub async fn verify_scope(&self, scope: &Scope, from: &Cursor, sample: usize) -> Result<VerificationReport> {
        let scope_key = scope.key();
        let committed = self.cursors.load(&scope_key).await?;
        let mut report = VerificationReport {
            scope_key: scope_key.clone(),
            committed: committed.clone(),
            checked: 0,
            missing: Vec::new(),
        };
        if sample == 0 || committed <= *from {
            return Ok(report);
        }

        let mut source = RelayLink::new(
            Arc::clone(&self.relay),
            scope.source(&self.default_source),
            self.connect_timeout,
        );
        let filter = QueryFilter::for_scope(scope, &self.kinds, sample);
        let fetched = source.query(&filter, from, self.query_timeout).await;
        source.close().await;

        let ids: Vec<String> = Batch::after(from, fetched?, sample)
            .iter()
            .filter(|e| e.position() <= committed && self.criteria.check(e).is_none())
            .map(|e| e.id.clone())
            .collect();
        report.checked = ids.len();
        if ids.is_empty() {
            return Ok(report);
        }

        for endpoint in &self.destinations {
            let mut link = RelayLink::new(Arc::clone(&self.relay), endpoint.as_str(), self.connect_timeout);
            let found = link
                .query(&QueryFilter::by_ids(ids.clone()), &Cursor::beginning(), self.query_timeout)
                .await;
            link.close().await;

            let present: HashSet<String> = found?.into_iter().map(|e| e.id).collect();
            report.missing.extend(
                ids.iter()
                    .filter(|id| !present.contains(*id))
                    .map(|id| MissingEvent {
                        event_id: id.clone(),
                        endpoint: endpoint.clone(),
                    }),
            );
        }

        metrics::record_verification(scope.mode(), report.checked, report.missing.len());
        if report.is_consistent() {
            info!(scope = %scope_key, checked = report.checked, "Scope verified");
        } else {
            warn!(
                scope = %scope_key,
                checked = report.checked,
                missing = report.missing.len(),
                "Events missing at destination"
            );
        }
        Ok(report)
    }
}
