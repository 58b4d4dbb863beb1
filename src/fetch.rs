// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Batch fetcher.
//!
//! Retrieves the next ordered batch of a scope's events from its source relay,
//! strictly after the scope's cursor. Queries are side-effect-free so a failed
//! attempt is simply repeated:
//!
//! ```text
//! attempt 1 ──err──→ sleep(base) ──→ attempt 2 ──err──→ sleep(2·base) ──→ attempt 3 ──err──→ Err
//!     │                                  │                                    │
//!     └──ok──→ Batch                     └──ok──→ Batch                       └──ok──→ Batch
//! ```
//!
//! Non-retryable errors are returned immediately. A stop request during a
//! backoff sleep returns [`ReplicationError::Shutdown`].
//!
//! [`ReplicationError::Shutdown`]: crate::error::ReplicationError::Shutdown

use crate::config::ReplicationSettings;
use crate::cursor::Cursor;
use crate::error::Result;
use crate::event::Batch;
use crate::metrics;
use crate::relay::{QueryFilter, RelayClient, RelayLink};
use crate::resilience::RetryConfig;
use crate::scope::Scope;
use crate::shutdown::StopSignal;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A fetched batch plus the retries it took.
#[derive(Debug)]
pub struct Fetched {
    /// Events strictly after the cursor, ordered, at most `batch_size`.
    pub batch: Batch,
    /// Attempts beyond the first.
    pub retries: usize,
}

/// Fetches ordered batches for a scope.
#[derive(Debug, Clone)]
pub struct BatchFetcher {
    batch_size: usize,
    kinds: Vec<u16>,
    query_timeout: Duration,
    retry: RetryConfig,
}

impl BatchFetcher {
    /// Create a fetcher.
    pub fn new(batch_size: usize, kinds: Vec<u16>, query_timeout: Duration, retry: RetryConfig) -> Self {
        Self {
            batch_size: batch_size.max(1),
            kinds,
            query_timeout,
            retry,
        }
    }

    /// Build from engine settings and the configured kind filter.
    pub fn from_settings(settings: &ReplicationSettings, kinds: &[u16]) -> Self {
        Self::new(
            settings.max_batch_size,
            kinds.to_vec(),
            settings.query_timeout_duration(),
            settings.retry_config(),
        )
    }

    /// Maximum events per batch.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Fetch the next batch of `scope` strictly after `cursor`.
    ///
    /// An empty batch means the scope is caught up.
    pub async fn fetch_next<R: RelayClient>(
        &self,
        source: &mut RelayLink<R>,
        scope: &Scope,
        cursor: &Cursor,
        stop: &StopSignal,
    ) -> Result<Fetched> {
        let filter = QueryFilter::for_scope(scope, &self.kinds, self.batch_size);
        let scope_key = scope.key();
        let mut attempts = 0usize;

        loop {
            attempts += 1;
            let start = Instant::now();

            match source.query(&filter, cursor, self.query_timeout).await {
                Ok(events) => {
                    let returned = events.len();
                    let batch = Batch::after(cursor, events, self.batch_size);
                    if batch.len() < returned {
                        debug!(
                            scope = %scope_key,
                            returned,
                            kept = batch.len(),
                            "Source returned events at or before cursor; discarded"
                        );
                    }
                    metrics::record_batch_fetched(scope.mode(), batch.len(), start.elapsed());
                    return Ok(Fetched {
                        batch,
                        retries: attempts - 1,
                    });
                }
                Err(e) if e.is_retryable() && self.retry.allows_retry(attempts) => {
                    let delay = self.retry.delay_for_attempt(attempts);
                    warn!(
                        scope = %scope_key,
                        endpoint = %source.endpoint(),
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Fetch failed, retrying"
                    );
                    metrics::record_retry("fetch", e.kind());
                    stop.sleep(delay).await?;
                }
                Err(e) => {
                    warn!(
                        scope = %scope_key,
                        endpoint = %source.endpoint(),
                        attempts,
                        error = %e,
                        "Fetch failed"
                    );
                    return Err(e);
                }
            }
        }
    }
}
