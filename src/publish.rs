// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Publisher.
//!
//! Delivers a filtered batch to every destination relay, one event at a time
//! in batch order. For each `(event, destination)` pair:
//!
//! ```text
//! rate-limit permit ──→ publish (bounded) ──ok──→ Accepted | Duplicate
//!                            │
//!                            ├─ transient ──→ backoff ──→ retry (up to the ceiling)
//!                            └─ permanent / exhausted ──→ FailedEvent, continue batch
//! ```
//!
//! A failure for one event does not stop the rest of the batch from being
//! attempted, but it does make the batch not fully published, which keeps the
//! cursor where it was. Only a stop request cuts the batch short.

use crate::config::ReplicationSettings;
use crate::error::{ReplicationError, Result};
use crate::event::Event;
use crate::filter::RecentlySeen;
use crate::metrics;
use crate::relay::{Ack, RelayClient, RelayLink};
use crate::resilience::{RateLimiter, RetryConfig};
use crate::shutdown::StopSignal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// An event one destination did not acknowledge.
#[derive(Debug, Clone)]
pub struct FailedEvent {
    pub event_id: String,
    pub endpoint: String,
    pub error: String,
    /// Whether the last error was transient (retry ceiling reached).
    pub transient: bool,
}

/// Outcome of publishing one batch.
#[derive(Debug, Clone, Default)]
pub struct PublishReport {
    /// Events acknowledged by every destination.
    pub published: usize,
    /// Of those, events every destination already held.
    pub duplicates: usize,
    /// Per-destination failures.
    pub failed: Vec<FailedEvent>,
    /// Publish attempts beyond the first, summed over all deliveries.
    pub retries: usize,
    /// A stop request cut the batch short.
    pub aborted: bool,
}

impl PublishReport {
    /// True when every event reached every destination.
    pub fn is_fully_published(&self) -> bool {
        self.failed.is_empty() && !self.aborted
    }

    /// Distinct events with at least one failed delivery.
    pub fn failed_events(&self) -> usize {
        let mut ids: Vec<&str> = self.failed.iter().map(|f| f.event_id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }
}

/// Publishes batches to destination relays.
#[derive(Debug, Clone)]
pub struct Publisher {
    publish_timeout: Duration,
    retry: RetryConfig,
    rate_limiter: Option<Arc<RateLimiter>>,
}

impl Publisher {
    /// Create a publisher.
    pub fn new(publish_timeout: Duration, retry: RetryConfig, rate_limiter: Option<Arc<RateLimiter>>) -> Self {
        Self {
            publish_timeout,
            retry,
            rate_limiter,
        }
    }

    /// Build from engine settings. The rate limiter, if any, is shared by
    /// every worker using this publisher.
    pub fn from_settings(settings: &ReplicationSettings) -> Self {
        Self::new(
            settings.publish_timeout_duration(),
            settings.retry_config(),
            settings
                .publish_rate_limit
                .clone()
                .map(|config| Arc::new(RateLimiter::new(config))),
        )
    }

    /// Publish `events` in order to every destination.
    ///
    /// Events acknowledged everywhere are recorded in `seen`.
    pub async fn publish_batch<R: RelayClient>(
        &self,
        destinations: &mut [RelayLink<R>],
        events: &[Event],
        seen: &RecentlySeen,
        stop: &StopSignal,
    ) -> PublishReport {
        let mut report = PublishReport::default();
        let mut accepted = vec![0usize; destinations.len()];
        let mut duplicates = vec![0usize; destinations.len()];

        'events: for event in events {
            if stop.is_stopped() {
                report.aborted = true;
                break;
            }

            let mut delivered = true;
            let mut all_duplicate = true;

            for (index, link) in destinations.iter_mut().enumerate() {
                match self.publish_one(link, event, &mut report.retries, stop).await {
                    Ok(Ack::Accepted) => {
                        accepted[index] += 1;
                        all_duplicate = false;
                    }
                    Ok(Ack::Duplicate) => duplicates[index] += 1,
                    Err(ReplicationError::Shutdown) => {
                        report.aborted = true;
                        break 'events;
                    }
                    Err(e) => {
                        warn!(
                            event_id = %event.id,
                            endpoint = %link.endpoint(),
                            error = %e,
                            "Event not delivered"
                        );
                        metrics::record_publish_failure(link.endpoint(), e.is_retryable());
                        report.failed.push(FailedEvent {
                            event_id: event.id.clone(),
                            endpoint: link.endpoint().to_string(),
                            transient: e.is_retryable(),
                            error: e.to_string(),
                        });
                        delivered = false;
                    }
                }
            }

            if delivered {
                report.published += 1;
                if all_duplicate {
                    report.duplicates += 1;
                }
                seen.insert(&event.id);
            }
        }

        for (index, link) in destinations.iter().enumerate() {
            metrics::record_events_published(link.endpoint(), accepted[index], duplicates[index]);
        }

        report
    }

    async fn publish_one<R: RelayClient>(
        &self,
        link: &mut RelayLink<R>,
        event: &Event,
        retries: &mut usize,
        stop: &StopSignal,
    ) -> Result<Ack> {
        let mut attempts = 0usize;
        loop {
            attempts += 1;
            if let Some(limiter) = &self.rate_limiter {
                limiter.acquire().await;
            }

            match link.publish(event, self.publish_timeout).await {
                Ok(ack) => {
                    if ack == Ack::Duplicate {
                        debug!(event_id = %event.id, endpoint = %link.endpoint(), "Destination already had event");
                    }
                    return Ok(ack);
                }
                Err(e) if e.is_retryable() && self.retry.allows_retry(attempts) => {
                    let delay = self.retry.delay_for_attempt(attempts);
                    debug!(
                        event_id = %event.id,
                        endpoint = %link.endpoint(),
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Publish failed, retrying"
                    );
                    metrics::record_retry("publish", e.kind());
                    *retries += 1;
                    stop.sleep(delay).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
