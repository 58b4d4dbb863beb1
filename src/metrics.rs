// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics through the `metrics` facade for:
//! - Relay connection outcomes and operation latency
//! - Fetch / filter / publish throughput
//! - Retries and failures by error kind
//! - Cursor commits
//! - Cycle outcome and duration
//!
//! Labels are bounded: endpoints, modes, states and error kinds. Scope keys
//! carry one value per identity and never appear as labels.
//!
//! No recorder is installed here; the embedding process decides where
//! metrics go. Without one, every call is a no-op.
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `relay_replication_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use relay_replication_engine::metrics;
//! use std::time::Duration;
//!
//! // In the fetcher after a query returns
//! metrics::record_batch_fetched("identity", 42, Duration::from_millis(80));
//!
//! // In the publisher after a batch is delivered
//! metrics::record_events_published("wss://dest.example", 40, 2);
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Relay Metrics
// =============================================================================

/// Record a relay connection attempt.
pub fn record_relay_connection(endpoint: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("relay_replication_connections_total", "endpoint" => endpoint.to_string(), "status" => status).increment(1);
}

/// Record relay operation latency by operation type (query, publish).
pub fn record_relay_operation(endpoint: &str, operation: &str, duration: Duration) {
    histogram!(
        "relay_replication_relay_operation_duration_seconds",
        "endpoint" => endpoint.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

// =============================================================================
// Pipeline Metrics
// =============================================================================

/// Record a fetched batch, labelled by replication mode.
pub fn record_batch_fetched(mode: &'static str, events: usize, duration: Duration) {
    counter!("relay_replication_batches_fetched_total", "mode" => mode).increment(1);
    if events > 0 {
        counter!("relay_replication_events_fetched_total").increment(events as u64);
    }
    histogram!("relay_replication_fetch_duration_seconds").record(duration.as_secs_f64());
    histogram!("relay_replication_batch_size").record(events as f64);
}

/// Record events dropped by the filter, by reason.
pub fn record_events_filtered(reason: &str, count: usize) {
    if count > 0 {
        counter!("relay_replication_events_filtered_total", "reason" => reason.to_string())
            .increment(count as u64);
    }
}

/// Record publish outcomes for one destination.
pub fn record_events_published(endpoint: &str, accepted: usize, duplicates: usize) {
    let endpoint = endpoint.to_string();
    counter!("relay_replication_events_published_total", "endpoint" => endpoint.clone())
        .increment(accepted as u64);
    if duplicates > 0 {
        counter!("relay_replication_events_duplicate_total", "endpoint" => endpoint)
            .increment(duplicates as u64);
    }
}

/// Record an event that could not be delivered.
pub fn record_publish_failure(endpoint: &str, transient: bool) {
    let class = if transient { "transient" } else { "permanent" };
    counter!("relay_replication_publish_failures_total", "endpoint" => endpoint.to_string(), "class" => class).increment(1);
}

/// Record a retry of a fetch or publish.
pub fn record_retry(operation: &str, error_kind: &str) {
    counter!(
        "relay_replication_retries_total",
        "operation" => operation.to_string(),
        "error_kind" => error_kind.to_string()
    )
    .increment(1);
}

// =============================================================================
// Cursor Metrics
// =============================================================================

/// Record a cursor commit.
pub fn record_cursor_commit(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("relay_replication_cursor_commits_total", "status" => status).increment(1);
}

/// Record cursor SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn record_cursor_retry(operation: &str) {
    counter!("relay_replication_cursor_retries_total", "operation" => operation.to_string()).increment(1);
}

// =============================================================================
// Scope / Cycle Metrics
// =============================================================================

/// Record a scope's final state for a cycle.
pub fn record_scope_outcome(state: &str, error_kind: Option<&str>) {
    counter!("relay_replication_scopes_total", "state" => state.to_string()).increment(1);
    if let Some(kind) = error_kind {
        counter!("relay_replication_scope_errors_total", "error_kind" => kind.to_string()).increment(1);
    }
}

/// Gauge for scopes currently being worked on.
pub fn set_active_scopes(count: usize) {
    gauge!("relay_replication_active_scopes").set(count as f64);
}

/// Record a completed cycle.
pub fn record_cycle(status: &str, duration: Duration) {
    counter!("relay_replication_cycles_total", "status" => status.to_string()).increment(1);
    histogram!("relay_replication_cycle_duration_seconds").record(duration.as_secs_f64());
}

/// Record a verification pass, labelled by replication mode.
pub fn record_verification(mode: &'static str, checked: usize, missing: usize) {
    counter!("relay_replication_verify_checked_total", "mode" => mode).increment(checked as u64);
    if missing > 0 {
        counter!("relay_replication_verify_missing_total", "mode" => mode).increment(missing as u64);
    }
}
