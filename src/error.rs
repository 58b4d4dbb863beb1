// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication engine.
//!
//! Errors are categorized by where they come from (relay I/O, cursor
//! persistence, configuration) and carry enough context to tell which
//! endpoint, scope or event was involved.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Config` | No | Configuration invalid, aborts the whole run |
//! | `Connection` | Yes | Relay unreachable, session dropped |
//! | `Timeout` | Yes | Query/publish/connect exceeded its bound |
//! | `Publish` | If transient | Destination rejected an event |
//! | `CursorStore` | No | Local SQLite errors (needs operator attention) |
//! | `CursorCommit` | No | Non-SQL cursor store failure for one scope |
//! | `CorruptCursor` | No | Persisted cursor cannot be decoded |
//! | `ScopeBusy` | No | Another worker already holds the scope |
//! | `Shutdown` | No | Stop signal observed |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`ReplicationError::is_retryable()`] to decide whether an operation
//! should be retried with backoff. Configuration errors and an unusable cursor
//! store are fatal for a whole run ([`ReplicationError::is_fatal()`]);
//! everything else fails at most one scope for one cycle.
//!
//! # Exit Codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Every scope caught up |
//! | 1 | At least one scope failed |
//! | 2 | Configuration error, nothing ran |
//! | 3 | Stopped before every scope caught up |
//! | 4 | Cursor store unusable (corrupt or unopenable), nothing ran |

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Invalid or missing configuration (bad endpoint, empty identity list).
    ///
    /// Not retryable. Aborts the run before any scope starts.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Relay connection failure.
    ///
    /// Occurs when a relay is unreachable or the session drops mid-operation.
    /// Retryable with exponential backoff after reconnecting.
    #[error("Connection error ({endpoint}): {message}")]
    Connection { endpoint: String, message: String },

    /// A bounded wait expired.
    ///
    /// Kept distinct from `Connection` so retry policy and logs can tell a
    /// slow relay from a dead one.
    #[error("Timeout ({operation} on {endpoint}) after {timeout_ms}ms")]
    Timeout {
        operation: String,
        endpoint: String,
        timeout_ms: u64,
    },

    /// Destination relay refused an event.
    ///
    /// `transient` rejections (rate limits, overload) are retried; permanent
    /// ones (malformed or blocked events) are recorded and skipped.
    #[error("Publish rejected for event {event_id} by {endpoint}: {reason}")]
    Publish {
        event_id: String,
        endpoint: String,
        reason: String,
        transient: bool,
    },

    /// SQLite error during cursor persistence.
    ///
    /// Not retryable at this level (busy errors are already retried inside
    /// the store). The previous cursor stands.
    #[error("Cursor store error: {0}")]
    CursorStore(#[from] sqlx::Error),

    /// Cursor commit failed in a non-SQL store.
    #[error("Cursor commit failed for {scope}: {message}")]
    CursorCommit { scope: String, message: String },

    /// A persisted cursor could not be decoded.
    ///
    /// Raised when opening the store; an unreadable store is fatal for the
    /// run because resuming from the wrong position would skip or repeat work.
    #[error("Corrupt cursor for {scope}: {value:?}")]
    CorruptCursor { scope: String, value: String },

    /// The scope is claimed by another worker.
    #[error("Scope {0} is already being replicated")]
    ScopeBusy(String),

    /// Stop signal received; the in-flight batch was abandoned uncommitted.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a connection error for an endpoint.
    pub fn connection(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(
        operation: impl Into<String>,
        endpoint: impl Into<String>,
        after: std::time::Duration,
    ) -> Self {
        Self::Timeout {
            operation: operation.into(),
            endpoint: endpoint.into(),
            timeout_ms: after.as_millis() as u64,
        }
    }

    /// Create a publish rejection.
    pub fn publish_rejected(
        event_id: impl Into<String>,
        endpoint: impl Into<String>,
        reason: impl Into<String>,
        transient: bool,
    ) -> Self {
        Self::Publish {
            event_id: event_id.into(),
            endpoint: endpoint.into(),
            reason: reason.into(),
            transient,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Timeout { .. } => true,
            Self::Publish { transient, .. } => *transient,
            Self::CursorStore(_) => false,
            Self::CursorCommit { .. } => false,
            Self::CorruptCursor { .. } => false,
            Self::Config(_) => false,
            Self::ScopeBusy(_) => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Check if this error must abort the whole run.
    ///
    /// A `CursorStore` error inside a cycle fails one scope and is reported
    /// in its outcome; one that escapes (opening the store) ends the run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::CorruptCursor { .. } | Self::CursorStore(_)
        )
    }

    /// Short label for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Connection { .. } => "connection",
            Self::Timeout { .. } => "timeout",
            Self::Publish { .. } => "publish",
            Self::CursorStore(_) | Self::CursorCommit { .. } => "cursor_store",
            Self::CorruptCursor { .. } => "corrupt_cursor",
            Self::ScopeBusy(_) => "scope_busy",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }

    /// Process exit status for a run that ended with this error.
    ///
    /// See the module docs for the full table.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 2,
            Self::CorruptCursor { .. } | Self::CursorStore(_) => 4,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::CycleStatus;
    use std::time::Duration;

    #[test]
    fn test_is_retryable_connection() {
        let err = ReplicationError::connection("wss://relay.example", "connection refused");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("wss://relay.example"));
    }

    #[test]
    fn test_is_retryable_timeout() {
        let err = ReplicationError::timeout("query", "wss://a", Duration::from_secs(15));
        assert!(err.is_retryable());
        let msg = err.to_string();
        assert!(msg.contains("query"));
        assert!(msg.contains("15000ms"));
    }

    #[test]
    fn test_publish_retryable_only_when_transient() {
        let transient = ReplicationError::publish_rejected("abc", "wss://dst", "rate-limited", true);
        let permanent = ReplicationError::publish_rejected("abc", "wss://dst", "invalid: bad sig", false);
        assert!(transient.is_retryable());
        assert!(!permanent.is_retryable());
        assert!(permanent.to_string().contains("bad sig"));
    }

    #[test]
    fn test_not_retryable_config() {
        let err = ReplicationError::Config("identity list is empty".to_string());
        assert!(!err.is_retryable());
        assert!(err.is_fatal());
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_unusable_cursor_store_is_fatal() {
        let corrupt = ReplicationError::CorruptCursor {
            scope: "identity:abc".into(),
            value: "created_at=-5".into(),
        };
        assert!(corrupt.is_fatal());
        assert_eq!(corrupt.exit_code(), 4);

        let unopenable = ReplicationError::CursorStore(sqlx::Error::PoolTimedOut);
        assert!(unopenable.is_fatal());
        assert_eq!(unopenable.exit_code(), 4);
        assert_ne!(unopenable.exit_code(), CycleStatus::PartiallyFailed.exit_code());
    }

    #[test]
    fn test_scope_level_errors_are_not_fatal() {
        let errors = vec![
            ReplicationError::connection("wss://a", "x"),
            ReplicationError::Shutdown,
            ReplicationError::ScopeBusy("identity:abc".into()),
            ReplicationError::CursorCommit {
                scope: "identity:abc".into(),
                message: "disk full".into(),
            },
            ReplicationError::Internal("boom".into()),
        ];
        for err in errors {
            assert!(!err.is_fatal(), "{err} should not be fatal");
            assert_eq!(err.exit_code(), 1);
        }
    }

    #[test]
    fn test_not_retryable_cursor_errors() {
        let err = ReplicationError::CursorStore(sqlx::Error::RowNotFound);
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), "cursor_store");

        let corrupt = ReplicationError::CorruptCursor {
            scope: "identity:abc".into(),
            value: "garbage".into(),
        };
        assert!(!corrupt.is_retryable());
        assert!(corrupt.to_string().contains("garbage"));
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(ReplicationError::Shutdown.kind(), "shutdown");
        assert_eq!(ReplicationError::connection("a", "b").kind(), "connection");
        assert_eq!(
            ReplicationError::timeout("publish", "a", Duration::from_millis(5)).kind(),
            "timeout"
        );
    }
}
