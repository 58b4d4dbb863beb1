// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Scope state machine and cycle report types.
//!
//! # State Transitions
//!
//! ```text
//!            load cursor
//! Pending ──────────────→ Fetching ──(empty batch)──→ Idle
//!    ↑                       │
//!    │                       ↓
//!    │                   Filtering
//!    │                       │
//!    │                       ↓
//!    │                   Publishing ──(not fully published)──→ Failed
//!    │                       │
//!    │                       ↓
//!    └────(next batch)── Committing ──(store error)──→ Failed
//! ```
//!
//! # State Descriptions
//!
//! - **Pending**: Scope assigned, cursor not yet loaded (or between batches).
//! - **Fetching**: Querying the source relay for the next batch.
//! - **Filtering**: Dropping events that should not be republished.
//! - **Publishing**: Delivering kept events to every destination.
//! - **Committing**: Persisting the batch's last position.
//! - **Idle**: Caught up. Nothing more to do this cycle.
//! - **Failed**: Terminal for this cycle. Retried next cycle from the committed cursor.

use crate::cursor::Cursor;
use crate::progress::ProgressSnapshot;
use std::time::Duration;

/// State of one scope's worker.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    Pending,
    Fetching,
    Filtering,
    Publishing,
    Committing,
    Idle,
    Failed,
}

impl ScopeState {
    /// Whether the worker is done for this cycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Idle | Self::Failed)
    }
}

impl std::fmt::Display for ScopeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScopeState::Pending => write!(f, "Pending"),
            ScopeState::Fetching => write!(f, "Fetching"),
            ScopeState::Filtering => write!(f, "Filtering"),
            ScopeState::Publishing => write!(f, "Publishing"),
            ScopeState::Committing => write!(f, "Committing"),
            ScopeState::Idle => write!(f, "Idle"),
            ScopeState::Failed => write!(f, "Failed"),
        }
    }
}

/// What happened to one scope during a cycle.
#[derive(Debug, Clone)]
pub struct ScopeOutcome {
    /// Cursor store key of the scope.
    pub scope_key: String,
    /// State the worker ended in. A stopped scope ends in `Pending`.
    pub final_state: ScopeState,
    /// Position the worker started from: the committed cursor, or the start
    /// position for a scope that never committed. `None` if the worker failed
    /// or was stopped before loading it.
    pub cursor_before: Option<Cursor>,
    /// Position the worker ended at. `None` when `cursor_before` is.
    pub cursor_after: Option<Cursor>,
    pub events_fetched: usize,
    pub events_published: usize,
    pub events_failed: usize,
    pub events_filtered: usize,
    pub retries: usize,
    /// Batches committed.
    pub batches: usize,
    /// Error that failed the scope.
    pub error: Option<String>,
    /// The worker exited early because of a stop request.
    pub stopped: bool,
}

impl ScopeOutcome {
    /// A fresh outcome for a scope at `cursor`.
    pub fn pending(scope_key: impl Into<String>, cursor: Cursor) -> Self {
        Self {
            scope_key: scope_key.into(),
            final_state: ScopeState::Pending,
            cursor_before: Some(cursor.clone()),
            cursor_after: Some(cursor),
            events_fetched: 0,
            events_published: 0,
            events_failed: 0,
            events_filtered: 0,
            retries: 0,
            batches: 0,
            error: None,
            stopped: false,
        }
    }

    /// A scope that never got to run because a stop was requested.
    pub fn not_started(scope_key: impl Into<String>) -> Self {
        Self {
            stopped: true,
            ..Self::unloaded(scope_key)
        }
    }

    /// A scope that failed before its cursor was loaded.
    pub fn failed(scope_key: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            final_state: ScopeState::Failed,
            error: Some(error.into()),
            ..Self::unloaded(scope_key)
        }
    }

    fn unloaded(scope_key: impl Into<String>) -> Self {
        Self {
            cursor_before: None,
            cursor_after: None,
            ..Self::pending(scope_key, Cursor::beginning())
        }
    }

    /// Scope ended in `Failed`.
    pub fn is_failed(&self) -> bool {
        self.final_state == ScopeState::Failed
    }

    /// Scope ended caught up.
    pub fn is_caught_up(&self) -> bool {
        self.final_state == ScopeState::Idle
    }
}

/// Overall result of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStatus {
    /// Every scope caught up.
    Succeeded,
    /// At least one scope failed.
    PartiallyFailed,
    /// A stop request cut the cycle short and nothing failed.
    Stopped,
}

impl CycleStatus {
    /// Process exit status.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Succeeded => 0,
            Self::PartiallyFailed => 1,
            Self::Stopped => 3,
        }
    }

    /// Label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::PartiallyFailed => "partially_failed",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one replication cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    /// One entry per distinct scope, in submission order.
    pub outcomes: Vec<ScopeOutcome>,
    /// Aggregate counters at cycle end.
    pub progress: ProgressSnapshot,
    pub elapsed: Duration,
}

impl CycleReport {
    /// Failure takes precedence over a stop.
    pub fn status(&self) -> CycleStatus {
        if self.outcomes.iter().any(ScopeOutcome::is_failed) {
            CycleStatus::PartiallyFailed
        } else if self.outcomes.iter().any(|o| o.stopped) {
            CycleStatus::Stopped
        } else {
            CycleStatus::Succeeded
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.status().exit_code()
    }

    /// Scopes that caught up.
    pub fn succeeded(&self) -> impl Iterator<Item = &ScopeOutcome> {
        self.outcomes.iter().filter(|o| o.is_caught_up())
    }

    /// Scopes that failed.
    pub fn failed(&self) -> impl Iterator<Item = &ScopeOutcome> {
        self.outcomes.iter().filter(|o| o.is_failed())
    }

    /// Outcome for a scope key.
    pub fn outcome(&self, scope_key: &str) -> Option<&ScopeOutcome> {
        self.outcomes.iter().find(|o| o.scope_key == scope_key)
    }

    /// Events published across all scopes.
    pub fn events_published(&self) -> usize {
        self.outcomes.iter().map(|o| o.events_published).sum()
    }
}
