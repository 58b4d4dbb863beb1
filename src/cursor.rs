// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cursor persistence for replication positions.
//!
//! Every scope (one identity, or one publisher set) has a cursor naming the
//! last event position that was fully replicated. Cursors survive process
//! restarts so the next cycle resumes where the last one stopped.
//!
//! ## Cursor Semantics
//!
//! The cursor stores the position of the **last event of the last fully
//! published batch**. On restart, we resume strictly after it.
//!
//! ```text
//! fetch batch → publish every event → commit cursor = last event
//!                                   (crash here = batch replayed, duplicates tolerated)
//! ```
//!
//! Commits are **monotonic**: committing a position older than the stored
//! one is a no-op, so a late or repeated commit can never move a scope
//! backwards.
//!
//! ## Why write-through?
//!
//! Each commit is one SQLite statement in WAL mode with `synchronous=FULL`.
//! SQLite makes the statement atomic, so a crash mid-commit leaves either
//! the old row or the new row, never a torn value.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. Writes are retried with exponential backoff (max 5 attempts).

use crate::error::{ReplicationError, Result};
use crate::event::Event;
use crate::BoxFuture;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

// ═══════════════════════════════════════════════════════════════════════════════
// Cursor
// ═══════════════════════════════════════════════════════════════════════════════

/// A resumable replication position.
///
/// Ordered by `(created_at, event_id)`; a cursor without an event id sorts
/// before every event at the same timestamp, so a bare timestamp cursor
/// re-admits that whole second.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Cursor {
    /// Timestamp of the last replicated event.
    pub created_at: u64,
    /// Id of the last replicated event, if known.
    pub event_id: Option<String>,
}

impl Cursor {
    /// The "beginning of time" cursor used for scopes never seen before.
    pub fn beginning() -> Self {
        Self::default()
    }

    /// Position of a specific event.
    pub fn at(created_at: u64, event_id: impl Into<String>) -> Self {
        Self {
            created_at,
            event_id: Some(event_id.into()),
        }
    }

    /// A timestamp-only position.
    pub fn at_timestamp(created_at: u64) -> Self {
        Self {
            created_at,
            event_id: None,
        }
    }

    /// True for the default cursor.
    pub fn is_beginning(&self) -> bool {
        self.created_at == 0 && self.event_id.is_none()
    }

    /// Whether `event` sorts strictly after this cursor.
    pub fn precedes(&self, event: &Event) -> bool {
        (event.created_at, Some(event.id.as_str())) > (self.created_at, self.event_id.as_deref())
    }

    /// Text form used in logs and the `initial_cursor` setting:
    /// `"<created_at>"` or `"<created_at>:<event_id>"`.
    pub fn encode(&self) -> String {
        match &self.event_id {
            Some(id) => format!("{}:{}", self.created_at, id),
            None => self.created_at.to_string(),
        }
    }

    /// Parse the text form produced by [`encode`](Self::encode).
    pub fn decode(value: &str) -> Option<Self> {
        let (ts, id) = match value.split_once(':') {
            Some((ts, id)) => (ts, Some(id)),
            None => (value, None),
        };
        let created_at = ts.parse::<u64>().ok()?;
        match id {
            Some("") => None,
            Some(id) => Some(Self::at(created_at, id)),
            None => Some(Self::at_timestamp(created_at)),
        }
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CursorStore trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Durable scope → cursor mapping.
///
/// Implementations must make `commit` atomic with respect to a crash and
/// monotonic per scope. Commits for different scopes must not interfere.
pub trait CursorStore: Send + Sync + 'static {
    /// Load the committed cursor, or [`Cursor::beginning()`] if none exists.
    fn load<'a>(&'a self, scope: &'a str) -> BoxFuture<'a, Cursor>;

    /// Durably record a new position for `scope`.
    ///
    /// A position older than the stored one is ignored.
    fn commit<'a>(&'a self, scope: &'a str, cursor: &'a Cursor) -> BoxFuture<'a, ()>;

    /// Flush and release resources. Called once at the end of a run.
    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SQLite store
// ═══════════════════════════════════════════════════════════════════════════════

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts, "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::record_cursor_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts, "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

fn to_sql_timestamp(scope: &str, created_at: u64) -> Result<i64> {
    i64::try_from(created_at).map_err(|_| ReplicationError::CorruptCursor {
        scope: scope.to_string(),
        value: created_at.to_string(),
    })
}

/// Persistent cursor storage backed by SQLite.
///
/// Reads are served from a cache loaded at open time and refreshed after
/// each durable write; this process is the only writer.
pub struct SqliteCursorStore {
    /// SQLite connection pool
    pool: SqlitePool,
    /// Committed cursors by scope key
    cache: Arc<RwLock<HashMap<String, Cursor>>>,
    /// Path to database file
    path: String,
}

impl SqliteCursorStore {
    /// Open (or create) the cursor database at `path`.
    ///
    /// A missing database is created empty. An existing database whose rows
    /// cannot be decoded is an error: resuming from a guessed position could
    /// skip events.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Opening cursor store");

        let in_memory = path_str == ":memory:";
        let pool = if in_memory {
            let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
            // One long-lived connection: each in-memory connection is its own database.
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            let options =
                SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
                    .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
                    .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                    .synchronous(sqlx::sqlite::SqliteSynchronous::Full)
                    .busy_timeout(Duration::from_secs(5))
                    .create_if_missing(true);
            SqlitePoolOptions::new()
                .max_connections(2)
                .connect_with(options)
                .await?
        };

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cursors (
                scope TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL,
                event_id TEXT,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows: Vec<(String, i64, Option<String>)> =
            sqlx::query_as("SELECT scope, created_at, event_id FROM cursors")
                .fetch_all(&pool)
                .await?;

        let mut cache = HashMap::with_capacity(rows.len());
        for (scope, created_at, event_id) in rows {
            let created_at = u64::try_from(created_at).map_err(|_| {
                ReplicationError::CorruptCursor {
                    scope: scope.clone(),
                    value: created_at.to_string(),
                }
            })?;
            if matches!(event_id.as_deref(), Some("")) {
                return Err(ReplicationError::CorruptCursor {
                    scope,
                    value: format!("{}:", created_at),
                });
            }
            let cursor = Cursor {
                created_at,
                event_id,
            };
            debug!(scope = %scope, cursor = %cursor, "Loaded cursor from disk");
            cache.insert(scope, cursor);
        }

        if !cache.is_empty() {
            info!(count = cache.len(), "Restored cursors from previous run");
        }

        Ok(Self {
            pool,
            cache: Arc::new(RwLock::new(cache)),
            path: path_str,
        })
    }

    /// Get the committed cursor for a scope, if any.
    pub async fn get(&self, scope: &str) -> Option<Cursor> {
        self.cache.read().await.get(scope).cloned()
    }

    /// Write a cursor through to disk (monotonic).
    pub async fn set(&self, scope: &str, cursor: &Cursor) -> Result<()> {
        let created_at = to_sql_timestamp(scope, cursor.created_at)?;
        let now = chrono::Utc::now().timestamp_millis();
        let pool = &self.pool;

        let result = execute_with_retry("cursor_commit", || async {
            sqlx::query(
                r#"
                INSERT INTO cursors (scope, created_at, event_id, updated_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(scope) DO UPDATE SET
                    created_at = excluded.created_at,
                    event_id = excluded.event_id,
                    updated_at = excluded.updated_at
                WHERE excluded.created_at > cursors.created_at
                   OR (excluded.created_at = cursors.created_at
                       AND COALESCE(excluded.event_id, '') >= COALESCE(cursors.event_id, ''))
                "#,
            )
            .bind(scope)
            .bind(created_at)
            .bind(cursor.event_id.as_deref())
            .bind(now)
            .execute(pool)
            .await
        })
        .await;

        if let Err(e) = result {
            crate::metrics::record_cursor_commit(false);
            return Err(e.into());
        }

        {
            let mut cache = self.cache.write().await;
            match cache.get_mut(scope) {
                Some(existing) if *existing >= *cursor => {
                    debug!(scope = %scope, kept = %existing, offered = %cursor, "Ignored stale cursor commit");
                }
                Some(existing) => *existing = cursor.clone(),
                None => {
                    cache.insert(scope.to_string(), cursor.clone());
                }
            }
        }

        crate::metrics::record_cursor_commit(true);
        debug!(scope = %scope, cursor = %cursor, "Cursor committed");
        Ok(())
    }

    /// Delete cursor for a scope (e.g., identity removed from the list).
    pub async fn delete(&self, scope: &str) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("cursor_delete", || async {
            sqlx::query("DELETE FROM cursors WHERE scope = ?")
                .bind(scope)
                .execute(pool)
                .await
        })
        .await?;

        self.cache.write().await.remove(scope);
        info!(scope = %scope, "Deleted cursor");
        Ok(())
    }

    /// Get all cursors (for metrics/debugging).
    pub async fn get_all(&self) -> HashMap<String, Cursor> {
        self.cache.read().await.clone()
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("cursor_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await?;

        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint WAL and close the connection pool.
    pub async fn shutdown(&self) {
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Cursor store closed");
    }
}

impl CursorStore for SqliteCursorStore {
    fn load<'a>(&'a self, scope: &'a str) -> BoxFuture<'a, Cursor> {
        Box::pin(async move { Ok(self.get(scope).await.unwrap_or_default()) })
    }

    fn commit<'a>(&'a self, scope: &'a str, cursor: &'a Cursor) -> BoxFuture<'a, ()> {
        Box::pin(self.set(scope, cursor))
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.shutdown().await;
            Ok(())
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-memory store
// ═══════════════════════════════════════════════════════════════════════════════

/// Non-durable cursor store for standalone runs and tests.
#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    cursors: DashMap<String, Cursor>,
}

impl MemoryCursorStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed cursor for a scope, if any.
    pub fn get(&self, scope: &str) -> Option<Cursor> {
        self.cursors.get(scope).map(|c| c.clone())
    }

    /// All committed cursors.
    pub fn get_all(&self) -> HashMap<String, Cursor> {
        self.cursors
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

impl CursorStore for MemoryCursorStore {
    fn load<'a>(&'a self, scope: &'a str) -> BoxFuture<'a, Cursor> {
        Box::pin(async move { Ok(self.get(scope).unwrap_or_default()) })
    }

    fn commit<'a>(&'a self, scope: &'a str, cursor: &'a Cursor) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.cursors
                .entry(scope.to_string())
                .and_modify(|existing| {
                    if *cursor > *existing {
                        *existing = cursor.clone();
                    }
                })
                .or_insert_with(|| cursor.clone());
            Ok(())
        })
    }
}
