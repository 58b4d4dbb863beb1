// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: simulate failures and verify graceful degradation.
//!
//! These tests verify the engine handles relay outages, corrupt cursor
//! databases and overlapping cycles without panics, deadlocks, or a cursor
//! moving past undelivered events.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use common::*;
use relay_replication_engine::config::ReplicationMode;
use relay_replication_engine::{
    CursorStore, CycleStatus, MemoryRelayNetwork, ReplicationEngine, ReplicationError,
    SqliteCursorStore,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::tempdir;

// =============================================================================
// Corrupt Cursor Database
// =============================================================================

async fn write_raw_row(path: &std::path::Path, scope: &str, created_at: i64, event_id: Option<&str>) {
    let url = format!("sqlite://{}?mode=rwc", path.display());
    let pool = sqlx::SqlitePool::connect(&url).await.unwrap();
    sqlx::query("INSERT OR REPLACE INTO cursors (scope, created_at, event_id, updated_at) VALUES (?, ?, ?, 0)")
        .bind(scope)
        .bind(created_at)
        .bind(event_id)
        .execute(&pool)
        .await
        .unwrap();
    pool.close().await;
}

/// Test: a negative timestamp on disk refuses to open instead of resuming
/// from a guessed position.
#[tokio::test]
async fn corrupt_timestamp_refuses_open() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("cursors.db");
    {
        let store = SqliteCursorStore::open(&db_path).await.unwrap();
        store.close().await.unwrap();
    }
    write_raw_row(&db_path, &key("alice"), -5, Some("abc")).await;

    let err = SqliteCursorStore::open(&db_path).await.err().unwrap();
    assert!(matches!(err, ReplicationError::CorruptCursor { ref scope, .. } if scope == &key("alice")));
    assert!(err.is_fatal());
    println!("Refused corrupt store: {}", err);
}

/// Test: an engine over a corrupt store never starts, and the run exits
/// with a code distinct from a partially failed cycle.
#[tokio::test]
async fn corrupt_store_aborts_run_with_fatal_exit_code() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("cursors.db");
    {
        let store = SqliteCursorStore::open(&db_path).await.unwrap();
        store.close().await.unwrap();
    }
    write_raw_row(&db_path, &key("alice"), 1_700_000_000, Some("")).await;

    let alice = pubkey("alice");
    let file = identity_file(&[alice.as_str()]);
    let mut config = config(&[DEST]);
    config.mode = ReplicationMode::PerIdentity {
        identity_file: file.path().to_string_lossy().to_string(),
    };
    config.cursor.sqlite_path = db_path.to_string_lossy().to_string();
    let relay = Arc::new(FlakyRelay::new(Arc::new(MemoryRelayNetwork::new())));

    let err = ReplicationEngine::with_sqlite(config, relay).await.err().unwrap();

    assert!(matches!(err, ReplicationError::CorruptCursor { .. }));
    assert_eq!(err.exit_code(), 4);
    assert_ne!(err.exit_code(), CycleStatus::PartiallyFailed.exit_code());
}

/// Test: an empty event id is not silently read as "timestamp only".
#[tokio::test]
async fn corrupt_event_id_refuses_open() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("cursors.db");
    {
        let store = SqliteCursorStore::open(&db_path).await.unwrap();
        store.close().await.unwrap();
    }
    write_raw_row(&db_path, "publishers:team", 1_700_000_000, Some("")).await;

    let err = SqliteCursorStore::open(&db_path).await.err().unwrap();
    assert!(matches!(err, ReplicationError::CorruptCursor { .. }));
}

/// Test: a valid row written by another tool is picked up on open.
#[tokio::test]
async fn externally_written_cursor_is_honored() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("cursors.db");
    {
        let store = SqliteCursorStore::open(&db_path).await.unwrap();
        store.close().await.unwrap();
    }
    write_raw_row(&db_path, &key("alice"), 102, None).await;

    let network = Arc::new(MemoryRelayNetwork::new());
    let events = seed(&network.relay(SOURCE), "alice", 100, 5);
    let store = Arc::new(SqliteCursorStore::open(&db_path).await.unwrap());
    let engine = ReplicationEngine::new(
        config(&[DEST]),
        Arc::new(FlakyRelay::new(Arc::clone(&network))),
        Arc::clone(&store),
    )
    .unwrap();

    let report = engine.run_cycle(identities(&["alice"])).await.unwrap();

    // A bare timestamp re-admits its own second.
    assert_eq!(report.events_published(), 3);
    assert!(network.relay(DEST).contains(&events[2].id));
    assert!(!network.relay(DEST).contains(&events[1].id));
    assert_eq!(store.get(&key("alice")).await, Some(events[4].position()));
    engine.close().await.unwrap();
}

// =============================================================================
// Relay Outages
// =============================================================================

/// Test: an unreachable destination fails every scope for this cycle only.
#[tokio::test]
async fn destination_outage_then_recovery() {
    let network = Arc::new(MemoryRelayNetwork::new());
    let relay = FlakyRelay::new(Arc::clone(&network));
    let store = Arc::new(RecordingCursorStore::in_memory());
    let engine = ReplicationEngine::new(config(&[DEST]), Arc::new(relay), Arc::clone(&store)).unwrap();
    for author in ["alice", "bob"] {
        seed(&network.relay(SOURCE), author, 10, 3);
    }

    network.set_reachable(DEST, false);
    let report = engine.run_cycle(identities(&["alice", "bob"])).await.unwrap();
    assert_eq!(report.status(), CycleStatus::PartiallyFailed);
    assert_eq!(report.failed().count(), 2);
    assert_eq!(store.commit_count(), 0, "nothing may be committed while the destination is down");

    network.set_reachable(DEST, true);
    let report = engine.run_cycle(identities(&["alice", "bob"])).await.unwrap();
    assert_eq!(report.status(), CycleStatus::Succeeded);
    assert_eq!(network.relay(DEST).len(), 6);
}

/// Test: with two destinations, one being down still blocks the commit.
#[tokio::test]
async fn partial_destination_outage_blocks_commit() {
    let network = Arc::new(MemoryRelayNetwork::new());
    let relay = FlakyRelay::new(Arc::clone(&network));
    let store = Arc::new(RecordingCursorStore::in_memory());
    let engine = ReplicationEngine::new(config(&[DEST, MIRROR]), Arc::new(relay), Arc::clone(&store)).unwrap();
    seed(&network.relay(SOURCE), "alice", 10, 3);

    network.set_reachable(MIRROR, false);
    let report = engine.run_cycle(identities(&["alice"])).await.unwrap();

    assert_eq!(report.status(), CycleStatus::PartiallyFailed);
    assert_eq!(network.relay(DEST).len(), 3, "healthy destination still receives the batch");
    assert_eq!(network.relay(MIRROR).len(), 0);
    assert_eq!(store.inner().get(&key("alice")), None);
}

/// Test: an unreachable source fails scopes without touching destinations.
#[tokio::test]
async fn source_outage_is_contained() {
    let network = Arc::new(MemoryRelayNetwork::new());
    let relay = FlakyRelay::new(Arc::clone(&network));
    let store = Arc::new(RecordingCursorStore::in_memory());
    let engine = ReplicationEngine::new(config(&[DEST]), Arc::new(relay.clone()), Arc::clone(&store)).unwrap();
    seed(&network.relay(SOURCE), "alice", 10, 3);

    network.set_reachable(SOURCE, false);
    let report = engine.run_cycle(identities(&["alice"])).await.unwrap();

    let outcome = report.outcome(&key("alice")).unwrap();
    assert!(outcome.is_failed());
    assert!(outcome.error.as_deref().unwrap().contains("Connection error"));
    assert_eq!(network.relay(DEST).publish_attempts(), 0);
    assert!(relay.publish_log().is_empty());
}

// =============================================================================
// Stop And Overlap
// =============================================================================

/// Test: a stop interrupts a long backoff promptly.
#[tokio::test]
async fn stop_interrupts_backoff() {
    let network = Arc::new(MemoryRelayNetwork::new());
    let relay = FlakyRelay::new(Arc::clone(&network));
    let mut config = config(&[DEST]);
    config.settings.backoff_base = "30s".to_string();
    config.settings.backoff_cap = "60s".to_string();
    let engine = ReplicationEngine::new(config, Arc::new(relay.clone()), Arc::new(RecordingCursorStore::in_memory())).unwrap();
    seed(&network.relay(SOURCE), "alice", 10, 3);
    relay.break_queries_for("alice");

    let handle = engine.stop_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.stop();
    });

    let start = Instant::now();
    let report = engine.run_cycle(identities(&["alice"])).await.unwrap();

    assert!(start.elapsed() < Duration::from_secs(5), "stop did not cut the backoff short");
    assert_eq!(report.status(), CycleStatus::Stopped);
    assert_eq!(report.exit_code(), 3);
}

/// Test: two overlapping cycles never replicate the same scope at once.
#[tokio::test]
async fn overlapping_cycles_claim_scope_once() {
    let network = Arc::new(MemoryRelayNetwork::new());
    let relay = FlakyRelay::new(Arc::clone(&network));
    let store = Arc::new(RecordingCursorStore::in_memory());
    let engine = ReplicationEngine::new(config(&[DEST]), Arc::new(relay.clone()), Arc::clone(&store)).unwrap();
    seed(&network.relay(SOURCE), "alice", 10, 4);
    relay.delay_queries(SOURCE, Duration::from_millis(100));

    let (first, second) = tokio::join!(
        engine.run_cycle(identities(&["alice"])),
        engine.run_cycle(identities(&["alice"]))
    );
    let outcomes = [first.unwrap(), second.unwrap()];

    let busy = outcomes
        .iter()
        .filter_map(|r| r.outcome(&key("alice")))
        .filter(|o| o.error.as_deref().is_some_and(|e| e.contains("already being replicated")))
        .count();
    assert_eq!(busy, 1);
    assert_eq!(network.relay(DEST).len(), 4);
    assert!(engine.claims().is_empty());
}

// =============================================================================
// Many Scopes Under Intermittent Faults
// =============================================================================

/// Test: repeated cycles over many scopes with transient faults converge,
/// and no cursor ever moves backwards.
#[tokio::test]
async fn many_scopes_converge_under_transient_faults() {
    let network = Arc::new(MemoryRelayNetwork::new());
    let relay = FlakyRelay::new(Arc::clone(&network));
    let store = Arc::new(RecordingCursorStore::in_memory());
    let mut config = config(&[DEST, MIRROR]);
    config.settings.concurrency = 4;
    config.settings.max_batch_size = 3;
    config.settings.retry_ceiling = 2;
    let engine = ReplicationEngine::new(config, Arc::new(relay.clone()), Arc::clone(&store)).unwrap();

    let names: Vec<String> = (0..20).map(|i| format!("author{:02}", i)).collect();
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    for (i, name) in refs.iter().enumerate() {
        seed(&network.relay(SOURCE), name, 1000, 5 + (i as u64 % 4));
        // Some authors fail more often than a single cycle can retry.
        relay.fail_publishes(name, i % 5);
    }

    let mut last = None;
    for _ in 0..10 {
        let report = engine.run_cycle(identities(&refs)).await.unwrap();
        let done = report.status() == CycleStatus::Succeeded;
        last = Some(report);
        if done {
            break;
        }
    }

    assert_eq!(last.unwrap().status(), CycleStatus::Succeeded);
    let expected: usize = (0..20).map(|i| 5 + (i % 4)).sum();
    assert_eq!(network.relay(DEST).len(), expected);
    assert_eq!(network.relay(MIRROR).len(), expected);
    for name in &refs {
        let history = store.history(&key(name));
        assert!(history.windows(2).all(|w| w[0] < w[1]), "{} regressed: {:?}", name, history);
    }
}
