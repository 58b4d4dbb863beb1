// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the replication engine.
//!
//! Configuration is passed to [`ReplicationEngine::new()`](crate::ReplicationEngine::new)
//! and can be constructed programmatically or deserialized from JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use relay_replication_engine::config::ReplicationConfig;
//!
//! let config = ReplicationConfig::for_testing(
//!     "wss://relay.source.example",
//!     &["wss://relay.destination.example"],
//! );
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfig
//! ├── source: String                # Relay to pull events from
//! ├── destinations: Vec<String>     # Relays to republish to
//! ├── mode: ReplicationMode         # per_identity | publishers
//! ├── settings: ReplicationSettings # Batch size, concurrency, retries, timeouts, start position
//! ├── filter: FilterConfig          # Kind / publisher allow-lists
//! └── cursor: CursorConfig          # SQLite cursor persistence
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "source": "wss://relay.mostr.pub",
//!   "destinations": ["wss://relay.nos.social"],
//!   "mode": { "type": "per_identity", "identity_file": "/etc/replicator/pubkeys.txt" },
//!   "settings": {
//!     "max_batch_size": 500,
//!     "concurrency": 100,
//!     "query_timeout": "15s",
//!     "initial_lookback": "14d"
//!   },
//!   "filter": { "kinds": [0, 1, 6] },
//!   "cursor": { "sqlite_path": "/var/lib/replicator/cursors.db" }
//! }
//! ```

use crate::cursor::Cursor;
use crate::error::{ReplicationError, Result};
use crate::resilience::{RateLimitConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: passed to ReplicationEngine::new()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `ReplicationEngine::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Relay events are pulled from.
    pub source: String,

    /// Relays every event is republished to. At least one is required.
    pub destinations: Vec<String>,

    /// How work is partitioned into scopes.
    pub mode: ReplicationMode,

    /// Batch, concurrency, retry and timeout settings.
    #[serde(default)]
    pub settings: ReplicationSettings,

    /// Inclusion filter applied before publishing.
    #[serde(default)]
    pub filter: FilterConfig,

    /// Cursor persistence settings.
    #[serde(default)]
    pub cursor: CursorConfig,
}

impl ReplicationConfig {
    /// Create a minimal config for testing.
    ///
    /// Uses an in-memory cursor database and fast retry/timeouts.
    pub fn for_testing(source: &str, destinations: &[&str]) -> Self {
        Self {
            source: source.to_string(),
            destinations: destinations.iter().map(|d| d.to_string()).collect(),
            mode: ReplicationMode::PerIdentity {
                identity_file: "identities.txt".to_string(),
            },
            settings: ReplicationSettings::for_testing(),
            filter: FilterConfig::default(),
            cursor: CursorConfig::in_memory(),
        }
    }

    /// Parse a config from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| ReplicationError::Config(format!("Invalid config JSON: {}", e)))
    }

    /// Load and parse a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ReplicationError::Config(format!("Cannot read config {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    /// Check the config for errors that must abort a run before it starts.
    pub fn validate(&self) -> Result<()> {
        validate_endpoint("source", &self.source)?;

        if self.destinations.is_empty() {
            return Err(ReplicationError::Config(
                "At least one destination relay is required".to_string(),
            ));
        }
        for destination in &self.destinations {
            validate_endpoint("destination", destination)?;
        }

        self.settings.validate()?;

        match &self.mode {
            ReplicationMode::PerIdentity { identity_file } => {
                if identity_file.trim().is_empty() {
                    return Err(ReplicationError::Config(
                        "per_identity mode requires identity_file".to_string(),
                    ));
                }
            }
            ReplicationMode::Publishers { sets } => {
                if sets.is_empty() {
                    return Err(ReplicationError::Config(
                        "publishers mode requires at least one publisher set".to_string(),
                    ));
                }
                let mut names = HashSet::new();
                for set in sets {
                    if set.name.trim().is_empty() {
                        return Err(ReplicationError::Config(
                            "Publisher set name must not be empty".to_string(),
                        ));
                    }
                    if !names.insert(set.name.as_str()) {
                        return Err(ReplicationError::Config(format!(
                            "Duplicate publisher set name: {}",
                            set.name
                        )));
                    }
                    if set.publishers.iter().all(|p| p.trim().is_empty()) {
                        return Err(ReplicationError::Config(format!(
                            "Publisher set {} has no publishers",
                            set.name
                        )));
                    }
                    if let Some(source) = &set.source {
                        validate_endpoint("publisher set source", source)?;
                    }
                }
            }
        }

        Ok(())
    }
}

/// Relay endpoints must be websocket URLs with a host.
fn validate_endpoint(role: &str, endpoint: &str) -> Result<()> {
    let rest = endpoint
        .strip_prefix("wss://")
        .or_else(|| endpoint.strip_prefix("ws://"))
        .ok_or_else(|| {
            ReplicationError::Config(format!(
                "Invalid {} endpoint {:?}: expected ws:// or wss://",
                role, endpoint
            ))
        })?;

    let host = rest.split('/').next().unwrap_or_default();
    if host.is_empty() || rest.chars().any(char::is_whitespace) {
        return Err(ReplicationError::Config(format!(
            "Invalid {} endpoint {:?}: missing or malformed host",
            role, endpoint
        )));
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicationMode: how scopes are derived
// ═══════════════════════════════════════════════════════════════════════════════

/// How work is partitioned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplicationMode {
    /// One scope (and one cursor) per identity read from a list file.
    PerIdentity {
        /// Path to the identity list (one public key per line).
        identity_file: String,
    },

    /// One scope per named publisher set, each with a single cursor.
    Publishers {
        /// The publisher sets to replicate.
        sets: Vec<PublisherSetConfig>,
    },
}

/// A named set of publishers replicated under one cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherSetConfig {
    /// Name used in the cursor key; must be unique and stable.
    pub name: String,

    /// Publisher public keys.
    pub publishers: Vec<String>,

    /// Optional source relay overriding the top-level `source`.
    #[serde(default)]
    pub source: Option<String>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicationSettings: batch, concurrency, retry, timeouts
// ═══════════════════════════════════════════════════════════════════════════════

/// Tunable parameters for the replication loop.
///
/// Duration fields are humantime strings ("500ms", "15s", "1m").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationSettings {
    /// Maximum events requested per query.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Maximum scopes processed concurrently.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Maximum attempts per fetch or publish (including the first).
    #[serde(default = "default_retry_ceiling")]
    pub retry_ceiling: usize,

    /// Delay before the first retry; doubles on each subsequent retry.
    #[serde(default = "default_backoff_base")]
    pub backoff_base: String,

    /// Ceiling for the retry delay.
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap: String,

    /// Bound on establishing a relay session.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,

    /// Bound on a single query round-trip.
    #[serde(default = "default_query_timeout")]
    pub query_timeout: String,

    /// Bound on a single publish acknowledgement.
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout: String,

    /// Capacity of the recently-published id set.
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,

    /// Optional publish rate limit, shared across all workers.
    #[serde(default)]
    pub publish_rate_limit: Option<RateLimitConfig>,

    /// Log a progress snapshot at this interval while a cycle runs.
    #[serde(default)]
    pub progress_log_interval: Option<String>,

    /// Scopes with nothing committed start this far back from now ("14d").
    #[serde(default)]
    pub initial_lookback: Option<String>,

    /// Scopes with nothing committed start at this cursor
    /// (`<created_at>` or `<created_at>:<event_id>`).
    #[serde(default)]
    pub initial_cursor: Option<String>,
}

fn default_max_batch_size() -> usize {
    500
}

fn default_concurrency() -> usize {
    8
}

fn default_retry_ceiling() -> usize {
    3
}

fn default_backoff_base() -> String {
    "1s".to_string()
}

fn default_backoff_cap() -> String {
    "30s".to_string()
}

fn default_connect_timeout() -> String {
    "10s".to_string()
}

fn default_query_timeout() -> String {
    "15s".to_string()
}

fn default_publish_timeout() -> String {
    "10s".to_string()
}

fn default_dedup_capacity() -> usize {
    100_000
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            concurrency: default_concurrency(),
            retry_ceiling: default_retry_ceiling(),
            backoff_base: default_backoff_base(),
            backoff_cap: default_backoff_cap(),
            connect_timeout: default_connect_timeout(),
            query_timeout: default_query_timeout(),
            publish_timeout: default_publish_timeout(),
            dedup_capacity: default_dedup_capacity(),
            publish_rate_limit: None,
            progress_log_interval: None,
            initial_lookback: None,
            initial_cursor: None,
        }
    }
}

impl ReplicationSettings {
    /// Fast settings for tests: millisecond backoff and short timeouts.
    pub fn for_testing() -> Self {
        Self {
            max_batch_size: 100,
            concurrency: 4,
            retry_ceiling: 3,
            backoff_base: "5ms".to_string(),
            backoff_cap: "50ms".to_string(),
            connect_timeout: "500ms".to_string(),
            query_timeout: "500ms".to_string(),
            publish_timeout: "500ms".to_string(),
            dedup_capacity: 10_000,
            publish_rate_limit: None,
            progress_log_interval: None,
            initial_lookback: None,
            initial_cursor: None,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(ReplicationError::Config(
                "max_batch_size must be greater than zero".to_string(),
            ));
        }
        if self.concurrency == 0 {
            return Err(ReplicationError::Config(
                "concurrency must be greater than zero".to_string(),
            ));
        }
        if self.retry_ceiling == 0 {
            return Err(ReplicationError::Config(
                "retry_ceiling must be at least 1".to_string(),
            ));
        }
        match (&self.initial_lookback, &self.initial_cursor) {
            (Some(_), Some(_)) => {
                return Err(ReplicationError::Config(
                    "initial_lookback and initial_cursor are mutually exclusive".to_string(),
                ));
            }
            (Some(lookback), None) => {
                humantime::parse_duration(lookback).map_err(|e| {
                    ReplicationError::Config(format!("Invalid initial_lookback {:?}: {}", lookback, e))
                })?;
            }
            (None, Some(cursor)) => {
                if Cursor::decode(cursor).is_none() {
                    return Err(ReplicationError::Config(format!(
                        "Invalid initial_cursor {:?}: expected <created_at> or <created_at>:<event_id>",
                        cursor
                    )));
                }
            }
            (None, None) => {}
        }
        Ok(())
    }

    /// Where scopes with no committed cursor start.
    pub fn start_position(&self) -> StartPosition {
        if let Some(lookback) = self.initial_lookback.as_deref() {
            if let Ok(window) = humantime::parse_duration(lookback) {
                return StartPosition::Lookback(window);
            }
        }
        match self.initial_cursor.as_deref().and_then(Cursor::decode) {
            Some(cursor) => StartPosition::At(cursor),
            None => StartPosition::Beginning,
        }
    }

    /// Parse the backoff base to a Duration.
    pub fn backoff_base_duration(&self) -> Duration {
        parse_or(&self.backoff_base, Duration::from_secs(1))
    }

    /// Parse the backoff cap to a Duration.
    pub fn backoff_cap_duration(&self) -> Duration {
        parse_or(&self.backoff_cap, Duration::from_secs(30))
    }

    /// Parse the connect timeout to a Duration.
    pub fn connect_timeout_duration(&self) -> Duration {
        parse_or(&self.connect_timeout, Duration::from_secs(10))
    }

    /// Parse the query timeout to a Duration.
    pub fn query_timeout_duration(&self) -> Duration {
        parse_or(&self.query_timeout, Duration::from_secs(15))
    }

    /// Parse the publish timeout to a Duration.
    pub fn publish_timeout_duration(&self) -> Duration {
        parse_or(&self.publish_timeout, Duration::from_secs(10))
    }

    /// Progress log interval, if configured and parseable.
    pub fn progress_log_interval_duration(&self) -> Option<Duration> {
        self.progress_log_interval
            .as_deref()
            .and_then(|s| humantime::parse_duration(s).ok())
            .filter(|d| !d.is_zero())
    }

    /// Retry policy shared by the fetcher and publisher.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry_ceiling,
            initial_delay: self.backoff_base_duration(),
            max_delay: self.backoff_cap_duration(),
            backoff_factor: 2.0,
        }
    }
}

fn parse_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

/// Starting point for a scope that has never committed a cursor.
///
/// Never consulted once a scope has a committed cursor.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StartPosition {
    /// The oldest event the source holds.
    #[default]
    Beginning,
    /// A fixed position.
    At(Cursor),
    /// A window ending when the scope's cursor is loaded.
    Lookback(Duration),
}

impl StartPosition {
    /// The cursor to start from, given the current unix time in seconds.
    pub fn resolve(&self, now: u64) -> Cursor {
        match self {
            Self::Beginning => Cursor::beginning(),
            Self::At(cursor) => cursor.clone(),
            Self::Lookback(window) => Cursor::at_timestamp(now.saturating_sub(window.as_secs())),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// FilterConfig: inclusion criteria
// ═══════════════════════════════════════════════════════════════════════════════

/// Inclusion criteria applied to every fetched batch.
///
/// Empty lists mean "allow everything".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Event kinds to replicate. Also sent to the source relay as a query constraint.
    #[serde(default)]
    pub kinds: Vec<u16>,

    /// Publisher allow-list.
    #[serde(default)]
    pub publishers: Vec<String>,

    /// Drop events whose id or signature does not verify.
    #[serde(default = "default_true")]
    pub verify_events: bool,
}

fn default_true() -> bool {
    true
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            kinds: Vec::new(),
            publishers: Vec::new(),
            verify_events: true,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CursorConfig: cursor persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// Cursor persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorConfig {
    /// Path to SQLite database for cursor storage.
    pub sqlite_path: String,
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "relay_cursors.db".to_string(),
        }
    }
}

impl CursorConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
