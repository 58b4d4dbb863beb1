// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Identities and replication scopes.
//!
//! A scope is the unit of work that owns one cursor:
//!
//! - [`Scope::Identity`]: every event authored by one identity
//!   (per-identity mode, keyed `identity:<pubkey>`)
//! - [`Scope::Publishers`]: every event authored by a named set of
//!   publishers (timestamp mode, keyed `publishers:<name>`)

use crate::config::{PublisherSetConfig, ReplicationConfig, ReplicationMode};
use crate::error::{ReplicationError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::info;

/// An opaque public identifier events are associated with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Create an identity, trimming surrounding whitespace.
    ///
    /// Returns `None` for blank input.
    pub fn new(value: impl AsRef<str>) -> Option<Self> {
        let trimmed = value.as_ref().trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    /// The identifier string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The unit of replication work.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// All events authored by one identity.
    Identity(Identity),

    /// All events authored by any member of a named publisher set.
    Publishers {
        /// Stable set name, part of the cursor key.
        name: String,
        /// Set members.
        publishers: Vec<Identity>,
        /// Source relay override for this set.
        source: Option<String>,
    },
}

impl Scope {
    /// Per-identity scope.
    pub fn identity(identity: Identity) -> Self {
        Self::Identity(identity)
    }

    /// Publisher-set scope using the default source relay.
    pub fn publishers(name: impl Into<String>, publishers: Vec<Identity>) -> Self {
        Self::Publishers {
            name: name.into(),
            publishers,
            source: None,
        }
    }

    /// Cursor store key.
    pub fn key(&self) -> String {
        match self {
            Self::Identity(id) => format!("identity:{}", id),
            Self::Publishers { name, .. } => format!("publishers:{}", name),
        }
    }

    /// Replication mode label (`identity` or `publishers`) for metrics.
    pub fn mode(&self) -> &'static str {
        match self {
            Self::Identity(_) => "identity",
            Self::Publishers { .. } => "publishers",
        }
    }

    /// Authors whose events belong to this scope.
    pub fn authors(&self) -> Vec<String> {
        match self {
            Self::Identity(id) => vec![id.as_str().to_string()],
            Self::Publishers { publishers, .. } => {
                publishers.iter().map(|p| p.as_str().to_string()).collect()
            }
        }
    }

    /// Source relay for this scope, falling back to `default_source`.
    pub fn source<'a>(&'a self, default_source: &'a str) -> &'a str {
        match self {
            Self::Publishers {
                source: Some(source),
                ..
            } => source.as_str(),
            _ => default_source,
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

impl From<&PublisherSetConfig> for Scope {
    fn from(set: &PublisherSetConfig) -> Self {
        Self::Publishers {
            name: set.name.clone(),
            publishers: dedup(set.publishers.iter().filter_map(Identity::new)),
            source: set.source.clone(),
        }
    }
}

/// Parse an identity list: one per line, trimmed, blank lines and `#`
/// comments skipped, duplicates collapsed keeping the first occurrence.
pub fn parse_identities(text: &str) -> Vec<Identity> {
    dedup(
        text.lines()
            .map(str::trim)
            .filter(|line| !line.starts_with('#'))
            .filter_map(Identity::new),
    )
}

/// Load the identity list file.
///
/// A missing, unreadable or empty list is a configuration error: in
/// per-identity mode there is nothing meaningful to do without it.
pub fn load_identities(path: impl AsRef<Path>) -> Result<Vec<Identity>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| {
        ReplicationError::Config(format!("Cannot read identity list {}: {}", path.display(), e))
    })?;

    let identities = parse_identities(&text);
    if identities.is_empty() {
        return Err(ReplicationError::Config(format!(
            "Identity list {} is empty",
            path.display()
        )));
    }

    info!(path = %path.display(), count = identities.len(), "Loaded identity list");
    Ok(identities)
}

/// Derive the scopes a configuration asks for.
pub fn scopes_for(config: &ReplicationConfig) -> Result<Vec<Scope>> {
    match &config.mode {
        ReplicationMode::PerIdentity { identity_file } => Ok(load_identities(identity_file)?
            .into_iter()
            .map(Scope::Identity)
            .collect()),
        ReplicationMode::Publishers { sets } => Ok(sets.iter().map(Scope::from).collect()),
    }
}

fn dedup(identities: impl Iterator<Item = Identity>) -> Vec<Identity> {
    let mut seen = HashSet::new();
    identities.filter(|id| seen.insert(id.clone())).collect()
}
