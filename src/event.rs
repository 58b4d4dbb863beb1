// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Relay events and ordered batches.
//!
//! Events are carried through the engine unmodified: the engine reads
//! `created_at` and `id` to order them, and `kind` / `pubkey` to filter them,
//! but never rewrites any field.
//!
//! Id and signature checks are delegated to the `nostr` crate (NIP-01:
//! SHA-256 id over the canonical array, Schnorr signature over the id).
//!
//! # Ordering
//!
//! Batches are ordered by `(created_at, id)`. Ties on the timestamp are broken
//! by the id so that every pair of distinct events has a fixed order, which is
//! what lets a [`Cursor`] name an exact position.

use crate::cursor::Cursor;
use crate::error::{ReplicationError, Result};
use nostr::JsonUtil;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A signed relay event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Hex SHA-256 of the canonical serialization.
    pub id: String,
    /// Author public key (hex).
    pub pubkey: String,
    /// Unix timestamp in seconds.
    pub created_at: u64,
    /// Event kind.
    pub kind: u16,
    /// Tags, passed through untouched.
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    /// Opaque payload.
    #[serde(default)]
    pub content: String,
    /// Author signature over `id`.
    #[serde(default)]
    pub sig: String,
}

/// Why an event failed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDefect {
    /// Fields that do not form a NIP-01 event (bad key, id or sig encoding).
    Malformed,
    /// `id` does not match the event contents.
    InvalidId,
    /// `sig` is not the author's signature over `id`.
    InvalidSignature,
}

impl EventDefect {
    /// Short label for metrics and rejection reasons.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::InvalidId => "invalid_id",
            Self::InvalidSignature => "invalid_signature",
        }
    }
}

impl std::fmt::Display for EventDefect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Event {
    /// Parse an event from its JSON form.
    ///
    /// Only the shape is checked; use [`verify`](Self::verify) for the id and
    /// signature.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| ReplicationError::Internal(format!("Malformed event JSON: {}", e)))
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> String {
        // Plain strings and integers only; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Convert from the `nostr` crate's event type.
    pub fn from_nostr(event: &nostr::Event) -> Result<Self> {
        Self::from_json(&event.as_json())
    }

    /// Convert to the `nostr` crate's event type.
    pub fn to_nostr(&self) -> Result<nostr::Event> {
        nostr::Event::from_json(self.to_json())
            .map_err(|e| ReplicationError::Internal(format!("Not a NIP-01 event: {}", e)))
    }

    /// Position of this event in the replication order.
    pub fn position(&self) -> Cursor {
        Cursor::at(self.created_at, self.id.clone())
    }

    /// Check the id and then the signature.
    pub fn verify(&self) -> std::result::Result<(), EventDefect> {
        let event = self.to_nostr().map_err(|_| EventDefect::Malformed)?;
        if !event.verify_id() {
            return Err(EventDefect::InvalidId);
        }
        if !event.verify_signature() {
            return Err(EventDefect::InvalidSignature);
        }
        Ok(())
    }
}

/// An ordered, bounded sequence of events fetched in one round-trip.
///
/// Every event in the batch sorts strictly after the cursor it was fetched
/// from, and events are unique by id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    events: Vec<Event>,
}

impl Batch {
    /// Build a batch from an unordered relay response.
    ///
    /// Sorts by `(created_at, id)`, drops anything at or before `after`,
    /// drops repeated ids and truncates to `limit`.
    pub fn after(after: &Cursor, mut events: Vec<Event>, limit: usize) -> Self {
        events.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut seen = HashSet::with_capacity(events.len());
        let events = events
            .into_iter()
            .filter(|e| after.precedes(e))
            .filter(|e| seen.insert(e.id.clone()))
            .take(limit)
            .collect();

        Self { events }
    }

    /// An empty batch ("caught up").
    pub fn empty() -> Self {
        Self::default()
    }

    /// Events in replication order.
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Number of events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// True when the scope is caught up.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// The cursor to commit once this batch is fully published.
    pub fn last_position(&self) -> Option<Cursor> {
        self.events.last().map(Event::position)
    }

    /// Iterate events in order.
    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Event;
    use crate::scope::Identity;
    use nostr::{EventBuilder, Keys, Kind, Timestamp};
    use std::collections::HashMap;
    use std::sync::{Mutex, OnceLock};

    /// Signing keys for a named test author, stable for the whole test run.
    pub fn keys(author: &str) -> Keys {
        static KEYS: OnceLock<Mutex<HashMap<String, Keys>>> = OnceLock::new();
        let mut keys = KEYS
            .get_or_init(|| Mutex::new(HashMap::new()))
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        keys.entry(author.to_string()).or_insert_with(Keys::generate).clone()
    }

    /// Hex public key of a named test author.
    pub fn pubkey(author: &str) -> String {
        keys(author).public_key().to_hex()
    }

    pub fn identity(author: &str) -> Identity {
        Identity::new(pubkey(author)).unwrap()
    }

    /// Build an event signed by `author`.
    pub fn event(author: &str, created_at: u64, kind: u16, content: &str) -> Event {
        let signed = EventBuilder::new(Kind::from(kind), content)
            .custom_created_at(Timestamp::from(created_at))
            .sign_with_keys(&keys(author))
            .unwrap();
        Event::from_nostr(&signed).unwrap()
    }

    /// Build an event with an arbitrary id (ordering tests).
    pub fn with_id(id: &str, created_at: u64) -> Event {
        Event {
            id: id.to_string(),
            pubkey: "a".repeat(64),
            created_at,
            kind: 1,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        }
    }
}
