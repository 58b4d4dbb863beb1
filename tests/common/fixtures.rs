// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Event builders and engine configuration helpers.

use nostr::{EventBuilder, Keys, Kind, Tag, Timestamp};
use relay_replication_engine::{Event, Identity, MemoryRelay, ReplicationConfig, Scope};
use std::collections::HashMap;
use std::io::Write;
use std::sync::{Mutex, OnceLock};
use tempfile::NamedTempFile;

pub const SOURCE: &str = "wss://source.test";
pub const DEST: &str = "wss://dest.test";
pub const MIRROR: &str = "wss://mirror.test";

/// Signing keys for a named test author, stable for the whole test binary.
pub fn keys(author: &str) -> Keys {
    static KEYS: OnceLock<Mutex<HashMap<String, Keys>>> = OnceLock::new();
    let mut keys = KEYS.get_or_init(|| Mutex::new(HashMap::new())).lock().unwrap();
    keys.entry(author.to_string()).or_insert_with(Keys::generate).clone()
}

/// Hex public key of a named test author.
pub fn pubkey(author: &str) -> String {
    keys(author).public_key().to_hex()
}

/// Cursor key of a named author's identity scope.
pub fn key(author: &str) -> String {
    format!("identity:{}", pubkey(author))
}

/// A signed kind-1 event.
pub fn event(author: &str, created_at: u64, content: &str) -> Event {
    event_of_kind(author, created_at, 1, content)
}

pub fn event_of_kind(author: &str, created_at: u64, kind: u16, content: &str) -> Event {
    let signed = EventBuilder::new(Kind::from(kind), content)
        .tag(Tag::hashtag("tests"))
        .custom_created_at(Timestamp::from(created_at))
        .sign_with_keys(&keys(author))
        .unwrap();
    Event::from_nostr(&signed).unwrap()
}

/// Store `count` events by `author` on `relay`, one per second from `start`.
pub fn seed(relay: &MemoryRelay, author: &str, start: u64, count: u64) -> Vec<Event> {
    (0..count)
        .map(|i| {
            let e = event(author, start + i, &format!("{} note {}", author, i));
            relay.insert(e.clone());
            e
        })
        .collect()
}

pub fn identity(name: &str) -> Scope {
    Scope::identity(Identity::new(pubkey(name)).unwrap())
}

pub fn identities(names: &[&str]) -> Vec<Scope> {
    names.iter().map(|n| identity(n)).collect()
}

/// Fast test config replicating `SOURCE` to `destinations`.
pub fn config(destinations: &[&str]) -> ReplicationConfig {
    ReplicationConfig::for_testing(SOURCE, destinations)
}

/// Write an identity list file.
pub fn identity_file(lines: &[&str]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    for line in lines {
        writeln!(file, "{}", line).unwrap();
    }
    file.flush().unwrap();
    file
}
