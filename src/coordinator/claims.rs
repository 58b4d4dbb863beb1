// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-scope exclusive claims.
//!
//! A scope's cursor must only ever be advanced by one worker at a time. A
//! claim is taken before the cursor is loaded and released when the returned
//! guard drops, whether the worker finished, failed or panicked.

use crate::error::{ReplicationError, Result};
use dashmap::DashMap;
use std::sync::Arc;

/// Set of scopes currently owned by a worker.
#[derive(Debug, Clone, Default)]
pub struct ScopeClaims {
    held: Arc<DashMap<String, ()>>,
}

impl ScopeClaims {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `scope_key`, failing with [`ReplicationError::ScopeBusy`] if held.
    pub fn claim(&self, scope_key: &str) -> Result<ScopeClaim> {
        match self.held.entry(scope_key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(ReplicationError::ScopeBusy(scope_key.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(());
                Ok(ScopeClaim {
                    held: Arc::clone(&self.held),
                    scope_key: scope_key.to_string(),
                })
            }
        }
    }

    /// Whether `scope_key` is currently claimed.
    pub fn is_claimed(&self, scope_key: &str) -> bool {
        self.held.contains_key(scope_key)
    }

    /// Number of claims held.
    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

/// Guard for a held claim.
#[derive(Debug)]
pub struct ScopeClaim {
    held: Arc<DashMap<String, ()>>,
    scope_key: String,
}

impl ScopeClaim {
    pub fn scope_key(&self) -> &str {
        &self.scope_key
    }
}

impl Drop for ScopeClaim {
    fn drop(&mut self) {
        self.held.remove(&self.scope_key);
    }
}
