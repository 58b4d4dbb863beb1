// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cooperative stop signal.
//!
//! A [`StopHandle`] is held by whoever drives the engine (signal handler,
//! daemon supervisor); every worker holds a cloned [`StopSignal`]. Workers
//! check the signal between batches and while backing off, so a stop lets
//! the in-flight batch finish or abandons it before its cursor commit.

use crate::error::{ReplicationError, Result};
use std::time::Duration;
use tokio::sync::watch;

/// Create a connected stop handle / signal pair.
pub fn stop_channel() -> (StopHandle, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (StopHandle { tx }, StopSignal { rx })
}

/// Sender side: requests a cooperative stop.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

impl StopHandle {
    /// Ask all workers to stop. Idempotent.
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    /// Clear a previous stop request so the next cycle can run.
    pub fn reset(&self) {
        self.tx.send_replace(false);
    }

    /// Whether a stop has been requested.
    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    /// A new receiver for this handle.
    pub fn signal(&self) -> StopSignal {
        StopSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiver side: observed by workers.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    /// A signal that never fires (standalone use and tests).
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    /// Whether a stop has been requested.
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once a stop is requested.
    pub async fn stopped(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Sender gone: nobody can ask us to stop any more.
                std::future::pending::<()>().await;
            }
        }
    }

    /// Sleep for `delay` unless a stop arrives first.
    ///
    /// Returns [`ReplicationError::Shutdown`] if interrupted.
    pub async fn sleep(&self, delay: Duration) -> Result<()> {
        if self.is_stopped() {
            return Err(ReplicationError::Shutdown);
        }
        let mut signal = self.clone();
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = signal.stopped() => Err(ReplicationError::Shutdown),
        }
    }
}
