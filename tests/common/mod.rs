// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared test utilities for scenario, chaos and property tests.
//!
//! This module provides:
//! - A fault-injecting relay client
//! - A recording cursor store with injectable commit failures
//! - Event builders and config helpers

#![allow(dead_code)]

pub mod fixtures;
pub mod flaky_relay;
pub mod recording_store;

pub use fixtures::*;
pub use flaky_relay::*;
pub use recording_store::*;
