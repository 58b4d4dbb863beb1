//! Fuzz target for relay responses.
//!
//! Parses arbitrary JSON lines as events and builds a batch from whatever
//! parses. Verification and batch construction must never panic, and
//! batches must stay ordered.

#![no_main]

use libfuzzer_sys::fuzz_target;
use relay_replication_engine::{Batch, Cursor, Event};

fuzz_target!(|data: (&str, u8)| {
    let (text, limit) = data;
    let events: Vec<Event> = text.lines().filter_map(|line| Event::from_json(line).ok()).collect();
    for event in &events {
        let _ = event.verify();
    }

    let batch = Batch::after(&Cursor::beginning(), events, limit as usize);
    let positions: Vec<Cursor> = batch.iter().map(Event::position).collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]));
    assert!(batch.len() <= limit as usize);
});
