//! Fuzz target for the cursor text form accepted by the `initial_cursor`
//! setting and printed in logs.
//!
//! Decoding must never panic, and anything that decodes must re-encode to
//! a form that decodes to the same cursor.

#![no_main]

use libfuzzer_sys::fuzz_target;
use relay_replication_engine::Cursor;

fuzz_target!(|data: &str| {
    if let Some(cursor) = Cursor::decode(data) {
        let encoded = cursor.encode();
        assert_eq!(Cursor::decode(&encoded), Some(cursor));
    }
});
