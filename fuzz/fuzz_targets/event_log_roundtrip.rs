#![no_main]

use libfuzzer_sys::fuzz_target;
use ralph_events::EventBus;

// Each child `ralph daemon` process re-broadcasts newline-delimited JSON events
// from an untrusted subprocess; a malformed line must be rejected, never panic.
fuzz_target!(|data: &[u8]| {
    let Ok(line) = std::str::from_utf8(data) else {
        return;
    };
    let bus = EventBus::new();
    let _ = bus.ingest_raw(line, "fuzz");
});
