#![no_main]

use libfuzzer_sys::fuzz_target;
use ralph_duration::{format_duration, parse_duration};

fuzz_target!(|data: &[u8]| {
    let Ok(raw) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(duration) = parse_duration(raw) {
        let rendered = format_duration(duration);
        let reparsed = parse_duration(&rendered).expect("our own rendering must reparse");
        assert_eq!(duration, reparsed);
    }
});
