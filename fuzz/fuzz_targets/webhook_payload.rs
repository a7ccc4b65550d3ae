#![no_main]

use libfuzzer_sys::fuzz_target;
use ralph_webhook::EscalationPayload;

fuzz_target!(|data: &[u8]| {
    let Ok(json_str) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(payload) = serde_json::from_str::<EscalationPayload>(json_str) {
        if let Ok(roundtripped) = serde_json::to_string(&payload) {
            let reparsed: EscalationPayload =
                serde_json::from_str(&roundtripped).expect("our own rendering must reparse");
            assert_eq!(payload.message, reparsed.message);
            assert_eq!(payload.unit, reparsed.unit);
        }
    }
});
