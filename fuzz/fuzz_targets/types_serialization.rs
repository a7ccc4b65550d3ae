#![no_main]

use libfuzzer_sys::fuzz_target;
use ralph_types::{Event, Run, Unit};

fuzz_target!(|data: &[u8]| {
    let Ok(json_str) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(unit) = serde_json::from_str::<Unit>(json_str) {
        if let Ok(roundtripped) = serde_json::to_string(&unit) {
            if let Ok(parsed) = serde_json::from_str::<Unit>(&roundtripped) {
                assert_eq!(unit.id, parsed.id);
                assert_eq!(unit.tasks.len(), parsed.tasks.len());
                assert_eq!(unit.depends_on, parsed.depends_on);
            }
        }
    }

    if let Ok(run) = serde_json::from_str::<Run>(json_str) {
        if let Ok(roundtripped) = serde_json::to_string(&run) {
            if let Ok(parsed) = serde_json::from_str::<Run>(&roundtripped) {
                assert_eq!(run.id, parsed.id);
                assert_eq!(run.feature_branch, parsed.feature_branch);
                assert_eq!(run.status, parsed.status);
            }
        }
    }

    if let Ok(event) = serde_json::from_str::<Event>(json_str) {
        if let Ok(roundtripped) = serde_json::to_string(&event) {
            if let Ok(parsed) = serde_json::from_str::<Event>(&roundtripped) {
                assert_eq!(event.unit, parsed.unit);
                assert_eq!(event.task, parsed.task);
            }
        }
    }
});
