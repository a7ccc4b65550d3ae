#![no_main]

use libfuzzer_sys::fuzz_target;
use ralph::discover;
use std::fs;

// Frontmatter parsing runs over plan/task files a user hand-edits; a malformed
// block must surface as a `DiscoveryViolation`, never panic the orchestrator.
fuzz_target!(|data: &[u8]| {
    let Ok(body) = std::str::from_utf8(data) else {
        return;
    };

    let root = tempfile::tempdir().expect("tempdir");
    let unit_dir = root.path().join("unit-fuzz");
    fs::create_dir_all(&unit_dir).expect("mkdir");
    let _ = fs::write(unit_dir.join("IMPLEMENTATION_PLAN.md"), body);
    let _ = fs::write(unit_dir.join("01-task.md"), body);

    let _ = discover(root.path());
});
