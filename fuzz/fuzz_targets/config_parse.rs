#![no_main]

use libfuzzer_sys::fuzz_target;
use ralph_config::Config;
use std::io::Write;

fuzz_target!(|data: &[u8]| {
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    if file.write_all(data).is_err() {
        return;
    }

    if let Ok(config) = Config::load_from_file(file.path()) {
        // A config that parsed must either validate, or fail validation with a
        // message, never panic.
        let _ = config.validate();
    }
});
