#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        let stripped = extkit::jsonc::strip_comments(input);
        // Stripping never grows the input
        assert!(stripped.len() <= input.len());
        let _ = extkit::jsonc::parse::<serde_json::Value>(input);
    }
});
