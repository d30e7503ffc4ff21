#![no_main]

use extkit::activation::{compile_pattern, ActivationMatcher, PatternActivationMatcher};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };
    let (pattern, event) = input.split_once('\n').unwrap_or((input, input));

    if let Ok(regex) = compile_pattern(pattern) {
        // A pattern without wildcards only matches itself
        if !pattern.contains('*') {
            assert_eq!(regex.is_match(event), pattern.trim() == event);
        }
    }

    let matcher = PatternActivationMatcher::new();
    matcher.register("fuzz.ext", &[pattern.to_string()]);
    let _ = matcher.should_activate("fuzz.ext", event);
    matcher.unregister("fuzz.ext");
    assert!(!matcher.should_activate("fuzz.ext", event));
});
