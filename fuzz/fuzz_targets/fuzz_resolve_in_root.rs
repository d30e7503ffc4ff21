#![no_main]

use extkit::contributions::resolve_in_root;
use libfuzzer_sys::fuzz_target;
use std::path::Path;

fuzz_target!(|data: &[u8]| {
    if let Ok(relative) = std::str::from_utf8(data) {
        let root = Path::new("/extensions/acme.lint-1.0.0");
        if let Ok(resolved) = resolve_in_root(root, &root.join("themes"), relative) {
            assert!(resolved.starts_with(root));
        }
    }
});
