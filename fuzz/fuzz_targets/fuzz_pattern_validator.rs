//! Fuzz target for delimited pattern validation.
//!
//! Validation handles arbitrary input without panicking, and any pattern it
//! accepts must compile.

#![no_main]

use libfuzzer_sys::fuzz_target;
use lm_mask::pattern::{compile_delimited, PatternValidator};

fuzz_target!(|data: &[u8]| {
    let Ok(pattern) = std::str::from_utf8(data) else {
        return;
    };
    let validator = PatternValidator::new();
    if validator.is_valid(pattern) {
        assert!(compile_delimited(pattern).is_ok());
    }
});
