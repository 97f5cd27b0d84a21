//! Fuzz target for embedded-JSON masking.
//!
//! Arbitrary messages must never panic, and masking with an identity
//! function must return the message unchanged.

#![no_main]

use libfuzzer_sys::fuzz_target;
use lm_mask::{JsonMasker, Value};

fuzz_target!(|data: &[u8]| {
    let Ok(message) = std::str::from_utf8(data) else {
        return;
    };
    let masker = JsonMasker::default();

    let unchanged = masker.process_message(message, |v| v.clone());
    assert_eq!(unchanged, message);

    let _ = masker.process_message(message, |v| match v {
        Value::Str(_) => Value::from("[X]"),
        other => other.clone(),
    });
});
