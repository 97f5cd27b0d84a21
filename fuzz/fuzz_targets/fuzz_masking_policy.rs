//! Fuzz target for masking policy parsing.
//!
//! Tests that JSON policy parsing and orchestrator construction handle
//! arbitrary input without panicking.

#![no_main]

use libfuzzer_sys::fuzz_target;
use lm_mask::{MaskingOrchestrator, MaskingPolicy, PatternValidator};

fuzz_target!(|data: &[u8]| {
    let Ok(policy) = serde_json::from_slice::<MaskingPolicy>(data) else {
        return;
    };
    let _ = MaskingOrchestrator::with_validator(policy.into_config(), &PatternValidator::new());
});
