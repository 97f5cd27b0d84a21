//! End-to-end masking tests through the public API.
//!
//! Covers the documented scenarios plus the cross-component guarantees:
//! - conditional vetoes leave records byte-for-byte unchanged
//! - embedded JSON stays valid after masking
//! - custom callbacks win over field-path configs
//! - audit suppression is observable exactly once per violation window

use lm_mask::audit::paths;
use lm_mask::defaults::gdpr_patterns;
use lm_mask::{
    FailureMode, FieldMaskConfig, Level, LogRecord, ManualClock, MaskingConfig,
    MaskingOrchestrator, MaskingPolicy, MemoryAuditLogger, PatternValidator, RateLimitProfile,
    RateLimitStore, RateLimitedAuditLogger, RateLimiter, SharedAuditLogger, TypeTag, Value,
};
use serde_json::json;
use std::sync::Arc;

fn build(config: MaskingConfig) -> MaskingOrchestrator {
    MaskingOrchestrator::with_validator(config, &PatternValidator::new())
        .expect("valid configuration")
}

fn sink() -> (Arc<MemoryAuditLogger>, SharedAuditLogger) {
    let sink = Arc::new(MemoryAuditLogger::new());
    let logger: SharedAuditLogger = sink.clone();
    (sink, logger)
}

/// Canary values every default pattern must catch.
const CANARY_PII: &[&str] = &[
    "john.doe@example.com",
    "123-45-6789",
    "131052-308T",
    "4111 1111 1111 1111",
    "+358 40 1234567",
    "10.20.30.40",
];

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn test_scenario_a_ssn_in_message() {
    let o = build(
        MaskingConfig::builder()
            .pattern(r"/\d{3}-\d{2}-\d{4}/", "[SSN]")
            .build(),
    );
    let (message, _) = o.process(&LogRecord::new("SSN: 123-45-6789", Level::Info));
    assert_eq!(message, "SSN: [SSN]");
}

#[test]
fn test_scenario_b_remove_field() {
    let o = build(
        MaskingConfig::builder()
            .field_path("user.ssn", FieldMaskConfig::Remove)
            .build(),
    );
    let record = LogRecord::new("lookup", Level::Info).with_context(Value::from(json!({
        "user": {"ssn": "123-45-6789", "name": "John"}
    })));
    let (_, context) = o.process(&record);
    assert!(!context.has_path("user.ssn"));
    assert_eq!(context.get_path("user.name"), Some(&Value::from("John")));
}

#[test]
fn test_scenario_c_rate_limiter() {
    let clock = Arc::new(ManualClock::new(1_000));
    let store = Arc::new(RateLimitStore::with_clock(clock.clone()));
    let limiter = RateLimiter::with_store(3, 60, store).unwrap();

    let calls: Vec<bool> = (0..4).map(|_| limiter.is_allowed("k").unwrap()).collect();
    assert_eq!(calls, vec![true, true, true, false]);

    clock.advance(61);
    assert!(limiter.is_allowed("k").unwrap());
}

#[test]
fn test_scenario_d_rule_skips_masking() {
    let o = build(
        MaskingConfig::builder()
            .patterns(gdpr_patterns())
            .rule_fn("error_only", |r: &LogRecord| r.level == Level::Error)
            .build(),
    );
    let (message, _) = o.process(&LogRecord::new("test@example.com", Level::Info));
    assert_eq!(message, "test@example.com");

    let (message, _) = o.process(&LogRecord::new("test@example.com", Level::Error));
    assert_eq!(message, "[EMAIL]");
}

#[test]
fn test_scenario_e_integer_mask_is_numeric() {
    let o = build(
        MaskingConfig::builder()
            .data_type_mask(TypeTag::Integer, "0")
            .build(),
    );
    let record = LogRecord::new("age", Level::Info).with_context(Value::from(json!({"age": 25})));
    let (_, context) = o.process(&record);
    assert_eq!(context, Value::from(json!({"age": 0})));
    assert_eq!(context.get_path("age"), Some(&Value::Int(0)));
}

// ============================================================================
// Cross-component guarantees
// ============================================================================

#[test]
fn test_default_patterns_catch_canaries() {
    let o = build(MaskingConfig::gdpr_defaults());
    for pii in CANARY_PII {
        let message = format!("user detail: {} (end)", pii);
        let record = LogRecord::new(message.clone(), Level::Info)
            .with_context(Value::from(json!({"nested": {"value": pii}})));
        let (masked, context) = o.process(&record);
        assert!(
            !masked.contains(pii),
            "PII leaked in message\n  pii={}\n  output={}",
            pii,
            masked
        );
        let nested = context.get_path("nested.value").and_then(Value::as_str);
        assert_ne!(nested, Some(*pii), "PII leaked in context: {}", pii);
    }
}

#[test]
fn test_any_false_rule_leaves_record_unchanged() {
    let (sink, logger) = sink();
    let o = build(
        MaskingConfig::builder()
            .patterns(gdpr_patterns())
            .field_path("user.ssn", FieldMaskConfig::Remove)
            .data_type_mask(TypeTag::Integer, "0")
            .rule_fn("always", |_: &LogRecord| true)
            .rule_fn("billing_only", |r: &LogRecord| r.channel == "billing")
            .rule_fn("also_true", |_: &LogRecord| true)
            .audit_logger(logger)
            .build(),
    );
    let record = LogRecord::new(r#"mail a@b.io {"ip":"10.0.0.1"}"#, Level::Warning)
        .with_context(Value::from(json!({
            "user": {"ssn": "123-45-6789", "age": 40},
            "list": ["a@b.io", 3]
        })));
    let (message, context) = o.process(&record);
    assert_eq!(message, record.message);
    assert_eq!(context, record.context);
    assert_eq!(
        serde_json::to_string(&context).unwrap(),
        serde_json::to_string(&record.context).unwrap()
    );

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].path, paths::CONDITIONAL_SKIP);
    assert_eq!(events[0].original, Value::from("billing_only"));
}

#[test]
fn test_failing_rule_abstains_and_masking_runs() {
    let (sink, logger) = sink();
    let o = build(
        MaskingConfig::builder()
            .patterns(gdpr_patterns())
            .rule(
                "lookup",
                lm_mask::rules::from_fallible(|_: &LogRecord| -> Result<bool, String> {
                    Err("backend postgres://svc:hunter2@db/rules unavailable".into())
                }),
            )
            .audit_logger(logger)
            .build(),
    );
    let (message, _) = o.process(&LogRecord::new("contact a@b.io", Level::Info));
    assert_eq!(message, "contact [EMAIL]");

    let errors = sink.events_for(paths::CONDITIONAL_ERROR);
    assert_eq!(errors.len(), 1);
    let reason = errors[0].masked.as_str().unwrap();
    assert!(!reason.contains("hunter2"), "secret leaked into audit: {}", reason);
}

#[test]
fn test_embedded_json_stays_valid() {
    let o = build(MaskingConfig::gdpr_defaults());
    let document = json!({
        "user": {"email": "jane@example.org", "id": 17, "tags": ["vip", "a@b.io"]},
        "empty": {},
        "none": []
    });
    let message = format!("request body: {} end", document);
    let (masked, _) = o.process(&LogRecord::new(message, Level::Info));

    let start = masked.find('{').unwrap();
    let end = masked.rfind('}').unwrap();
    let parsed: serde_json::Value =
        serde_json::from_str(&masked[start..=end]).expect("masked JSON must stay valid");
    assert_eq!(parsed["user"]["email"], "[EMAIL]");
    assert_eq!(parsed["user"]["id"], 17);
    assert_eq!(parsed["user"]["tags"][0], "vip");
    assert_eq!(parsed["empty"], json!({}));
    assert_eq!(parsed["none"], json!([]));
    assert!(masked.starts_with("request body: "));
    assert!(masked.ends_with(" end"));
}

#[test]
fn test_embedded_json_only_targeted_fields_differ() {
    let o = build(MaskingConfig::builder().pattern("/^secret$/", "[X]").build());
    let (masked, _) = o.process(&LogRecord::new(
        r#"body {"zeta":"secret","alpha":1,"nested":{"y":[2,"secret"],"b":null}}"#,
        Level::Info,
    ));
    assert_eq!(
        masked,
        r#"body {"zeta":"[X]","alpha":1,"nested":{"y":[2,"[X]"],"b":null}}"#
    );
}

#[test]
fn test_custom_callback_overrides_field_path() {
    let (sink, logger) = sink();
    let o = build(
        MaskingConfig::builder()
            .field_path("user.email", FieldMaskConfig::Remove)
            .custom_callback("user.email", |v| match v {
                Value::Str(s) => Value::from(format!("{}@***", &s[..1])),
                other => other.clone(),
            })
            .audit_logger(logger)
            .build(),
    );
    let record = LogRecord::new("x", Level::Info)
        .with_context(Value::from(json!({"user": {"email": "jane@example.org"}})));
    let (_, context) = o.process(&record);
    assert_eq!(context.get_path("user.email"), Some(&Value::from("j@***")));
    assert_eq!(sink.paths(), vec!["user.email"]);
}

#[test]
fn test_depth_bound_leaves_deep_subtree() {
    let o = build(
        MaskingConfig::builder()
            .pattern("/secret/", "[X]")
            .max_depth(2)
            .build(),
    );
    let context = Value::from(json!({
        "a": "secret",
        "b": {"c": "secret", "d": {"e": "secret"}}
    }));
    let (_, masked) = o.process(&LogRecord::new("x", Level::Info).with_context(context.clone()));
    assert_eq!(masked.get_path("a"), Some(&Value::from("[X]")));
    assert_eq!(masked.get_path("b.c"), Some(&Value::from("[X]")));
    assert_eq!(masked.get_path("b.d"), context.get_path("b.d"));
}

#[test]
fn test_unmaskable_values_follow_failure_mode() {
    let context = Value::Map(
        [
            ("fd".to_string(), Value::resource("stream", 4)),
            ("email".to_string(), Value::from("a@b.io")),
        ]
        .into_iter()
        .collect(),
    );
    let record = LogRecord::new("x", Level::Info).with_context(context);

    for (mode, expected_fd) in [
        (FailureMode::FailOpen, Value::resource("stream", 4)),
        (FailureMode::FailSafe, Value::resource("stream", 4)),
        (FailureMode::FailClosed, Value::from("[MASKED]")),
    ] {
        let (sink, logger) = sink();
        let o = build(
            MaskingConfig::builder()
                .patterns(gdpr_patterns())
                .field_path("fd", FieldMaskConfig::UseProcessorPatterns)
                .failure_mode(mode)
                .audit_logger(logger)
                .build(),
        );
        let (_, masked) = o.process(&record);
        assert_eq!(masked.get_path("fd"), Some(&expected_fd), "mode {}", mode);
        assert_eq!(masked.get_path("email"), Some(&Value::from("[EMAIL]")));
        let failures = sink.events_for(paths::MASKING_FAILED).len();
        assert_eq!(failures, usize::from(mode != FailureMode::FailOpen), "mode {}", mode);
    }
}

#[test]
fn test_policy_file_drives_orchestrator() {
    let policy = MaskingPolicy::from_json(
        r##"{
            "include_default_patterns": true,
            "field_paths": {
                "card": {"type": "remove"},
                "name": "[NAME]",
                "phone": {"type": "regex_mask", "pattern": "/\\d(?=\\d{0})/", "replacement": "#"}
            },
            "data_type_masks": {"boolean": "false"}
        }"##,
    );
    // Look-around is not supported by the regex engine: the policy is
    // rejected at construction rather than at masking time.
    let config = policy.unwrap().into_config();
    assert!(MaskingOrchestrator::with_validator(config, &PatternValidator::new()).is_err());

    let policy = MaskingPolicy::from_json(
        r##"{
            "include_default_patterns": true,
            "field_paths": {
                "card": {"type": "remove"},
                "name": "[NAME]",
                "phone": {"type": "regex_mask", "pattern": "/\\d/", "replacement": "#"}
            },
            "data_type_masks": {"boolean": "false"}
        }"##,
    )
    .unwrap();
    let o = build(policy.into_config());
    let record = LogRecord::new("x", Level::Info).with_context(Value::from(json!({
        "card": "4111 1111 1111 1111",
        "name": "Jane",
        "phone": "040-123",
        "active": true
    })));
    let (_, context) = o.process(&record);
    assert_eq!(
        context,
        Value::from(json!({"name": "[NAME]", "phone": "###-###", "active": false}))
    );
}

// ============================================================================
// Audit rate limiting
// ============================================================================

#[test]
fn test_rate_limited_audit_emits_one_synthetic_event() {
    let (sink, logger) = sink();
    let clock = Arc::new(ManualClock::new(5_000));
    let store = Arc::new(RateLimitStore::with_clock(clock.clone()));
    let limited: SharedAuditLogger = Arc::new(
        RateLimitedAuditLogger::with_limits(Some(logger), 3, 60, store).unwrap(),
    );

    let o = build(
        MaskingConfig::builder()
            .pattern("/secret/", "[X]")
            .audit_logger(limited)
            .build(),
    );
    let context = Value::from(json!({
        "a": "secret", "b": "secret", "c": "secret", "d": "secret", "e": "secret"
    }));
    o.process(&LogRecord::new("x", Level::Info).with_context(context.clone()));

    assert_eq!(
        sink.paths(),
        vec!["a", "b", "c", paths::RATE_LIMIT_EXCEEDED]
    );

    clock.advance(61);
    o.process(&LogRecord::new("x", Level::Info).with_context(context));
    assert_eq!(sink.len(), 8);
    assert_eq!(sink.events_for(paths::RATE_LIMIT_EXCEEDED).len(), 2);
}

#[test]
fn test_configured_rate_limit_profile_wraps_logger() {
    let (sink, logger) = sink();
    let o = build(
        MaskingConfig::builder()
            .pattern("/secret/", "[X]")
            .audit_logger(logger)
            .audit_rate_limit(RateLimitProfile::Strict)
            .build(),
    );
    let items: Vec<serde_json::Value> = (0..80).map(|_| json!("secret")).collect();
    o.process(&LogRecord::new("x", Level::Info).with_context(Value::from(json!({ "items": items }))));

    assert_eq!(sink.len(), RateLimitProfile::Strict.max_requests() + 1);
    assert_eq!(sink.events_for(paths::RATE_LIMIT_EXCEEDED).len(), 1);
}

#[test]
fn test_panicking_audit_logger_never_breaks_processing() {
    let logger: SharedAuditLogger = Arc::new(|_: &str, _: &Value, _: &Value| {
        panic!("audit sink down");
    });
    let o = build(
        MaskingConfig::builder()
            .patterns(gdpr_patterns())
            .audit_logger(logger)
            .build(),
    );
    let (message, context) = o.process(
        &LogRecord::new("mail a@b.io", Level::Info)
            .with_context(Value::from(json!({"email": "c@d.io"}))),
    );
    assert_eq!(message, "mail [EMAIL]");
    assert_eq!(context.get_path("email"), Some(&Value::from("[EMAIL]")));
}

// ============================================================================
// Sharing across threads
// ============================================================================

fn assert_send_sync<T: Send + Sync>() {}

#[test]
fn test_public_processors_are_send_sync() {
    assert_send_sync::<MaskingOrchestrator>();
    assert_send_sync::<PatternValidator>();
    assert_send_sync::<RateLimiter>();
    assert_send_sync::<RateLimitStore>();
    assert_send_sync::<RateLimitedAuditLogger>();
    assert_send_sync::<MemoryAuditLogger>();
}

#[test]
fn test_shared_orchestrator_rate_limits_across_threads() {
    const MAX_EVENTS: usize = 25;
    const THREADS: usize = 4;
    const RECORDS_PER_THREAD: usize = 50;

    let (sink, logger) = sink();
    let clock = Arc::new(ManualClock::new(1_000));
    let store = Arc::new(RateLimitStore::with_clock(clock));
    let limited: SharedAuditLogger = Arc::new(
        RateLimitedAuditLogger::with_limits(Some(logger), MAX_EVENTS, 60, store).unwrap(),
    );
    let o = Arc::new(build(
        MaskingConfig::builder()
            .pattern("/secret/", "[X]")
            .audit_logger(limited)
            .build(),
    ));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let o = Arc::clone(&o);
            std::thread::spawn(move || {
                for i in 0..RECORDS_PER_THREAD {
                    let record = LogRecord::new(format!("worker {} record {}", t, i), Level::Info)
                        .with_context(Value::from(json!({"token": "secret"})));
                    let (_, context) = o.process(&record);
                    assert_eq!(context.get_path("token"), Some(&Value::from("[X]")));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker thread panicked");
    }

    assert_eq!(sink.events_for("token").len(), MAX_EVENTS);
    assert_eq!(sink.events_for(paths::RATE_LIMIT_EXCEEDED).len(), 1);
    assert_eq!(sink.len(), MAX_EVENTS + 1);
}

#[test]
fn test_shared_validator_across_threads() {
    let patterns: Vec<String> = (0..32).map(|i| format!("/thread-pattern-{}/", i)).collect();
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let patterns = patterns.clone();
            std::thread::spawn(move || {
                let validator = PatternValidator::shared();
                for pattern in &patterns {
                    assert!(validator.is_valid(pattern));
                }
                assert!(!validator.is_valid("/(a+)+$/"));
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker thread panicked");
    }
    assert!(PatternValidator::shared().cache_len() >= patterns.len() + 1);
}
