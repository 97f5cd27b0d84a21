//! Conditional rules gating whether a record is masked at all.
//!
//! Rules are AND-combined. A rule that fails to evaluate abstains instead
//! of vetoing.

use crate::audit::{emit, paths, SharedAuditLogger};
use crate::record::{Level, LogRecord};
use crate::sanitize::sanitize_message;
use crate::Value;
use std::any::Any;
use std::fmt::Display;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of evaluating one rule against a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleOutcome {
    Pass,
    Fail,
    /// The rule could not decide; the reason is logged and ignored.
    Abstain(String),
}

impl From<bool> for RuleOutcome {
    fn from(pass: bool) -> Self {
        if pass {
            RuleOutcome::Pass
        } else {
            RuleOutcome::Fail
        }
    }
}

/// A named predicate over a log record.
pub trait ConditionalRule: Send + Sync {
    fn evaluate(&self, record: &LogRecord) -> RuleOutcome;
}

impl<F> ConditionalRule for F
where
    F: Fn(&LogRecord) -> bool + Send + Sync,
{
    fn evaluate(&self, record: &LogRecord) -> RuleOutcome {
        RuleOutcome::from(self(record))
    }
}

/// Rule shared between configs and orchestrators.
pub type SharedRule = Arc<dyn ConditionalRule>;

/// Adapter for predicates that can fail.
pub struct Fallible<F>(F);

impl<F, E> ConditionalRule for Fallible<F>
where
    F: Fn(&LogRecord) -> std::result::Result<bool, E> + Send + Sync,
    E: Display,
{
    fn evaluate(&self, record: &LogRecord) -> RuleOutcome {
        match (self.0)(record) {
            Ok(pass) => RuleOutcome::from(pass),
            Err(e) => RuleOutcome::Abstain(e.to_string()),
        }
    }
}

/// Wrap a fallible predicate. Errors make the rule abstain.
pub fn from_fallible<F, E>(f: F) -> SharedRule
where
    F: Fn(&LogRecord) -> std::result::Result<bool, E> + Send + Sync + 'static,
    E: Display + 'static,
{
    Arc::new(Fallible(f))
}

/// Mask only records at or above `level`.
pub fn level_at_least(level: Level) -> SharedRule {
    Arc::new(move |record: &LogRecord| record.level >= level)
}

/// Mask only records whose level is one of `levels`.
pub fn level_in(levels: impl IntoIterator<Item = Level>) -> SharedRule {
    let levels: Vec<Level> = levels.into_iter().collect();
    Arc::new(move |record: &LogRecord| levels.contains(&record.level))
}

/// Mask only records from one of `channels`.
pub fn channel_in<S: Into<String>>(channels: impl IntoIterator<Item = S>) -> SharedRule {
    let channels: Vec<String> = channels.into_iter().map(Into::into).collect();
    Arc::new(move |record: &LogRecord| channels.iter().any(|c| *c == record.channel))
}

/// Mask only records whose context has `path`.
pub fn context_field_present(path: impl Into<String>) -> SharedRule {
    let path = path.into();
    Arc::new(move |record: &LogRecord| record.context.has_path(&path))
}

/// Mask only records whose context holds `expected` at `path`.
pub fn context_field_equals(path: impl Into<String>, expected: impl Into<Value>) -> SharedRule {
    let path = path.into();
    let expected = expected.into();
    Arc::new(move |record: &LogRecord| record.context.get_path(&path) == Some(&expected))
}

/// Evaluates a rule set, auditing vetoes and abstentions.
#[derive(Clone, Default)]
pub struct ConditionalRuleEvaluator {
    audit_logger: Option<SharedAuditLogger>,
}

impl std::fmt::Debug for ConditionalRuleEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConditionalRuleEvaluator")
            .field("has_audit_logger", &self.audit_logger.is_some())
            .finish()
    }
}

impl ConditionalRuleEvaluator {
    pub fn new(audit_logger: Option<SharedAuditLogger>) -> Self {
        Self { audit_logger }
    }

    pub fn set_audit_logger(&mut self, audit_logger: Option<SharedAuditLogger>) {
        self.audit_logger = audit_logger;
    }

    /// Whether masking should run for `record`. An empty rule set always
    /// passes; the first failing rule vetoes.
    pub fn should_mask(&self, record: &LogRecord, rules: &[(String, SharedRule)]) -> bool {
        for (name, rule) in rules {
            let outcome = catch_unwind(AssertUnwindSafe(|| rule.evaluate(record)))
                .unwrap_or_else(|payload| RuleOutcome::Abstain(panic_reason(payload.as_ref())));
            match outcome {
                RuleOutcome::Pass => {}
                RuleOutcome::Fail => {
                    debug!(rule = %name, "Conditional rule skipped masking");
                    emit(
                        self.audit_logger.as_ref(),
                        paths::CONDITIONAL_SKIP,
                        &Value::from(name.as_str()),
                        &Value::from("Masking skipped due to conditional rule"),
                    );
                    return false;
                }
                RuleOutcome::Abstain(reason) => {
                    let reason = sanitize_message(&reason);
                    warn!(rule = %name, reason = %reason, "Conditional rule failed, ignoring it");
                    emit(
                        self.audit_logger.as_ref(),
                        paths::CONDITIONAL_ERROR,
                        &Value::from(name.as_str()),
                        &Value::from(format!("Rule error: {}", reason)),
                    );
                }
            }
        }
        true
    }
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "rule panicked".to_string()
    }
}
