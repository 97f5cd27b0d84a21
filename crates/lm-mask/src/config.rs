//! Masking configuration.
//!
//! [`MaskingConfig`] is the complete, programmatic configuration consumed by
//! the orchestrator. [`MaskingPolicy`] is its serializable subset: patterns,
//! field paths and type masks, without callbacks or rules.

use crate::audit::{emit, RateLimitProfile, SharedAuditLogger};
use crate::data_type::{validate_masks, MaskToken, DEFAULT_MAX_DEPTH};
use crate::defaults;
use crate::field_mask::{FieldCallback, FieldMaskConfig, FieldPathEntry};
use crate::pattern::{PatternValidator, DEFAULT_MAX_INPUT_BYTES};
use crate::recursive::MAX_DEPTH_LIMIT;
use crate::rules::{ConditionalRule, SharedRule};
use crate::sanitize::sanitize_message;
use crate::{LogRecord, MaskingError, Result, TypeTag, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Schema version for serialized policies.
pub const POLICY_SCHEMA_VERSION: &str = "1.0.0";

/// Replacement used for values that could not be masked under
/// [`FailureMode::FailClosed`].
pub const FAIL_CLOSED_MASK: &str = "[MASKED]";

/// What happens to a value that cannot be masked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Keep the original value, silently.
    FailOpen,
    /// Keep the original value and record the failure in the audit trail.
    #[default]
    FailSafe,
    /// Replace the value with [`FAIL_CLOSED_MASK`] and audit.
    FailClosed,
}

impl FailureMode {
    pub fn parse_str(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "fail_open" | "open" => Some(FailureMode::FailOpen),
            "fail_safe" | "safe" => Some(FailureMode::FailSafe),
            "fail_closed" | "closed" => Some(FailureMode::FailClosed),
            _ => None,
        }
    }

    /// Value to use in place of `original` after a masking failure.
    pub(crate) fn resolve(
        &self,
        audit_logger: Option<&SharedAuditLogger>,
        audit_path: &str,
        original: &Value,
        reason: &str,
    ) -> Value {
        match self {
            FailureMode::FailOpen => original.clone(),
            FailureMode::FailSafe => {
                emit(
                    audit_logger,
                    audit_path,
                    original,
                    &Value::from(sanitize_message(reason)),
                );
                original.clone()
            }
            FailureMode::FailClosed => {
                let masked = Value::from(FAIL_CLOSED_MASK);
                emit(audit_logger, audit_path, original, &masked);
                masked
            }
        }
    }
}

impl std::fmt::Display for FailureMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureMode::FailOpen => "fail_open",
            FailureMode::FailSafe => "fail_safe",
            FailureMode::FailClosed => "fail_closed",
        };
        write!(f, "{}", s)
    }
}

/// Complete masking configuration.
#[derive(Clone)]
pub struct MaskingConfig {
    /// Ordered `(delimited regex, replacement)` pairs.
    pub patterns: Vec<(String, String)>,
    pub field_paths: BTreeMap<String, FieldMaskConfig>,
    /// Override any field-path config at the same path.
    pub custom_callbacks: BTreeMap<String, FieldCallback>,
    pub data_type_masks: BTreeMap<TypeTag, MaskToken>,
    /// Evaluated in order; all must pass for masking to run.
    pub rules: Vec<(String, SharedRule)>,
    pub max_depth: usize,
    pub audit_logger: Option<SharedAuditLogger>,
    /// Wrap the audit logger with per-bucket rate limits.
    pub audit_rate_limit: Option<RateLimitProfile>,
    pub failure_mode: FailureMode,
    /// Longest string handed to the regex engine.
    pub max_input_bytes: usize,
}

impl Default for MaskingConfig {
    fn default() -> Self {
        Self {
            patterns: Vec::new(),
            field_paths: BTreeMap::new(),
            custom_callbacks: BTreeMap::new(),
            data_type_masks: BTreeMap::new(),
            rules: Vec::new(),
            max_depth: DEFAULT_MAX_DEPTH,
            audit_logger: None,
            audit_rate_limit: None,
            failure_mode: FailureMode::default(),
            max_input_bytes: DEFAULT_MAX_INPUT_BYTES,
        }
    }
}

impl std::fmt::Debug for MaskingConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaskingConfig")
            .field("patterns", &self.patterns)
            .field("field_paths", &self.field_paths)
            .field("custom_callbacks", &self.custom_callbacks.keys().collect::<Vec<_>>())
            .field("data_type_masks", &self.data_type_masks)
            .field(
                "rules",
                &self.rules.iter().map(|(name, _)| name).collect::<Vec<_>>(),
            )
            .field("max_depth", &self.max_depth)
            .field("has_audit_logger", &self.audit_logger.is_some())
            .field("audit_rate_limit", &self.audit_rate_limit)
            .field("failure_mode", &self.failure_mode)
            .field("max_input_bytes", &self.max_input_bytes)
            .finish()
    }
}

impl MaskingConfig {
    pub fn builder() -> MaskingConfigBuilder {
        MaskingConfigBuilder::default()
    }

    /// Configuration carrying the built-in GDPR pattern table.
    pub fn gdpr_defaults() -> Self {
        Self::builder()
            .patterns(defaults::gdpr_patterns())
            .build()
    }

    /// Check the configuration as a whole.
    pub fn validate(&self, validator: &PatternValidator) -> Result<()> {
        if !(1..=MAX_DEPTH_LIMIT).contains(&self.max_depth) {
            return Err(MaskingError::Configuration(format!(
                "max_depth must be between 1 and {}, got {}",
                MAX_DEPTH_LIMIT, self.max_depth
            )));
        }
        if self.max_input_bytes == 0 {
            return Err(MaskingError::Configuration(
                "max_input_bytes must be positive".to_string(),
            ));
        }
        validator.validate_all(self.patterns.iter().map(|(pattern, _)| pattern))?;
        for (path, config) in &self.field_paths {
            config.validate(path, validator)?;
        }
        for path in self.custom_callbacks.keys() {
            if path.is_empty() {
                return Err(MaskingError::Configuration(
                    "custom callback registered for an empty path".to_string(),
                ));
            }
        }
        validate_masks(&self.data_type_masks)?;
        for (name, _) in &self.rules {
            if name.trim().is_empty() {
                return Err(MaskingError::Configuration(
                    "conditional rule names must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Builder for [`MaskingConfig`].
#[derive(Debug, Default)]
pub struct MaskingConfigBuilder {
    config: MaskingConfig,
}

impl MaskingConfigBuilder {
    pub fn pattern(mut self, pattern: impl Into<String>, replacement: impl Into<String>) -> Self {
        self.config
            .patterns
            .push((pattern.into(), replacement.into()));
        self
    }

    pub fn patterns<I, P, R>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = (P, R)>,
        P: Into<String>,
        R: Into<String>,
    {
        self.config
            .patterns
            .extend(patterns.into_iter().map(|(p, r)| (p.into(), r.into())));
        self
    }

    pub fn field_path(mut self, path: impl Into<String>, config: impl Into<FieldMaskConfig>) -> Self {
        self.config.field_paths.insert(path.into(), config.into());
        self
    }

    pub fn custom_callback<F>(mut self, path: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        self.config
            .custom_callbacks
            .insert(path.into(), FieldCallback::new(callback));
        self
    }

    pub fn data_type_mask(mut self, tag: TypeTag, token: impl Into<MaskToken>) -> Self {
        self.config.data_type_masks.insert(tag, token.into());
        self
    }

    pub fn rule(mut self, name: impl Into<String>, rule: SharedRule) -> Self {
        self.config.rules.push((name.into(), rule));
        self
    }

    /// Add a rule from a plain predicate.
    pub fn rule_fn<F>(self, name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&LogRecord) -> bool + Send + Sync + 'static,
    {
        let rule: Arc<dyn ConditionalRule> = Arc::new(predicate);
        self.rule(name, rule)
    }

    pub fn max_depth(mut self, max_depth: usize) -> Self {
        self.config.max_depth = max_depth;
        self
    }

    pub fn audit_logger(mut self, audit_logger: SharedAuditLogger) -> Self {
        self.config.audit_logger = Some(audit_logger);
        self
    }

    pub fn audit_rate_limit(mut self, profile: RateLimitProfile) -> Self {
        self.config.audit_rate_limit = Some(profile);
        self
    }

    pub fn failure_mode(mut self, failure_mode: FailureMode) -> Self {
        self.config.failure_mode = failure_mode;
        self
    }

    pub fn max_input_bytes(mut self, max_input_bytes: usize) -> Self {
        self.config.max_input_bytes = max_input_bytes;
        self
    }

    pub fn build(self) -> MaskingConfig {
        self.config
    }
}

/// A delimited pattern and its replacement, as written in a policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternEntry {
    pub pattern: String,
    pub replacement: String,
}

/// Serializable masking policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaskingPolicy {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,

    /// Prepend the built-in GDPR patterns to `patterns`.
    #[serde(default)]
    pub include_default_patterns: bool,

    /// Ordered pattern chain.
    #[serde(default)]
    pub patterns: Vec<PatternEntry>,

    /// Per-path instructions. Bare strings are replacements.
    #[serde(default)]
    pub field_paths: BTreeMap<String, FieldPathEntry>,

    #[serde(default)]
    pub data_type_masks: BTreeMap<TypeTag, MaskToken>,

    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    #[serde(default)]
    pub failure_mode: FailureMode,

    #[serde(default = "default_max_input_bytes")]
    pub max_input_bytes: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_rate_limit: Option<RateLimitProfile>,
}

fn default_schema_version() -> String {
    POLICY_SCHEMA_VERSION.to_string()
}

fn default_max_depth() -> usize {
    DEFAULT_MAX_DEPTH
}

fn default_max_input_bytes() -> usize {
    DEFAULT_MAX_INPUT_BYTES
}

impl Default for MaskingPolicy {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            include_default_patterns: false,
            patterns: Vec::new(),
            field_paths: BTreeMap::new(),
            data_type_masks: BTreeMap::new(),
            max_depth: default_max_depth(),
            failure_mode: FailureMode::default(),
            max_input_bytes: default_max_input_bytes(),
            audit_rate_limit: None,
        }
    }
}

impl MaskingPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a policy from JSON text.
    pub fn from_json(json: &str) -> Result<Self> {
        let policy: MaskingPolicy = serde_json::from_str(json)?;
        Ok(policy)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Start a builder from this policy so callbacks and rules can be added.
    pub fn into_builder(self) -> MaskingConfigBuilder {
        let mut builder = MaskingConfig::builder();
        if self.include_default_patterns {
            builder = builder.patterns(defaults::gdpr_patterns());
        }
        builder = builder.patterns(
            self.patterns
                .into_iter()
                .map(|entry| (entry.pattern, entry.replacement)),
        );
        for (path, entry) in self.field_paths {
            builder = builder.field_path(path, FieldMaskConfig::from(entry));
        }
        for (tag, token) in self.data_type_masks {
            builder = builder.data_type_mask(tag, token);
        }
        builder = builder
            .max_depth(self.max_depth)
            .failure_mode(self.failure_mode)
            .max_input_bytes(self.max_input_bytes);
        if let Some(profile) = self.audit_rate_limit {
            builder = builder.audit_rate_limit(profile);
        }
        builder
    }

    pub fn into_config(self) -> MaskingConfig {
        self.into_builder().build()
    }
}
