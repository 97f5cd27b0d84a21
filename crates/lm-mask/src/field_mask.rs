//! Per-path masking instructions.

use crate::pattern::PatternValidator;
use crate::{MaskingError, Result, Value};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// A caller-supplied transform for one context value.
#[derive(Clone)]
pub struct FieldCallback(Arc<dyn Fn(&Value) -> Value + Send + Sync>);

impl FieldCallback {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn call(&self, value: &Value) -> Value {
        (self.0)(value)
    }
}

impl fmt::Debug for FieldCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FieldCallback(..)")
    }
}

/// What to do with the value found at a configured path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldMaskConfig {
    /// Run the processor's message pattern chain over the value.
    #[serde(rename = "mask_regex")]
    UseProcessorPatterns,
    /// Delete the key.
    Remove,
    /// Substitute a literal.
    Replace { replacement: String },
    /// Apply one ad hoc pattern.
    RegexMask { pattern: String, replacement: String },
    /// Programmatic transform. Not representable in policy files.
    #[serde(skip)]
    Callback(FieldCallback),
}

impl FieldMaskConfig {
    pub fn replace(replacement: impl Into<String>) -> Self {
        FieldMaskConfig::Replace {
            replacement: replacement.into(),
        }
    }

    pub fn regex_mask(pattern: impl Into<String>, replacement: impl Into<String>) -> Self {
        FieldMaskConfig::RegexMask {
            pattern: pattern.into(),
            replacement: replacement.into(),
        }
    }

    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        FieldMaskConfig::Callback(FieldCallback::new(f))
    }

    /// Serialized kind name.
    pub fn kind(&self) -> &'static str {
        match self {
            FieldMaskConfig::UseProcessorPatterns => "mask_regex",
            FieldMaskConfig::Remove => "remove",
            FieldMaskConfig::Replace { .. } => "replace",
            FieldMaskConfig::RegexMask { .. } => "regex_mask",
            FieldMaskConfig::Callback(_) => "callback",
        }
    }

    /// Check the config for `path` at construction time.
    pub fn validate(&self, path: &str, validator: &PatternValidator) -> Result<()> {
        if path.is_empty() || path.split('.').any(str::is_empty) {
            return Err(MaskingError::Configuration(format!(
                "invalid field path '{}'",
                path
            )));
        }
        match self {
            FieldMaskConfig::Replace { replacement } if replacement.is_empty() => {
                Err(MaskingError::Configuration(format!(
                    "replace mask for '{}' requires a non-empty replacement",
                    path
                )))
            }
            FieldMaskConfig::RegexMask { pattern, .. } => validator.validate_all([pattern]),
            _ => Ok(()),
        }
    }
}

impl From<&str> for FieldMaskConfig {
    fn from(replacement: &str) -> Self {
        FieldMaskConfig::replace(replacement)
    }
}

impl From<String> for FieldMaskConfig {
    fn from(replacement: String) -> Self {
        FieldMaskConfig::replace(replacement)
    }
}

/// A field-path table entry as written in a policy: either a typed config
/// or a bare replacement string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldPathEntry {
    Legacy(String),
    Config(FieldMaskConfig),
}

impl From<FieldPathEntry> for FieldMaskConfig {
    fn from(entry: FieldPathEntry) -> Self {
        match entry {
            FieldPathEntry::Legacy(replacement) => FieldMaskConfig::replace(replacement),
            FieldPathEntry::Config(config) => config,
        }
    }
}
