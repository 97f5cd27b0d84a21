//! Field-path and custom-callback masking of a context tree.

use crate::audit::{emit, paths, SharedAuditLogger};
use crate::config::FailureMode;
use crate::field_mask::{FieldCallback, FieldMaskConfig};
use crate::pattern::{CompiledPattern, PatternChain, PatternValidator};
use crate::Result;
use crate::Value;
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::debug;

enum FieldAction {
    Remove,
    Set(Value),
}

/// Applies per-path masking instructions to a context tree.
///
/// A custom callback registered for a path fully overrides the path's
/// [`FieldMaskConfig`]. Paths that do not resolve are skipped.
pub struct ContextProcessor {
    chain: Arc<PatternChain>,
    field_paths: BTreeMap<String, FieldMaskConfig>,
    regex_masks: HashMap<String, CompiledPattern>,
    custom_callbacks: BTreeMap<String, FieldCallback>,
    failure_mode: FailureMode,
    audit_logger: Option<SharedAuditLogger>,
}

impl std::fmt::Debug for ContextProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextProcessor")
            .field("field_paths", &self.field_paths.keys().collect::<Vec<_>>())
            .field("custom_callbacks", &self.custom_callbacks.keys().collect::<Vec<_>>())
            .field("failure_mode", &self.failure_mode)
            .finish()
    }
}

impl ContextProcessor {
    /// Validate the field-path table and compile its ad hoc patterns.
    pub fn new(
        chain: Arc<PatternChain>,
        field_paths: BTreeMap<String, FieldMaskConfig>,
        custom_callbacks: BTreeMap<String, FieldCallback>,
        validator: &PatternValidator,
    ) -> Result<Self> {
        let mut regex_masks = HashMap::new();
        for (path, config) in &field_paths {
            config.validate(path, validator)?;
            if let FieldMaskConfig::RegexMask {
                pattern,
                replacement,
            } = config
            {
                let compiled = CompiledPattern::new(validator, pattern, replacement.as_str())?;
                regex_masks.insert(path.clone(), compiled);
            }
        }
        Ok(Self {
            chain,
            field_paths,
            regex_masks,
            custom_callbacks,
            failure_mode: FailureMode::default(),
            audit_logger: None,
        })
    }

    pub fn with_failure_mode(mut self, failure_mode: FailureMode) -> Self {
        self.failure_mode = failure_mode;
        self
    }

    pub fn set_audit_logger(&mut self, audit_logger: Option<SharedAuditLogger>) {
        self.audit_logger = audit_logger;
    }

    pub fn field_paths(&self) -> &BTreeMap<String, FieldMaskConfig> {
        &self.field_paths
    }

    pub fn has_custom_callback(&self, path: &str) -> bool {
        self.custom_callbacks.contains_key(path)
    }

    /// Apply every field-path config whose path resolves in `tree`.
    ///
    /// Returns the paths that were handled, changed or not. Paths owned by
    /// a custom callback are left for [`apply_custom_callbacks`].
    ///
    /// [`apply_custom_callbacks`]: ContextProcessor::apply_custom_callbacks
    pub fn mask_field_paths(&self, tree: &mut Value) -> Vec<String> {
        let mut processed = Vec::new();
        for (path, config) in &self.field_paths {
            if self.custom_callbacks.contains_key(path) {
                continue;
            }
            let Some(original) = tree.get_path(path).cloned() else {
                continue;
            };
            match self.resolve(path, &original, config) {
                FieldAction::Remove => {
                    tree.remove_path(path);
                    self.audit(path, &original, &Value::Null);
                }
                FieldAction::Set(masked) => {
                    if masked != original {
                        self.audit(path, &original, &masked);
                        tree.set_path(path, masked);
                    }
                }
            }
            processed.push(path.clone());
        }
        processed
    }

    /// Run registered custom callbacks. Returns the paths handled.
    pub fn apply_custom_callbacks(&self, tree: &mut Value) -> Vec<String> {
        let mut processed = Vec::new();
        for (path, callback) in &self.custom_callbacks {
            let Some(original) = tree.get_path(path).cloned() else {
                continue;
            };
            let masked = self.invoke(path, callback, &original);
            if masked != original {
                self.audit(path, &original, &masked);
                tree.set_path(path, masked);
            }
            processed.push(path.clone());
        }
        processed
    }

    /// Mask a single value with the message pattern chain. Containers are
    /// masked leaf-wise; non-string scalars become strings only if a
    /// pattern changed their text.
    pub fn mask_with_patterns(&self, value: &Value) -> Value {
        match value {
            Value::Null => Value::Null,
            Value::Str(text) => match self.chain.apply(text) {
                Ok(masked) if masked != *text => Value::Str(masked),
                Ok(_) => value.clone(),
                Err(e) => self.fail(paths::PREG_REPLACE_ERROR, value, &e.to_string()),
            },
            Value::Bool(_) | Value::Int(_) | Value::Float(_) => {
                let text = value.to_text().unwrap_or_default();
                match self.chain.apply(&text) {
                    Ok(masked) if masked != text => Value::Str(masked),
                    Ok(_) => value.clone(),
                    Err(e) => self.fail(paths::PREG_REPLACE_ERROR, value, &e.to_string()),
                }
            }
            Value::List(items) => {
                Value::List(items.iter().map(|v| self.mask_with_patterns(v)).collect())
            }
            Value::Map(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.mask_with_patterns(v)))
                    .collect(),
            ),
            Value::Object(_) | Value::Resource(_) => self.fail(
                paths::MASKING_FAILED,
                value,
                &format!("cannot apply patterns to a value of type {}", value.type_name()),
            ),
        }
    }

    fn resolve(&self, path: &str, original: &Value, config: &FieldMaskConfig) -> FieldAction {
        match config {
            FieldMaskConfig::UseProcessorPatterns => {
                FieldAction::Set(self.mask_with_patterns(original))
            }
            FieldMaskConfig::Remove => FieldAction::Remove,
            FieldMaskConfig::Replace { replacement } => {
                FieldAction::Set(Value::Str(replacement.clone()))
            }
            FieldMaskConfig::RegexMask { .. } => {
                FieldAction::Set(self.apply_regex_mask(path, original))
            }
            FieldMaskConfig::Callback(callback) => {
                FieldAction::Set(self.invoke(path, callback, original))
            }
        }
    }

    fn apply_regex_mask(&self, path: &str, original: &Value) -> Value {
        let Some(pattern) = self.regex_masks.get(path) else {
            return original.clone();
        };
        if matches!(original, Value::Null) {
            return Value::Null;
        }
        let Some(text) = original.to_text() else {
            return self.fail(
                paths::MASKING_FAILED,
                original,
                &format!("cannot apply a pattern to a value of type {}", original.type_name()),
            );
        };
        if text.len() > self.chain.max_input_bytes() {
            return self.fail(
                paths::PREG_REPLACE_ERROR,
                original,
                &format!(
                    "input of {} bytes exceeds regex bound of {} bytes",
                    text.len(),
                    self.chain.max_input_bytes()
                ),
            );
        }
        match pattern.replace(&text) {
            std::borrow::Cow::Owned(masked) => Value::Str(masked),
            std::borrow::Cow::Borrowed(_) => original.clone(),
        }
    }

    fn invoke(&self, path: &str, callback: &FieldCallback, original: &Value) -> Value {
        match catch_unwind(AssertUnwindSafe(|| callback.call(original))) {
            Ok(masked) => masked,
            Err(_) => {
                debug!(path, "Custom callback panicked");
                self.fail(paths::MASKING_FAILED, original, "custom callback panicked")
            }
        }
    }

    fn fail(&self, audit_path: &str, original: &Value, reason: &str) -> Value {
        self.failure_mode
            .resolve(self.audit_logger.as_ref(), audit_path, original, reason)
    }

    fn audit(&self, path: &str, original: &Value, masked: &Value) {
        emit(self.audit_logger.as_ref(), path, original, masked);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditLogger;
    use crate::config::FAIL_CLOSED_MASK;

    fn chain() -> Arc<PatternChain> {
        Arc::new(
            PatternChain::compile(
                &PatternValidator::new(),
                [
                    (r"/\d{3}-\d{2}-\d{4}/", "[SSN]"),
                    (r"/[\w.]+@[\w.]+/", "[EMAIL]"),
                    (r"/^42$/", "[ANSWER]"),
                ],
            )
            .unwrap(),
        )
    }

    fn processor(
        field_paths: Vec<(&str, FieldMaskConfig)>,
        callbacks: Vec<(&str, FieldCallback)>,
    ) -> (ContextProcessor, Arc<MemoryAuditLogger>) {
        let sink = Arc::new(MemoryAuditLogger::new());
        let mut processor = ContextProcessor::new(
            chain(),
            field_paths
                .into_iter()
                .map(|(p, c)| (p.to_string(), c))
                .collect(),
            callbacks
                .into_iter()
                .map(|(p, c)| (p.to_string(), c))
                .collect(),
            &PatternValidator::new(),
        )
        .unwrap();
        let logger: SharedAuditLogger = sink.clone();
        processor.set_audit_logger(Some(logger));
        (processor, sink)
    }

    fn context() -> Value {
        Value::from(serde_json::json!({
            "user": {
                "ssn": "123-45-6789",
                "name": "John",
                "email": "john@example.com",
                "age": 42,
                "notes": ["call 555-12-3456", "ok"]
            }
        }))
    }

    #[test]
    fn test_remove() {
        let (processor, sink) = processor(vec![("user.ssn", FieldMaskConfig::Remove)], vec![]);
        let mut tree = context();
        let processed = processor.mask_field_paths(&mut tree);
        assert_eq!(processed, vec!["user.ssn"]);
        assert!(!tree.has_path("user.ssn"));
        assert_eq!(tree.get_path("user.name"), Some(&Value::from("John")));
        assert_eq!(sink.events()[0].masked, Value::Null);
    }

    #[test]
    fn test_replace_and_missing_path() {
        let (processor, sink) = processor(
            vec![
                ("user.name", FieldMaskConfig::replace("[NAME]")),
                ("user.missing", FieldMaskConfig::Remove),
            ],
            vec![],
        );
        let mut tree = context();
        let processed = processor.mask_field_paths(&mut tree);
        assert_eq!(processed, vec!["user.name"]);
        assert_eq!(tree.get_path("user.name"), Some(&Value::from("[NAME]")));
        assert_eq!(sink.paths(), vec!["user.name"]);
    }

    #[test]
    fn test_processor_patterns() {
        let (processor, _) = processor(
            vec![
                ("user.email", FieldMaskConfig::UseProcessorPatterns),
                ("user.notes", FieldMaskConfig::UseProcessorPatterns),
                ("user.age", FieldMaskConfig::UseProcessorPatterns),
            ],
            vec![],
        );
        let mut tree = context();
        processor.mask_field_paths(&mut tree);
        assert_eq!(tree.get_path("user.email"), Some(&Value::from("[EMAIL]")));
        assert_eq!(tree.get_path("user.notes.0"), Some(&Value::from("call [SSN]")));
        assert_eq!(tree.get_path("user.notes.1"), Some(&Value::from("ok")));
        assert_eq!(tree.get_path("user.age"), Some(&Value::from("[ANSWER]")));
    }

    #[test]
    fn test_unchanged_number_stays_number() {
        let (processor, sink) = processor(
            vec![("n", FieldMaskConfig::UseProcessorPatterns)],
            vec![],
        );
        let mut tree = Value::from(serde_json::json!({"n": 7}));
        processor.mask_field_paths(&mut tree);
        assert_eq!(tree.get_path("n"), Some(&Value::Int(7)));
        assert!(sink.is_empty());
    }

    #[test]
    fn test_regex_mask() {
        let (processor, _) = processor(
            vec![("user.name", FieldMaskConfig::regex_mask("/^(\\w)\\w*/", "${1}***"))],
            vec![],
        );
        let mut tree = context();
        processor.mask_field_paths(&mut tree);
        assert_eq!(tree.get_path("user.name"), Some(&Value::from("J***")));
    }

    #[test]
    fn test_callback_overrides_field_path() {
        let (processor, sink) = processor(
            vec![("user.name", FieldMaskConfig::replace("[NAME]"))],
            vec![("user.name", FieldCallback::new(|_| Value::from("from-callback")))],
        );
        let mut tree = context();
        assert!(processor.mask_field_paths(&mut tree).is_empty());
        assert_eq!(processor.apply_custom_callbacks(&mut tree), vec!["user.name"]);
        assert_eq!(tree.get_path("user.name"), Some(&Value::from("from-callback")));
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn test_unmaskable_value_fail_safe() {
        let (processor, sink) = processor(
            vec![("handle", FieldMaskConfig::UseProcessorPatterns)],
            vec![],
        );
        let mut tree = Value::Map(BTreeMap::from([(
            "handle".to_string(),
            Value::resource("stream", 9),
        )]));
        processor.mask_field_paths(&mut tree);
        assert_eq!(tree.get_path("handle"), Some(&Value::resource("stream", 9)));
        assert_eq!(sink.paths(), vec![paths::MASKING_FAILED]);
    }

    #[test]
    fn test_unmaskable_value_fail_closed() {
        let (processor, _) = processor(
            vec![("handle", FieldMaskConfig::UseProcessorPatterns)],
            vec![],
        );
        let processor = processor.with_failure_mode(FailureMode::FailClosed);
        let mut tree = Value::Map(BTreeMap::from([(
            "handle".to_string(),
            Value::resource("stream", 9),
        )]));
        processor.mask_field_paths(&mut tree);
        assert_eq!(tree.get_path("handle"), Some(&Value::from(FAIL_CLOSED_MASK)));
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let (processor, _) = processor(
            vec![],
            vec![("user.name", FieldCallback::new(|_| panic!("boom")))],
        );
        let mut tree = context();
        processor.apply_custom_callbacks(&mut tree);
        assert_eq!(tree.get_path("user.name"), Some(&Value::from("John")));
    }

    #[test]
    fn test_rejects_empty_replacement() {
        let result = ContextProcessor::new(
            chain(),
            BTreeMap::from([("a".to_string(), FieldMaskConfig::replace(""))]),
            BTreeMap::new(),
            &PatternValidator::new(),
        );
        assert!(matches!(result, Err(crate::MaskingError::Configuration(_))));
    }
}
