//! Depth-bounded pattern masking of whole value trees.

use crate::audit::{paths, SharedAuditLogger};
use crate::config::FailureMode;
use crate::data_type::{walk_list, DataTypeMasker};
use crate::pattern::PatternChain;
use crate::{MaskingError, Result, Value};
use std::collections::HashSet;
use std::sync::Arc;

/// Largest accepted `max_depth`.
pub const MAX_DEPTH_LIMIT: usize = 1000;

/// Runs the pattern chain over every string in a tree, delegating typed
/// leaves to a [`DataTypeMasker`].
pub struct RecursiveProcessor {
    chain: Arc<PatternChain>,
    data_types: DataTypeMasker,
    max_depth: usize,
    failure_mode: FailureMode,
    audit_logger: Option<SharedAuditLogger>,
}

impl std::fmt::Debug for RecursiveProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecursiveProcessor")
            .field("patterns", &self.chain.len())
            .field("data_types", &self.data_types)
            .field("max_depth", &self.max_depth)
            .field("failure_mode", &self.failure_mode)
            .finish()
    }
}

impl RecursiveProcessor {
    pub fn new(chain: Arc<PatternChain>, data_types: DataTypeMasker, max_depth: usize) -> Result<Self> {
        if !(1..=MAX_DEPTH_LIMIT).contains(&max_depth) {
            return Err(MaskingError::Configuration(format!(
                "max_depth must be between 1 and {}, got {}",
                MAX_DEPTH_LIMIT, max_depth
            )));
        }
        Ok(Self {
            chain,
            data_types: data_types.with_max_depth(max_depth),
            max_depth,
            failure_mode: FailureMode::default(),
            audit_logger: None,
        })
    }

    pub fn with_failure_mode(mut self, failure_mode: FailureMode) -> Self {
        self.failure_mode = failure_mode;
        self
    }

    pub fn set_audit_logger(&mut self, audit_logger: Option<SharedAuditLogger>) {
        self.data_types.set_audit_logger(audit_logger.clone());
        self.audit_logger = audit_logger;
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn data_types(&self) -> &DataTypeMasker {
        &self.data_types
    }

    /// Mask `value` found at `depth`. Subtrees past the depth bound come
    /// back unchanged.
    pub fn recursive_mask(&self, value: &Value, depth: usize) -> Value {
        if depth > self.max_depth {
            return value.clone();
        }
        match value {
            Value::Str(_) => self.mask_scalar(value),
            Value::List(items) => {
                Value::List(walk_list(items, |_, item| self.recursive_mask(item, depth + 1)))
            }
            Value::Map(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.recursive_mask(v, depth + 1)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Type-mask and pattern-mask a context tree, skipping finalized paths.
    pub fn mask_context(&self, tree: &Value, processed: &HashSet<String>) -> Value {
        self.data_types
            .apply_to_context(tree, processed, "", &mut |leaf: &Value| self.mask_scalar(leaf))
    }

    /// Run the chain over a string leaf. Other leaves are returned as is.
    fn mask_scalar(&self, value: &Value) -> Value {
        let Value::Str(text) = value else {
            return value.clone();
        };
        match self.chain.apply(text) {
            Ok(masked) if masked != *text => Value::Str(masked),
            Ok(_) => value.clone(),
            Err(e) => self.failure_mode.resolve(
                self.audit_logger.as_ref(),
                paths::PREG_REPLACE_ERROR,
                value,
                &e.to_string(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_type::MaskToken;
    use crate::pattern::PatternValidator;
    use crate::TypeTag;
    use std::collections::BTreeMap;

    fn chain() -> Arc<PatternChain> {
        Arc::new(
            PatternChain::compile(&PatternValidator::new(), [(r"/secret/", "[X]")]).unwrap(),
        )
    }

    fn nested(depth: usize) -> Value {
        (0..depth).fold(Value::from("secret"), |inner, _| {
            Value::Map(BTreeMap::from([("n".to_string(), inner)]))
        })
    }

    #[test]
    fn test_rejects_bad_depth() {
        assert!(RecursiveProcessor::new(chain(), DataTypeMasker::default(), 0).is_err());
        assert!(RecursiveProcessor::new(chain(), DataTypeMasker::default(), 1001).is_err());
        assert!(RecursiveProcessor::new(chain(), DataTypeMasker::default(), 1000).is_ok());
    }

    #[test]
    fn test_masks_strings_only() {
        let p = RecursiveProcessor::new(chain(), DataTypeMasker::default(), 10).unwrap();
        let value = Value::from(serde_json::json!({"a": "my secret", "b": [1, "secret"], "c": true}));
        let out = p.recursive_mask(&value, 0);
        assert_eq!(out.get_path("a"), Some(&Value::from("my [X]")));
        assert_eq!(out.get_path("b.0"), Some(&Value::Int(1)));
        assert_eq!(out.get_path("b.1"), Some(&Value::from("[X]")));
        assert_eq!(out.get_path("c"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_depth_bound_leaves_subtree() {
        let p = RecursiveProcessor::new(chain(), DataTypeMasker::default(), 3).unwrap();
        // Leaf sits at depth 3: masked.
        let out = p.recursive_mask(&nested(3), 0);
        assert_eq!(out.get_path("n.n.n"), Some(&Value::from("[X]")));
        // Leaf sits at depth 4: untouched.
        let deep = nested(4);
        assert_eq!(p.recursive_mask(&deep, 0), deep);
    }

    #[test]
    fn test_mask_context_combines_types_and_patterns() {
        let types = DataTypeMasker::new(BTreeMap::from([(
            TypeTag::Integer,
            MaskToken::parse("0"),
        )]))
        .unwrap();
        let p = RecursiveProcessor::new(chain(), types, 10).unwrap();
        let tree = Value::from(serde_json::json!({"age": 25, "note": "secret", "done": "x"}));
        let processed = HashSet::from(["done".to_string()]);
        let out = p.mask_context(&tree, &processed);
        assert_eq!(out.get_path("age"), Some(&Value::Int(0)));
        assert_eq!(out.get_path("note"), Some(&Value::from("[X]")));
        assert_eq!(out.get_path("done"), Some(&Value::from("x")));
    }

    #[test]
    fn test_oversized_string_follows_failure_mode() {
        let bounded = Arc::new((*chain()).clone().with_max_input_bytes(4));
        let p = RecursiveProcessor::new(bounded, DataTypeMasker::default(), 10)
            .unwrap()
            .with_failure_mode(FailureMode::FailClosed);
        assert_eq!(
            p.recursive_mask(&Value::from("secret"), 0),
            Value::from(crate::config::FAIL_CLOSED_MASK)
        );
    }

    #[test]
    fn test_large_list() {
        let p = RecursiveProcessor::new(chain(), DataTypeMasker::default(), 10).unwrap();
        let items: Vec<Value> = (0..1_500).map(|_| Value::from("secret")).collect();
        let out = p.recursive_mask(&Value::List(items), 0);
        match out {
            Value::List(items) => {
                assert_eq!(items.len(), 1_500);
                assert!(items.iter().all(|v| *v == Value::from("[X]")));
            }
            other => panic!("expected list, got {:?}", other),
        }
    }
}
