//! Masking by runtime type.
//!
//! A [`DataTypeMasker`] maps each [`TypeTag`] to a [`MaskToken`]. Literal
//! tokens are coerced back to the value's own type where that makes sense,
//! so an `integer` mask of `"0"` yields the number zero.

use crate::audit::{emit, SharedAuditLogger};
use crate::{MaskingError, Result, TypeTag, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Lists longer than this are walked in chunks.
pub const CHUNK_THRESHOLD: usize = 1000;
/// Elements per chunk when walking a large list.
pub const CHUNK_SIZE: usize = 500;

/// Walk depth used when none is configured.
pub const DEFAULT_MAX_DEPTH: usize = 100;

/// Per-type replacement instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MaskToken {
    /// Substitute this text, coerced to the value's type where possible.
    Literal(String),
    /// Leave values of this type alone.
    Preserve,
    /// Descend into arrays element-wise. Only valid for `array`.
    Recursive,
}

impl MaskToken {
    pub fn parse(token: &str) -> Self {
        match token {
            "preserve" => MaskToken::Preserve,
            "recursive" => MaskToken::Recursive,
            literal => MaskToken::Literal(literal.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            MaskToken::Literal(s) => s,
            MaskToken::Preserve => "preserve",
            MaskToken::Recursive => "recursive",
        }
    }
}

impl From<String> for MaskToken {
    fn from(token: String) -> Self {
        MaskToken::parse(&token)
    }
}

impl From<&str> for MaskToken {
    fn from(token: &str) -> Self {
        MaskToken::parse(token)
    }
}

impl From<MaskToken> for String {
    fn from(token: MaskToken) -> Self {
        token.as_str().to_string()
    }
}

/// Check a type-mask table: `recursive` is only meaningful for arrays.
pub fn validate_masks(masks: &BTreeMap<TypeTag, MaskToken>) -> Result<()> {
    for (tag, token) in masks {
        if *token == MaskToken::Recursive && *tag != TypeTag::Array {
            return Err(MaskingError::Configuration(format!(
                "mask token 'recursive' is only valid for array, not {}",
                tag
            )));
        }
    }
    Ok(())
}

/// Substitutes configured tokens by runtime type.
#[derive(Clone)]
pub struct DataTypeMasker {
    masks: BTreeMap<TypeTag, MaskToken>,
    max_depth: usize,
    audit_logger: Option<SharedAuditLogger>,
}

impl std::fmt::Debug for DataTypeMasker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataTypeMasker")
            .field("masks", &self.masks)
            .field("max_depth", &self.max_depth)
            .finish()
    }
}

impl Default for DataTypeMasker {
    fn default() -> Self {
        Self {
            masks: BTreeMap::new(),
            max_depth: DEFAULT_MAX_DEPTH,
            audit_logger: None,
        }
    }
}

impl DataTypeMasker {
    pub fn new(masks: BTreeMap<TypeTag, MaskToken>) -> Result<Self> {
        validate_masks(&masks)?;
        Ok(Self {
            masks,
            ..Self::default()
        })
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn set_audit_logger(&mut self, audit_logger: Option<SharedAuditLogger>) {
        self.audit_logger = audit_logger;
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn is_empty(&self) -> bool {
        self.masks.is_empty()
    }

    pub fn mask_for(&self, tag: TypeTag) -> Option<&MaskToken> {
        self.masks.get(&tag)
    }

    /// Mask one value by its type tag. `None` when no mask is configured
    /// for the type, so the caller can fall back to its own handling.
    pub fn apply_masking<F>(&self, value: &Value, mut recurse: F) -> Option<Value>
    where
        F: FnMut(&Value) -> Value,
    {
        let token = self.masks.get(&value.type_tag())?;
        Some(match token {
            MaskToken::Preserve => value.clone(),
            MaskToken::Recursive => recurse(value),
            MaskToken::Literal(literal) => coerce_literal(value, literal),
        })
    }

    /// Walk `tree` below `current_path`, masking leaves by type.
    ///
    /// Paths in `processed` (and everything beneath them) are returned
    /// untouched. Leaves with no configured mask go through `fallback`.
    /// Subtrees deeper than the configured maximum are left as they are.
    pub fn apply_to_context<F>(
        &self,
        tree: &Value,
        processed: &HashSet<String>,
        current_path: &str,
        fallback: &mut F,
    ) -> Value
    where
        F: FnMut(&Value) -> Value,
    {
        let depth = if current_path.is_empty() {
            0
        } else {
            current_path.split('.').count()
        };
        self.walk(tree, processed, current_path, depth, fallback)
    }

    fn walk<F>(
        &self,
        value: &Value,
        processed: &HashSet<String>,
        path: &str,
        depth: usize,
        fallback: &mut F,
    ) -> Value
    where
        F: FnMut(&Value) -> Value,
    {
        if depth > self.max_depth || (!path.is_empty() && processed.contains(path)) {
            return value.clone();
        }

        if value.is_container() {
            // The root context is always walked, never replaced.
            let token = if path.is_empty() {
                None
            } else {
                self.masks.get(&TypeTag::Array)
            };
            let replace_whole = matches!(token, Some(MaskToken::Literal(_)))
                && !has_processed_descendant(processed, path);
            if matches!(token, Some(MaskToken::Preserve)) {
                return value.clone();
            }
            if replace_whole {
                return self.leaf(value, path, fallback);
            }
            return match value {
                Value::List(items) => Value::List(walk_list(items, |i, item| {
                    self.walk(item, processed, &child_path(path, &i.to_string()), depth + 1, fallback)
                })),
                Value::Map(map) => Value::Map(
                    map.iter()
                        .map(|(key, child)| {
                            let masked =
                                self.walk(child, processed, &child_path(path, key), depth + 1, fallback);
                            (key.clone(), masked)
                        })
                        .collect(),
                ),
                other => other.clone(),
            };
        }

        self.leaf(value, path, fallback)
    }

    fn leaf<F>(&self, value: &Value, path: &str, fallback: &mut F) -> Value
    where
        F: FnMut(&Value) -> Value,
    {
        let masked = match self.apply_masking(value, |v| v.clone()) {
            Some(masked) => masked,
            None => fallback(value),
        };
        if masked != *value {
            emit(self.audit_logger.as_ref(), path, value, &masked);
        }
        masked
    }
}

fn child_path(parent: &str, segment: &str) -> String {
    if parent.is_empty() {
        segment.to_string()
    } else {
        format!("{}.{}", parent, segment)
    }
}

fn has_processed_descendant(processed: &HashSet<String>, path: &str) -> bool {
    processed
        .iter()
        .any(|p| p.len() > path.len() && p.starts_with(path) && p.as_bytes()[path.len()] == b'.')
}

/// Map list elements with their index, chunking very long lists.
pub(crate) fn walk_list<F>(items: &[Value], mut f: F) -> Vec<Value>
where
    F: FnMut(usize, &Value) -> Value,
{
    let mut out = Vec::with_capacity(items.len());
    if items.len() > CHUNK_THRESHOLD {
        for (chunk_index, chunk) in items.chunks(CHUNK_SIZE).enumerate() {
            let base = chunk_index * CHUNK_SIZE;
            out.extend(chunk.iter().enumerate().map(|(i, item)| f(base + i, item)));
        }
    } else {
        out.extend(items.iter().enumerate().map(|(i, item)| f(i, item)));
    }
    out
}

fn coerce_literal(value: &Value, literal: &str) -> Value {
    match value {
        Value::Bool(_) => match literal.trim().to_ascii_lowercase().as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::Str(literal.to_string()),
        },
        Value::Int(_) => {
            let trimmed = literal.trim();
            if let Ok(i) = trimmed.parse::<i64>() {
                Value::Int(i)
            } else {
                match trimmed.parse::<f64>() {
                    Ok(f) if f.is_finite() => Value::Int(f.trunc() as i64),
                    _ => Value::Str(literal.to_string()),
                }
            }
        }
        Value::Float(_) => match literal.trim().parse::<f64>() {
            Ok(f) if f.is_finite() => Value::Float(f),
            _ => Value::Str(literal.to_string()),
        },
        Value::Object(obj) => Value::Map(BTreeMap::from([
            ("masked".to_string(), Value::Str(literal.to_string())),
            (
                "original_class".to_string(),
                Value::Str(obj.class_name.clone()),
            ),
        ])),
        Value::Null | Value::Str(_) | Value::List(_) | Value::Map(_) | Value::Resource(_) => {
            Value::Str(literal.to_string())
        }
    }
}
