//! Masking of JSON documents embedded in free-text messages.

use crate::audit::{emit, paths, SharedAuditLogger, AUDIT_PREVIEW_CHARS};
use crate::config::FailureMode;
use crate::pattern::DEFAULT_MAX_INPUT_BYTES;
use crate::sanitize::truncate_chars;
use crate::Value;
use std::collections::HashMap;
use tracing::debug;

/// Finds balanced `{...}` / `[...]` substrings in a message, masks the
/// decoded tree and splices the re-encoded text back in.
///
/// Candidates that do not parse, or whose masked tree is unchanged, keep
/// their original text verbatim. Re-encoded documents keep the key order
/// of the source text. Messages longer than `max_input_bytes` are not
/// scanned and follow the failure mode instead.
#[derive(Clone)]
pub struct JsonMasker {
    audit_logger: Option<SharedAuditLogger>,
    max_input_bytes: usize,
    failure_mode: FailureMode,
}

impl Default for JsonMasker {
    fn default() -> Self {
        Self::new(None)
    }
}

impl std::fmt::Debug for JsonMasker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonMasker")
            .field("max_input_bytes", &self.max_input_bytes)
            .field("failure_mode", &self.failure_mode)
            .field("has_audit_logger", &self.audit_logger.is_some())
            .finish()
    }
}

enum Candidate {
    NotJson,
    Unchanged,
    Replaced(String),
}

impl JsonMasker {
    pub fn new(audit_logger: Option<SharedAuditLogger>) -> Self {
        Self {
            audit_logger,
            max_input_bytes: DEFAULT_MAX_INPUT_BYTES,
            failure_mode: FailureMode::default(),
        }
    }

    /// Largest message, in bytes, that is scanned for JSON.
    pub fn with_max_input_bytes(mut self, max_input_bytes: usize) -> Self {
        self.max_input_bytes = max_input_bytes;
        self
    }

    /// How oversized messages are handled.
    pub fn with_failure_mode(mut self, failure_mode: FailureMode) -> Self {
        self.failure_mode = failure_mode;
        self
    }

    pub fn max_input_bytes(&self) -> usize {
        self.max_input_bytes
    }

    pub fn set_audit_logger(&mut self, audit_logger: Option<SharedAuditLogger>) {
        self.audit_logger = audit_logger;
    }

    /// Mask every embedded JSON container in `message` with `mask_fn`.
    pub fn process_message<F>(&self, message: &str, mut mask_fn: F) -> String
    where
        F: FnMut(&Value) -> Value,
    {
        if message.len() > self.max_input_bytes {
            return self.refuse_oversized(message);
        }

        let bytes = message.as_bytes();
        let mut brackets = BracketIndex::default();
        let mut out = String::with_capacity(message.len());
        let mut copied = 0;
        let mut i = 0;

        while i < bytes.len() {
            if bytes[i] != b'{' && bytes[i] != b'[' {
                i += 1;
                continue;
            }
            let Some(end) = brackets.closing(bytes, i) else {
                i += 1;
                continue;
            };
            // Both ends are ASCII brackets, so slicing stays on char boundaries.
            match self.mask_candidate(&message[i..=end], &mut mask_fn) {
                Candidate::NotJson => i += 1,
                Candidate::Unchanged => i = end + 1,
                Candidate::Replaced(text) => {
                    out.push_str(&message[copied..i]);
                    out.push_str(&text);
                    copied = end + 1;
                    i = end + 1;
                }
            }
        }

        if copied == 0 {
            return message.to_string();
        }
        out.push_str(&message[copied..]);
        out
    }

    fn refuse_oversized(&self, message: &str) -> String {
        debug!(
            bytes = message.len(),
            limit = self.max_input_bytes,
            "Message too large for embedded JSON scan"
        );
        let preview = Value::from(truncate_chars(message, AUDIT_PREVIEW_CHARS));
        let reason = format!(
            "input of {} bytes exceeds the limit of {} bytes",
            message.len(),
            self.max_input_bytes
        );
        match self.failure_mode.resolve(
            self.audit_logger.as_ref(),
            paths::JSON_INPUT_TOO_LARGE,
            &preview,
            &reason,
        ) {
            Value::Str(masked) if self.failure_mode == FailureMode::FailClosed => masked,
            _ => message.to_string(),
        }
    }

    fn mask_candidate<F>(&self, candidate: &str, mask_fn: &mut F) -> Candidate
    where
        F: FnMut(&Value) -> Value,
    {
        let parsed: serde_json::Value = match serde_json::from_str(candidate) {
            Ok(v) => v,
            Err(_) => return Candidate::NotJson,
        };
        if !parsed.is_object() && !parsed.is_array() {
            return Candidate::NotJson;
        }

        let original = Value::from(parsed.clone());
        let masked = mask_fn(&original);
        if masked == original {
            return Candidate::Unchanged;
        }

        let encoded = masked
            .to_json()
            .map(|json| restore_layout(&parsed, json))
            .and_then(|json| serde_json::to_string(&json).map_err(Into::into));
        match encoded {
            Ok(text) => {
                emit(
                    self.audit_logger.as_ref(),
                    paths::JSON_MASKED,
                    &Value::from(candidate),
                    &Value::from(text.as_str()),
                );
                Candidate::Replaced(text)
            }
            Err(e) => {
                debug!(error = %e, "Masked JSON could not be re-encoded, keeping original");
                emit(
                    self.audit_logger.as_ref(),
                    paths::JSON_ENCODE_ERROR,
                    &Value::from(candidate),
                    &Value::from(e.to_string()),
                );
                Candidate::Unchanged
            }
        }
    }
}

/// Closing positions of the openers seen so far in one message.
///
/// A scan started at one opener passes every opener nested inside it in
/// the same string state, so it settles their closing positions too. Each
/// opener is therefore scanned at most once.
#[derive(Debug, Default)]
struct BracketIndex {
    closes: HashMap<usize, Option<usize>>,
}

impl BracketIndex {
    /// Index of the bracket closing the container opened at `start`, or
    /// `None` when unbalanced or mismatched.
    fn closing(&mut self, bytes: &[u8], start: usize) -> Option<usize> {
        if let Some(&known) = self.closes.get(&start) {
            return known;
        }
        self.scan(bytes, start)
    }

    fn scan(&mut self, bytes: &[u8], start: usize) -> Option<usize> {
        let mut stack: Vec<(u8, usize)> = Vec::new();
        let mut in_string = false;
        let mut escaped = false;

        for (offset, &b) in bytes[start..].iter().enumerate() {
            let pos = start + offset;
            if in_string {
                if escaped {
                    escaped = false;
                } else if b == b'\\' {
                    escaped = true;
                } else if b == b'"' {
                    in_string = false;
                }
                continue;
            }
            match b {
                b'"' => in_string = true,
                b'{' => stack.push((b'}', pos)),
                b'[' => stack.push((b']', pos)),
                b'}' | b']' => match stack.pop() {
                    Some((expected, open)) if expected == b => {
                        self.closes.insert(open, Some(pos));
                        if stack.is_empty() {
                            return Some(pos);
                        }
                    }
                    Some((_, open)) => {
                        self.closes.insert(open, None);
                        self.settle_unclosed(stack);
                        return None;
                    }
                    None => return None,
                },
                _ => {}
            }
        }
        self.settle_unclosed(stack);
        None
    }

    fn settle_unclosed(&mut self, stack: Vec<(u8, usize)>) {
        for (_, open) in stack {
            self.closes.insert(open, None);
        }
    }
}

/// Put the masked document back into the shape of the source: keys in
/// their original order, and `[]` rewritten to `{}` wherever the source
/// held an empty object.
fn restore_layout(original: &serde_json::Value, masked: serde_json::Value) -> serde_json::Value {
    use serde_json::Value as J;
    match (original, masked) {
        (J::Object(orig), J::Array(items)) if orig.is_empty() && items.is_empty() => {
            J::Object(serde_json::Map::new())
        }
        (J::Object(orig), J::Object(mut fields)) => {
            let mut ordered = serde_json::Map::with_capacity(fields.len());
            for (key, child) in orig {
                if let Some(value) = fields.remove(key) {
                    ordered.insert(key.clone(), restore_layout(child, value));
                }
            }
            // Keys introduced by masking go last.
            ordered.extend(fields);
            J::Object(ordered)
        }
        (J::Array(orig), J::Array(items)) => J::Array(
            items
                .into_iter()
                .enumerate()
                .map(|(i, item)| match orig.get(i) {
                    Some(child) => restore_layout(child, item),
                    None => item,
                })
                .collect(),
        ),
        (_, masked) => masked,
    }
}
