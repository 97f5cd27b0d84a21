//! Regex pattern parsing, safety validation and chained replacement.
//!
//! Patterns are written in delimited form (`/\d{3}-\d{2}-\d{4}/i`). Before a
//! pattern is accepted it must compile and must not contain constructs that
//! are known to blow up backtracking engines: recursion, oversized code-point
//! escapes, or a quantified group wrapping another quantifier. The `regex`
//! crate itself runs in linear time, but rule sets are shared with other
//! tooling, so the screening is enforced regardless of engine.

use crate::{MaskingError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Default upper bound on text handed to the regex engine (1 MiB).
pub const DEFAULT_MAX_INPUT_BYTES: usize = 1024 * 1024;

/// Validity cache entries kept before the cache is reset.
const MAX_CACHE_ENTRIES: usize = 1024;

// Recursion and subroutine constructs, matched right after "(?".
static RECURSION_GROUP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:R|[+-]?\d+|&\w+|P>\w+)\)").unwrap());

/// A delimited pattern split into body and modifier flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPattern {
    /// Regex body with delimiter escapes removed.
    pub body: String,
    /// Inline flags understood by the `regex` crate.
    pub flags: String,
    /// Matches must start at the beginning of the subject (`A`).
    pub anchored: bool,
}

impl ParsedPattern {
    /// Source string for the `regex` crate, with flags inlined.
    pub fn source(&self) -> String {
        let body = if self.anchored {
            format!(r"\A(?:{})", self.body)
        } else {
            self.body.clone()
        };
        if self.flags.is_empty() {
            body
        } else {
            format!("(?{}){}", self.flags, body)
        }
    }
}

/// Split a delimited pattern into body and flags.
pub fn parse_delimited(pattern: &str) -> std::result::Result<ParsedPattern, String> {
    let mut chars = pattern.chars();
    let open = chars
        .next()
        .ok_or_else(|| "empty pattern".to_string())?;
    if open.is_alphanumeric() || open == '\\' || open.is_whitespace() {
        return Err(format!("delimiter must not be alphanumeric or backslash, got '{}'", open));
    }
    let close = match open {
        '(' => ')',
        '[' => ']',
        '{' => '}',
        '<' => '>',
        other => other,
    };

    let rest = chars.as_str();
    let end = rest
        .rfind(close)
        .ok_or_else(|| format!("no ending delimiter '{}' found", close))?;
    let raw_body = &rest[..end];
    let modifiers = &rest[end + close.len_utf8()..];

    let mut flags = String::new();
    let mut anchored = false;
    for m in modifiers.chars() {
        match m {
            'i' | 'm' | 's' | 'x' | 'U' => {
                if !flags.contains(m) {
                    flags.push(m);
                }
            }
            'A' => anchored = true,
            // No-ops: Unicode is always on and `$` already ignores a
            // trailing newline.
            'u' | 'D' | 'S' | 'X' => {}
            other => return Err(format!("unknown modifier '{}'", other)),
        }
    }

    Ok(ParsedPattern {
        body: unescape_delimiter(raw_body, close),
        flags,
        anchored,
    })
}

fn is_regex_meta(c: char) -> bool {
    matches!(
        c,
        '\\' | '.' | '+' | '*' | '?' | '(' | ')' | '|' | '[' | ']' | '{' | '}' | '^' | '$' | '#'
            | '&' | '-' | '~'
    )
}

/// Turn `\/` back into `/` when the delimiter is not a regex metacharacter.
fn unescape_delimiter(body: &str, delimiter: char) -> String {
    if is_regex_meta(delimiter) {
        return body.to_string();
    }
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(next) if next == delimiter => out.push(next),
                Some(next) => {
                    out.push('\\');
                    out.push(next);
                }
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Compile a delimited pattern without safety screening.
pub fn compile_delimited(pattern: &str) -> Result<Regex> {
    let parsed = parse_delimited(pattern).map_err(|reason| MaskingError::PatternValidation {
        pattern: pattern.to_string(),
        reason,
    })?;
    Regex::new(&parsed.source()).map_err(|e| MaskingError::PatternValidation {
        pattern: pattern.to_string(),
        reason: format!("invalid regex: {}", e),
    })
}

/// Group state tracked while scanning a regex body.
#[derive(Default)]
struct GroupFrame {
    has_inner_quantifier: bool,
}

/// Parse a quantifier starting at `i`. Returns whether it repeats more than
/// a fixed number of times and how many bytes it spans (including a lazy or
/// possessive suffix).
fn parse_quantifier(bytes: &[u8], i: usize) -> Option<(bool, usize)> {
    let (repeats, mut len) = match bytes.get(i)? {
        b'*' | b'+' => (true, 1),
        b'?' => (false, 1),
        b'{' => {
            let mut j = i + 1;
            let min_start = j;
            while j < bytes.len() && bytes[j].is_ascii_digit() {
                j += 1;
            }
            if j == min_start {
                return None;
            }
            let min: u64 = std::str::from_utf8(&bytes[min_start..j]).ok()?.parse().ok()?;
            let repeats = match bytes.get(j)? {
                b'}' => false,
                b',' => {
                    j += 1;
                    let max_start = j;
                    while j < bytes.len() && bytes[j].is_ascii_digit() {
                        j += 1;
                    }
                    if bytes.get(j)? != &b'}' {
                        return None;
                    }
                    if j == max_start {
                        true
                    } else {
                        let max: u64 =
                            std::str::from_utf8(&bytes[max_start..j]).ok()?.parse().ok()?;
                        max > min
                    }
                }
                _ => return None,
            };
            (repeats, j + 1 - i)
        }
        _ => return None,
    };
    if matches!(bytes.get(i + len), Some(b'?') | Some(b'+')) {
        len += 1;
    }
    Some((repeats, len))
}

/// Validate a `\x{..}` style code-point escape starting at the `{`.
/// Returns the number of bytes consumed.
fn check_codepoint_escape(body: &str, brace: usize) -> std::result::Result<usize, String> {
    let rest = &body[brace + 1..];
    let close = rest
        .find('}')
        .ok_or_else(|| "unterminated code point escape".to_string())?;
    let digits = &rest[..close];
    if digits.is_empty() || digits.len() > 8 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!("invalid code point escape '{{{}}}'", digits));
    }
    let value = u32::from_str_radix(digits, 16).map_err(|e| e.to_string())?;
    if value > 0x10FFFF {
        return Err(format!("code point U+{:X} is outside the Unicode range", value));
    }
    Ok(close + 2)
}

/// Skip a character class starting at `[`. Returns the index just past it.
fn skip_class(bytes: &[u8], start: usize) -> usize {
    let mut i = start + 1;
    if bytes.get(i) == Some(&b'^') {
        i += 1;
    }
    // A leading ']' is literal.
    if bytes.get(i) == Some(&b']') {
        i += 1;
    }
    let mut depth = 1usize;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'[' => {
                depth += 1;
                i += 1;
            }
            b']' => {
                depth -= 1;
                i += 1;
                if depth == 0 {
                    return i;
                }
            }
            _ => i += 1,
        }
    }
    bytes.len()
}

/// Structural screening of a regex body for dangerous constructs.
fn scan_body(body: &str) -> std::result::Result<(), String> {
    let bytes = body.as_bytes();
    let mut stack: Vec<GroupFrame> = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                match bytes.get(i + 1) {
                    Some(b'x') | Some(b'u') | Some(b'U') if bytes.get(i + 2) == Some(&b'{') => {
                        i += 2 + check_codepoint_escape(body, i + 2)?;
                    }
                    Some(b'g') if matches!(bytes.get(i + 2), Some(b'<') | Some(b'\'')) => {
                        return Err("subroutine call is not allowed".to_string());
                    }
                    _ => i += 2,
                }
                continue;
            }
            b'[' => {
                i = skip_class(bytes, i);
                continue;
            }
            b'(' => {
                i += 1;
                if bytes.get(i) == Some(&b'?') {
                    if RECURSION_GROUP.is_match(&body[i + 1..]) {
                        return Err("recursive pattern construct is not allowed".to_string());
                    }
                    i += 1;
                    if bytes.get(i) == Some(&b'P') {
                        i += 1;
                    }
                    if bytes.get(i) == Some(&b'<') {
                        while i < bytes.len() && bytes[i] != b'>' {
                            i += 1;
                        }
                        i += 1;
                    } else {
                        while i < bytes.len() && (bytes[i].is_ascii_alphabetic() || bytes[i] == b'-')
                        {
                            i += 1;
                        }
                        if bytes.get(i) == Some(&b':') {
                            i += 1;
                        }
                    }
                }
                stack.push(GroupFrame::default());
                continue;
            }
            b')' => {
                let frame = stack.pop().unwrap_or_default();
                i += 1;
                let mut quantified = false;
                if let Some((repeats, len)) = parse_quantifier(bytes, i) {
                    if repeats && frame.has_inner_quantifier {
                        return Err(
                            "nested quantifier (quantified group containing a quantifier)"
                                .to_string(),
                        );
                    }
                    quantified = repeats;
                    i += len;
                }
                if let Some(parent) = stack.last_mut() {
                    parent.has_inner_quantifier |= frame.has_inner_quantifier || quantified;
                }
                continue;
            }
            b'*' | b'+' | b'?' | b'{' => {
                if let Some((repeats, len)) = parse_quantifier(bytes, i) {
                    if repeats {
                        if let Some(top) = stack.last_mut() {
                            top.has_inner_quantifier = true;
                        }
                    }
                    i += len;
                    continue;
                }
            }
            _ => {}
        }
        i += 1;
    }
    Ok(())
}

/// Full diagnosis of a pattern: `Ok` when it is safe to use.
fn diagnose(pattern: &str) -> std::result::Result<(), String> {
    let parsed = parse_delimited(pattern)?;
    scan_body(&parsed.body)?;
    Regex::new(&parsed.source()).map_err(|e| format!("invalid regex: {}", e))?;
    Ok(())
}

static SHARED_VALIDATOR: Lazy<PatternValidator> = Lazy::new(PatternValidator::new);

/// Validates patterns and caches the verdict per exact pattern string.
#[derive(Debug, Default)]
pub struct PatternValidator {
    /// pattern -> rejection reason (`None` when valid)
    cache: Mutex<HashMap<String, Option<String>>>,
}

impl PatternValidator {
    /// Create a validator with an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide validator for callers that do not inject their own.
    pub fn shared() -> &'static PatternValidator {
        &SHARED_VALIDATOR
    }

    /// Check a pattern, returning the rejection reason on failure.
    pub fn check(&self, pattern: &str) -> std::result::Result<(), String> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(verdict) = cache.get(pattern) {
            return match verdict {
                None => Ok(()),
                Some(reason) => Err(reason.clone()),
            };
        }

        let verdict = diagnose(pattern).err();
        if cache.len() >= MAX_CACHE_ENTRIES {
            debug!(entries = cache.len(), "Pattern cache full, resetting");
            cache.clear();
        }
        cache.insert(pattern.to_string(), verdict.clone());
        match verdict {
            None => Ok(()),
            Some(reason) => Err(reason),
        }
    }

    /// Whether a pattern is syntactically valid and safe.
    pub fn is_valid(&self, pattern: &str) -> bool {
        self.check(pattern).is_ok()
    }

    /// Validate every pattern, failing on the first rejected one.
    pub fn validate_all<I, S>(&self, patterns: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for pattern in patterns {
            let pattern = pattern.as_ref();
            if let Err(reason) = self.check(pattern) {
                warn!(pattern, reason = %reason, "Rejected masking pattern");
                return Err(MaskingError::PatternValidation {
                    pattern: pattern.to_string(),
                    reason,
                });
            }
        }
        Ok(())
    }

    /// Drop all cached verdicts.
    pub fn clear_cache(&self) {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Number of cached verdicts.
    pub fn cache_len(&self) -> usize {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// A compiled pattern with its replacement.
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    source: String,
    regex: Regex,
    replacement: String,
}

impl CompiledPattern {
    /// Validate and compile a delimited pattern.
    pub fn new(
        validator: &PatternValidator,
        pattern: &str,
        replacement: impl Into<String>,
    ) -> Result<Self> {
        validator.validate_all([pattern])?;
        Ok(Self {
            source: pattern.to_string(),
            regex: compile_delimited(pattern)?,
            replacement: replacement.into(),
        })
    }

    /// The delimited source pattern.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Replacement text; `$1` and `${name}` refer to capture groups.
    pub fn replacement(&self) -> &str {
        &self.replacement
    }

    /// Replace all matches. Borrows the input when nothing matched.
    pub fn replace<'t>(&self, text: &'t str) -> Cow<'t, str> {
        self.regex.replace_all(text, self.replacement.as_str())
    }

    /// Whether the pattern matches anywhere in `text`.
    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

/// Ordered list of patterns applied in sequence, each consuming the
/// previous stage's output.
#[derive(Debug, Clone)]
pub struct PatternChain {
    patterns: Vec<CompiledPattern>,
    max_input_bytes: usize,
}

impl Default for PatternChain {
    fn default() -> Self {
        Self::empty()
    }
}

impl PatternChain {
    /// A chain with no patterns.
    pub fn empty() -> Self {
        Self {
            patterns: Vec::new(),
            max_input_bytes: DEFAULT_MAX_INPUT_BYTES,
        }
    }

    /// Validate and compile `(pattern, replacement)` entries in order.
    pub fn compile<I, P, R>(validator: &PatternValidator, entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (P, R)>,
        P: AsRef<str>,
        R: Into<String>,
    {
        let patterns = entries
            .into_iter()
            .map(|(p, r)| CompiledPattern::new(validator, p.as_ref(), r))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            patterns,
            max_input_bytes: DEFAULT_MAX_INPUT_BYTES,
        })
    }

    /// Set the maximum input length handed to the regex engine.
    pub fn with_max_input_bytes(mut self, max_input_bytes: usize) -> Self {
        self.max_input_bytes = max_input_bytes;
        self
    }

    /// Number of patterns in the chain.
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// The compiled patterns, in application order.
    pub fn patterns(&self) -> &[CompiledPattern] {
        &self.patterns
    }

    /// Longest input, in bytes, that [`apply`](Self::apply) accepts.
    pub fn max_input_bytes(&self) -> usize {
        self.max_input_bytes
    }

    /// Apply every pattern in order. Fails when the input exceeds the
    /// configured length bound.
    pub fn apply(&self, text: &str) -> Result<String> {
        if text.len() > self.max_input_bytes {
            return Err(MaskingError::operation_failed(format!(
                "input of {} bytes exceeds regex bound of {} bytes",
                text.len(),
                self.max_input_bytes
            )));
        }
        let mut current: Cow<'_, str> = Cow::Borrowed(text);
        for pattern in &self.patterns {
            let next = match pattern.replace(&current) {
                Cow::Owned(s) => Some(s),
                Cow::Borrowed(_) => None,
            };
            if let Some(s) = next {
                current = Cow::Owned(s);
            }
        }
        Ok(current.into_owned())
    }
}
