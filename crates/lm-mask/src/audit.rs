//! Audit trail of masking decisions.
//!
//! Every value change, and a handful of diagnostic conditions, is reported
//! to a caller-supplied [`AuditLogger`]. Audit logging is best-effort: a
//! panicking logger is isolated and the event is dropped.

use crate::rate_limit::{RateLimitStats, RateLimitStore, RateLimiter};
use crate::{Result, Value};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Reserved synthetic audit paths.
pub mod paths {
    /// A conditional rule vetoed masking of the record.
    pub const CONDITIONAL_SKIP: &str = "conditional_skip";
    /// A conditional rule failed and was ignored.
    pub const CONDITIONAL_ERROR: &str = "conditional_error";
    /// An embedded JSON document was rewritten.
    pub const JSON_MASKED: &str = "json_masked";
    /// A masked JSON document could not be re-encoded.
    pub const JSON_ENCODE_ERROR: &str = "json_encode_error";
    /// A message too large to scan for embedded JSON.
    pub const JSON_INPUT_TOO_LARGE: &str = "json_input_too_large";
    /// A single pattern could not be applied to a value.
    pub const PREG_REPLACE_ERROR: &str = "preg_replace_error";
    /// The message pattern chain could not be applied.
    pub const PREG_REPLACE_BATCH_ERROR: &str = "preg_replace_batch_error";
    /// Audit events of a bucket are being dropped.
    pub const RATE_LIMIT_EXCEEDED: &str = "rate_limit_exceeded";
    /// A value could not be masked.
    pub const MASKING_FAILED: &str = "masking_failed";
    /// The record message itself changed.
    pub const MESSAGE: &str = "message";
}

/// Characters of an oversized input kept in its audit event.
pub(crate) const AUDIT_PREVIEW_CHARS: usize = 200;

/// One audited masking decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEvent {
    /// Dotted context path, or one of the reserved [`paths`].
    pub path: String,
    /// Value before masking (or the subject of a synthetic event).
    pub original: Value,
    /// Value after masking, or a diagnostic message.
    pub masked: Value,
    /// Unix seconds, set by loggers that stamp events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl AuditEvent {
    /// Unstamped event.
    pub fn new(path: impl Into<String>, original: Value, masked: Value) -> Self {
        Self {
            path: path.into(),
            original,
            masked,
            timestamp: None,
        }
    }

    /// Stamp the event with the current unix time.
    pub fn stamped(mut self) -> Self {
        self.timestamp = Some(Utc::now().timestamp());
        self
    }
}

/// Receiver of audit events.
pub trait AuditLogger: Send + Sync {
    fn log(&self, path: &str, original: &Value, masked: &Value);
}

impl<F> AuditLogger for F
where
    F: Fn(&str, &Value, &Value) + Send + Sync,
{
    fn log(&self, path: &str, original: &Value, masked: &Value) {
        self(path, original, masked)
    }
}

/// Audit logger shared between the orchestrator and its sub-processors.
pub type SharedAuditLogger = Arc<dyn AuditLogger>;

/// Forward an event, discarding any panic raised by the logger.
pub(crate) fn emit(logger: Option<&SharedAuditLogger>, path: &str, original: &Value, masked: &Value) {
    let Some(logger) = logger else {
        return;
    };
    if catch_unwind(AssertUnwindSafe(|| logger.log(path, original, masked))).is_err() {
        debug!(path, "Audit logger panicked, event discarded");
    }
}

/// Logger that keeps events in memory. Useful for tests and for callers
/// that batch events themselves.
#[derive(Debug, Default)]
pub struct MemoryAuditLogger {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the recorded events, oldest first.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Paths of all recorded events, in order.
    pub fn paths(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|e| e.path.clone())
            .collect()
    }

    /// Recorded events at `path`.
    pub fn events_for(&self, path: &str) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.path == path)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget all recorded events.
    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl AuditLogger for MemoryAuditLogger {
    fn log(&self, path: &str, original: &Value, masked: &Value) {
        let event = AuditEvent::new(path, original.clone(), masked.clone()).stamped();
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

/// Named rate-limit presets for audit logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitProfile {
    /// 50 events per minute per bucket.
    Strict,
    /// 100 events per minute per bucket.
    #[default]
    Default,
    /// 200 events per minute per bucket.
    Relaxed,
    /// 1000 events per minute per bucket.
    Testing,
}

impl RateLimitProfile {
    /// Events admitted per bucket and window.
    pub fn max_requests(&self) -> usize {
        match self {
            RateLimitProfile::Strict => 50,
            RateLimitProfile::Default => 100,
            RateLimitProfile::Relaxed => 200,
            RateLimitProfile::Testing => 1000,
        }
    }

    /// Window length in seconds.
    pub fn window_secs(&self) -> i64 {
        60
    }

    /// Parse a profile name such as `strict`.
    pub fn parse_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "strict" => Some(RateLimitProfile::Strict),
            "default" => Some(RateLimitProfile::Default),
            "relaxed" => Some(RateLimitProfile::Relaxed),
            "testing" => Some(RateLimitProfile::Testing),
            _ => None,
        }
    }
}

impl std::fmt::Display for RateLimitProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RateLimitProfile::Strict => "strict",
            RateLimitProfile::Default => "default",
            RateLimitProfile::Relaxed => "relaxed",
            RateLimitProfile::Testing => "testing",
        };
        write!(f, "{}", s)
    }
}

/// Operation class an audit path belongs to. Each class is limited
/// independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationBucket {
    Json,
    Conditional,
    Regex,
    General,
}

impl OperationBucket {
    /// Every bucket, in declaration order.
    pub const ALL: [OperationBucket; 4] = [
        OperationBucket::Json,
        OperationBucket::Conditional,
        OperationBucket::Regex,
        OperationBucket::General,
    ];

    /// Classify an audit path by substring.
    pub fn classify(path: &str) -> Self {
        if path.contains("json_") {
            OperationBucket::Json
        } else if path.contains("conditional_") {
            OperationBucket::Conditional
        } else if path.contains("regex_") || path.contains("preg_") {
            OperationBucket::Regex
        } else {
            OperationBucket::General
        }
    }

    /// Bucket name reported in suppression events.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationBucket::Json => "json_operations",
            OperationBucket::Conditional => "conditional_operations",
            OperationBucket::Regex => "regex_operations",
            OperationBucket::General => "general_operations",
        }
    }

    fn key(&self) -> &'static str {
        match self {
            OperationBucket::Json => "audit:json_operations",
            OperationBucket::Conditional => "audit:conditional_operations",
            OperationBucket::Regex => "audit:regex_operations",
            OperationBucket::General => "audit:general_operations",
        }
    }
}

/// Wraps an audit logger with per-bucket sliding-window limits.
///
/// Over-limit events are dropped. The first drop in a violation window is
/// replaced by a single `rate_limit_exceeded` event; the window ends when
/// the bucket admits an event again.
pub struct RateLimitedAuditLogger {
    base: Option<SharedAuditLogger>,
    limiters: BTreeMap<OperationBucket, RateLimiter>,
    suppressing: Mutex<HashSet<OperationBucket>>,
    max_requests: usize,
    window_secs: i64,
}

impl std::fmt::Debug for RateLimitedAuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitedAuditLogger")
            .field("has_base", &self.base.is_some())
            .field("max_requests", &self.max_requests)
            .field("window_secs", &self.window_secs)
            .finish()
    }
}

impl RateLimitedAuditLogger {
    /// Wrap `base` using a named preset and a private store.
    pub fn new(base: Option<SharedAuditLogger>, profile: RateLimitProfile) -> Result<Self> {
        Self::with_store(base, profile, Arc::new(RateLimitStore::new()))
    }

    /// Wrap `base` using a named preset over an existing store.
    pub fn with_store(
        base: Option<SharedAuditLogger>,
        profile: RateLimitProfile,
        store: Arc<RateLimitStore>,
    ) -> Result<Self> {
        Self::with_limits(base, profile.max_requests(), profile.window_secs(), store)
    }

    /// Wrap `base` with explicit limits.
    pub fn with_limits(
        base: Option<SharedAuditLogger>,
        max_requests: usize,
        window_secs: i64,
        store: Arc<RateLimitStore>,
    ) -> Result<Self> {
        let limiters = OperationBucket::ALL
            .iter()
            .map(|&bucket| {
                RateLimiter::with_store(max_requests, window_secs, Arc::clone(&store))
                    .map(|limiter| (bucket, limiter))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(Self {
            base,
            limiters,
            suppressing: Mutex::new(HashSet::new()),
            max_requests,
            window_secs,
        })
    }

    fn limiter(&self, bucket: OperationBucket) -> Option<&RateLimiter> {
        self.limiters.get(&bucket)
    }

    /// Whether the bucket would admit another event right now.
    pub fn is_operation_allowed(&self, bucket: OperationBucket) -> bool {
        self.limiter(bucket)
            .and_then(|l| l.remaining_requests(bucket.key()).ok())
            .is_some_and(|remaining| remaining > 0)
    }

    /// Per-bucket limiter state.
    pub fn rate_limit_stats(&self) -> BTreeMap<OperationBucket, RateLimitStats> {
        self.limiters
            .iter()
            .filter_map(|(bucket, limiter)| {
                limiter.stats(bucket.key()).ok().map(|stats| (*bucket, stats))
            })
            .collect()
    }

    /// Forget all recorded events and any ongoing suppression.
    pub fn clear_rate_limit_data(&self) {
        for (bucket, limiter) in &self.limiters {
            let _ = limiter.clear_key(bucket.key());
        }
        self.suppressing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl AuditLogger for RateLimitedAuditLogger {
    fn log(&self, path: &str, original: &Value, masked: &Value) {
        let bucket = OperationBucket::classify(path);
        // The admission check and the suppression state change together.
        let mut suppressing = self.suppressing.lock().unwrap_or_else(|e| e.into_inner());
        let allowed = match self.limiter(bucket).map(|l| l.is_allowed(bucket.key())) {
            Some(Ok(allowed)) => allowed,
            Some(Err(e)) => {
                debug!(error = %e, "Rate limiter rejected audit key, forwarding event");
                true
            }
            None => true,
        };

        if allowed {
            suppressing.remove(&bucket);
            drop(suppressing);
            emit(self.base.as_ref(), path, original, masked);
            return;
        }

        if suppressing.insert(bucket) {
            drop(suppressing);
            warn!(
                bucket = bucket.as_str(),
                max_requests = self.max_requests,
                window_secs = self.window_secs,
                "Audit logging rate limit exceeded"
            );
            let note = Value::from(format!(
                "Audit logging rate limit exceeded for {} ({} per {}s)",
                bucket.as_str(),
                self.max_requests,
                self.window_secs
            ));
            emit(
                self.base.as_ref(),
                paths::RATE_LIMIT_EXCEEDED,
                &Value::from(bucket.as_str()),
                &note,
            );
        }
    }
}
