//! GDPR masking engine for structured log records.
//!
//! This crate redacts personal and otherwise sensitive data from a log
//! record's message and context tree before the record reaches a sink.
//! Patterns and field paths are supplied by the caller; the engine applies
//! them and reports every change to an audit trail.
//!
//! # Key Features
//!
//! - **Pattern safety**: Every regex is screened for syntax errors,
//!   recursion constructs and nested-quantifier shapes before use.
//! - **Field-path masking**: Remove, replace or pattern-mask values at dotted
//!   paths, with custom callbacks taking precedence.
//! - **Type-aware masking**: Per-type tokens that keep numbers numeric and
//!   booleans boolean.
//! - **Embedded JSON**: JSON documents inside messages are masked without
//!   breaking their syntax.
//! - **Conditional rules**: Named predicates decide whether a record is
//!   masked at all; failing rules abstain instead of vetoing.
//! - **Rate-limited audit**: Audit events can be throttled per operation
//!   class with an observable suppression event.
//!
//! # Example
//!
//! ```
//! use lm_mask::{Level, LogRecord, MaskingConfig, MaskingOrchestrator};
//!
//! let config = MaskingConfig::builder()
//!     .pattern(r"/\d{3}-\d{2}-\d{4}/", "[SSN]")
//!     .build();
//! let orchestrator = MaskingOrchestrator::new(config).unwrap();
//!
//! let record = LogRecord::new("SSN: 123-45-6789", Level::Info);
//! let (message, _context) = orchestrator.process(&record);
//! assert_eq!(message, "SSN: [SSN]");
//! ```

pub mod audit;
pub mod config;
pub mod context;
pub mod data_type;
pub mod defaults;
pub mod error;
pub mod field_mask;
pub mod json;
pub mod orchestrator;
pub mod pattern;
pub mod rate_limit;
pub mod record;
pub mod recursive;
pub mod rules;
pub mod sanitize;
pub mod value;

pub use audit::{
    AuditEvent, AuditLogger, MemoryAuditLogger, OperationBucket, RateLimitProfile,
    RateLimitedAuditLogger, SharedAuditLogger,
};
pub use config::{FailureMode, MaskingConfig, MaskingConfigBuilder, MaskingPolicy, PatternEntry};
pub use context::ContextProcessor;
pub use data_type::{DataTypeMasker, MaskToken};
pub use error::{MaskingError, Result};
pub use field_mask::{FieldCallback, FieldMaskConfig, FieldPathEntry};
pub use json::JsonMasker;
pub use orchestrator::MaskingOrchestrator;
pub use pattern::{PatternChain, PatternValidator};
pub use rate_limit::{Clock, ManualClock, RateLimitStats, RateLimitStore, RateLimiter, SystemClock};
pub use record::{Level, LogRecord};
pub use recursive::RecursiveProcessor;
pub use rules::{ConditionalRule, ConditionalRuleEvaluator, RuleOutcome, SharedRule};
pub use value::{ObjectValue, ResourceHandle, TypeTag, Value};
