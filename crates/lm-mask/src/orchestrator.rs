//! Per-record masking pipeline.

use crate::audit::{
    emit, paths, RateLimitProfile, RateLimitedAuditLogger, SharedAuditLogger, AUDIT_PREVIEW_CHARS,
};
use crate::config::{FailureMode, MaskingConfig};
use crate::context::ContextProcessor;
use crate::data_type::DataTypeMasker;
use crate::json::JsonMasker;
use crate::pattern::{PatternChain, PatternValidator};
use crate::recursive::RecursiveProcessor;
use crate::rules::{ConditionalRuleEvaluator, SharedRule};
use crate::sanitize::truncate_chars;
use crate::{LogRecord, Result, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Masks log records: gate, message, then context.
///
/// Built once from a validated [`MaskingConfig`] and reused. Per-record
/// failures are contained; [`process`] always returns a record.
///
/// [`process`]: MaskingOrchestrator::process
pub struct MaskingOrchestrator {
    chain: Arc<PatternChain>,
    json: JsonMasker,
    context: ContextProcessor,
    recursive: RecursiveProcessor,
    evaluator: ConditionalRuleEvaluator,
    rules: Vec<(String, SharedRule)>,
    failure_mode: FailureMode,
    audit_rate_limit: Option<RateLimitProfile>,
    audit_logger: Option<SharedAuditLogger>,
}

impl std::fmt::Debug for MaskingOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaskingOrchestrator")
            .field("patterns", &self.chain.len())
            .field("context", &self.context)
            .field("recursive", &self.recursive)
            .field(
                "rules",
                &self.rules.iter().map(|(name, _)| name).collect::<Vec<_>>(),
            )
            .field("failure_mode", &self.failure_mode)
            .field("has_audit_logger", &self.audit_logger.is_some())
            .finish()
    }
}

impl MaskingOrchestrator {
    /// Validate `config` with the shared pattern validator and build the
    /// pipeline.
    pub fn new(config: MaskingConfig) -> Result<Self> {
        Self::with_validator(config, PatternValidator::shared())
    }

    /// Validate `config` with an injected validator and build the pipeline.
    pub fn with_validator(config: MaskingConfig, validator: &PatternValidator) -> Result<Self> {
        config.validate(validator)?;

        let chain = Arc::new(
            PatternChain::compile(validator, config.patterns.iter().map(|(p, r)| (p, r.clone())))?
                .with_max_input_bytes(config.max_input_bytes),
        );
        let context = ContextProcessor::new(
            Arc::clone(&chain),
            config.field_paths,
            config.custom_callbacks,
            validator,
        )?
        .with_failure_mode(config.failure_mode);
        let data_types = DataTypeMasker::new(config.data_type_masks)?;
        let recursive = RecursiveProcessor::new(Arc::clone(&chain), data_types, config.max_depth)?
            .with_failure_mode(config.failure_mode);

        debug!(
            patterns = chain.len(),
            field_paths = context.field_paths().len(),
            rules = config.rules.len(),
            max_depth = config.max_depth,
            failure_mode = %config.failure_mode,
            "Masking orchestrator configured"
        );

        let mut orchestrator = Self {
            chain,
            json: JsonMasker::default()
                .with_max_input_bytes(config.max_input_bytes)
                .with_failure_mode(config.failure_mode),
            context,
            recursive,
            evaluator: ConditionalRuleEvaluator::default(),
            rules: config.rules,
            failure_mode: config.failure_mode,
            audit_rate_limit: config.audit_rate_limit,
            audit_logger: None,
        };
        orchestrator.set_audit_logger(config.audit_logger)?;
        Ok(orchestrator)
    }

    /// Replace the audit logger on every sub-processor. When a rate-limit
    /// profile is configured the logger is wrapped with it.
    pub fn set_audit_logger(&mut self, audit_logger: Option<SharedAuditLogger>) -> Result<()> {
        let audit_logger = match (audit_logger, self.audit_rate_limit) {
            (Some(base), Some(profile)) => {
                let limited: SharedAuditLogger =
                    Arc::new(RateLimitedAuditLogger::new(Some(base), profile)?);
                Some(limited)
            }
            (logger, _) => logger,
        };
        self.json.set_audit_logger(audit_logger.clone());
        self.context.set_audit_logger(audit_logger.clone());
        self.recursive.set_audit_logger(audit_logger.clone());
        self.evaluator.set_audit_logger(audit_logger.clone());
        self.audit_logger = audit_logger;
        Ok(())
    }

    pub fn audit_logger(&self) -> Option<&SharedAuditLogger> {
        self.audit_logger.as_ref()
    }

    pub fn pattern_chain(&self) -> &PatternChain {
        &self.chain
    }

    /// Mask one record, returning `(message, context)`. When a conditional
    /// rule vetoes masking both are returned unchanged.
    pub fn process(&self, record: &LogRecord) -> (String, Value) {
        if !self.evaluator.should_mask(record, &self.rules) {
            return (record.message.clone(), record.context.clone());
        }
        (
            self.mask_message(&record.message),
            self.mask_context(&record.context),
        )
    }

    /// Mask a record in place of the original.
    pub fn process_record(&self, record: LogRecord) -> LogRecord {
        let (message, context) = self.process(&record);
        LogRecord {
            message,
            context,
            ..record
        }
    }

    /// Apply the pattern chain and embedded-JSON masking to a message.
    /// A result of `""` or `"0"` is discarded in favour of the original.
    pub fn mask_message(&self, message: &str) -> String {
        let masked = self.regex_message(message);
        let masked = self
            .json
            .process_message(&masked, |value| self.recursive.recursive_mask(value, 0));

        if masked.is_empty() || masked == "0" {
            debug!("Masking emptied the message, keeping original");
            return message.to_string();
        }
        if masked != message {
            emit(
                self.audit_logger.as_ref(),
                paths::MESSAGE,
                &Value::from(message),
                &Value::from(masked.as_str()),
            );
        }
        masked
    }

    /// Apply the pattern chain to a message. Oversized input follows the
    /// configured failure mode.
    pub fn regex_message(&self, message: &str) -> String {
        match self.chain.apply(message) {
            Ok(masked) => masked,
            Err(e) => {
                debug!(error = %e, "Message pattern chain failed");
                let preview = Value::from(truncate_chars(message, AUDIT_PREVIEW_CHARS));
                match self.failure_mode.resolve(
                    self.audit_logger.as_ref(),
                    paths::PREG_REPLACE_BATCH_ERROR,
                    &preview,
                    &e.to_string(),
                ) {
                    Value::Str(masked) if self.failure_mode == FailureMode::FailClosed => masked,
                    _ => message.to_string(),
                }
            }
        }
    }

    /// Mask a context tree: field paths, then custom callbacks, then the
    /// type-aware walk over every path not yet handled.
    pub fn mask_context(&self, context: &Value) -> Value {
        let mut tree = context.clone();
        let mut processed: HashSet<String> =
            self.context.mask_field_paths(&mut tree).into_iter().collect();
        processed.extend(self.context.apply_custom_callbacks(&mut tree));
        self.recursive.mask_context(&tree, &processed)
    }
}
