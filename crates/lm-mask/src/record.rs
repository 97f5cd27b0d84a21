//! Log record tuple handed to the engine by a logging adapter.

use crate::Value;
use serde::{Deserialize, Serialize};

/// Log severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
    Alert,
    Emergency,
}

impl Level {
    /// Numeric severity (syslog-style, multiples of 50/100).
    pub fn ordinal(&self) -> u16 {
        match self {
            Level::Debug => 100,
            Level::Info => 200,
            Level::Notice => 250,
            Level::Warning => 300,
            Level::Error => 400,
            Level::Critical => 500,
            Level::Alert => 550,
            Level::Emergency => 600,
        }
    }

    /// Parse from a name (case-insensitive) or an ordinal string.
    pub fn parse_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "debug" | "100" => Some(Level::Debug),
            "info" | "200" => Some(Level::Info),
            "notice" | "250" => Some(Level::Notice),
            "warning" | "warn" | "300" => Some(Level::Warning),
            "error" | "400" => Some(Level::Error),
            "critical" | "500" => Some(Level::Critical),
            "alert" | "550" => Some(Level::Alert),
            "emergency" | "600" => Some(Level::Emergency),
            _ => None,
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Notice => "notice",
            Level::Warning => "warning",
            Level::Error => "error",
            Level::Critical => "critical",
            Level::Alert => "alert",
            Level::Emergency => "emergency",
        };
        write!(f, "{}", s)
    }
}

/// The `(message, context, level, channel)` tuple processed per record.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub message: String,
    pub context: Value,
    pub level: Level,
    pub channel: String,
}

impl LogRecord {
    /// Create a record with an empty context on the `app` channel.
    pub fn new(message: impl Into<String>, level: Level) -> Self {
        Self {
            message: message.into(),
            context: Value::Map(Default::default()),
            level,
            channel: "app".to_string(),
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Debug < Level::Info);
        assert!(Level::Error < Level::Emergency);
        assert_eq!(Level::Warning.ordinal(), 300);
    }

    #[test]
    fn test_level_parsing() {
        assert_eq!(Level::parse_str("ERROR"), Some(Level::Error));
        assert_eq!(Level::parse_str("warn"), Some(Level::Warning));
        assert_eq!(Level::parse_str("400"), Some(Level::Error));
        assert_eq!(Level::parse_str("loud"), None);
    }

    #[test]
    fn test_record_builder() {
        let record = LogRecord::new("hello", Level::Info).with_channel("billing");
        assert_eq!(record.channel, "billing");
        assert_eq!(record.context, Value::Map(Default::default()));
    }
}
