//! Error handling for the Bazaar cache.
//!
//! This module provides:
//! - A single crate error type with machine-readable codes
//! - User-friendly messages vs detailed internal messages
//! - Severity-driven logging through `tracing`
//! - Metrics integration for error tracking
//!
//! Errors are cheap to clone: sources are held behind an `Arc` so one fetch
//! failure can be handed to every caller that was waiting on the same key.
//!
//! # Usage
//!
//! ```rust,ignore
//! use bazaar_cache::error::{BazaarError, ErrorCode, ErrorContext, Result};
//!
//! fn load_listing() -> Result<Listing> {
//!     read_listing()
//!         .with_error_code(ErrorCode::FetchFailed)?;
//!     Ok(listing)
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for cache operations.
pub type Result<T> = std::result::Result<T, BazaarError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Cache Errors (2100-2199)
    CacheError,
    CacheConnectionFailed,
    DurableTierUnavailable,
    TypeMismatch,
    InvalidTtl,

    // Serialization Errors (2200-2299)
    SerializationError,
    DeserializationError,
    InvalidJson,

    // Invalidation Errors (2300-2399)
    RuleNotFound,
    InvalidPattern,
    SubscriptionFailed,
    CustomActionFailed,

    // Fetch Errors (3000-3099)
    FetchFailed,
    FetchTimeout,
    UpstreamUnavailable,

    // Validation Errors (4100-4199)
    ValidationError,
    InvalidInput,
    MissingRequiredField,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,

    // Internal Errors (9000-9099)
    InternalError,
    TaskFailed,
    UnknownError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::CacheError => 2100,
            Self::CacheConnectionFailed => 2101,
            Self::DurableTierUnavailable => 2102,
            Self::TypeMismatch => 2103,
            Self::InvalidTtl => 2104,

            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,
            Self::InvalidJson => 2202,

            Self::RuleNotFound => 2300,
            Self::InvalidPattern => 2301,
            Self::SubscriptionFailed => 2302,
            Self::CustomActionFailed => 2303,

            Self::FetchFailed => 3000,
            Self::FetchTimeout => 3001,
            Self::UpstreamUnavailable => 3002,

            Self::ValidationError => 4100,
            Self::InvalidInput => 4101,
            Self::MissingRequiredField => 4102,

            Self::ConfigurationError => 5000,
            Self::MissingConfiguration => 5001,
            Self::InvalidConfiguration => 5002,

            Self::InternalError => 9000,
            Self::TaskFailed => 9001,
            Self::UnknownError => 9099,
        }
    }

    /// Check if this error is retryable.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CacheConnectionFailed
                | Self::CacheError
                | Self::DurableTierUnavailable
                | Self::SubscriptionFailed
                | Self::FetchTimeout
                | Self::UpstreamUnavailable
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            2100..=2199 => "cache",
            2200..=2299 => "serialization",
            2300..=2399 => "invalidation",
            3000..=3099 => "fetch",
            4100..=4199 => "validation",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller errors (bad input, unknown rule)
    Low,
    /// Operational issues (timeouts, degraded tiers)
    Medium,
    /// System errors (serialization bugs, failed actions)
    High,
    /// Errors requiring immediate attention
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::ValidationError
            | ErrorCode::InvalidInput
            | ErrorCode::MissingRequiredField
            | ErrorCode::InvalidTtl
            | ErrorCode::InvalidPattern
            | ErrorCode::RuleNotFound
            | ErrorCode::TypeMismatch => Self::Low,

            ErrorCode::DurableTierUnavailable
            | ErrorCode::CacheError
            | ErrorCode::FetchFailed
            | ErrorCode::FetchTimeout
            | ErrorCode::UpstreamUnavailable
            | ErrorCode::SubscriptionFailed => Self::Medium,

            ErrorCode::SerializationError
            | ErrorCode::DeserializationError
            | ErrorCode::InvalidJson
            | ErrorCode::CustomActionFailed
            | ErrorCode::ConfigurationError
            | ErrorCode::MissingConfiguration
            | ErrorCode::InvalidConfiguration
            | ErrorCode::TaskFailed => Self::High,

            ErrorCode::CacheConnectionFailed
            | ErrorCode::InternalError
            | ErrorCode::UnknownError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Cache key the error relates to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Invalidation rule the error relates to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_rule(mut self, rule_id: impl Into<String>) -> Self {
        self.rule_id = Some(rule_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for the Bazaar cache.
#[derive(Error, Debug, Clone)]
pub struct BazaarError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-friendly error message
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for BazaarError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl BazaarError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigurationError, message.into())
    }

    /// A fetcher failed to produce a value.
    pub fn fetch_failed(key: impl Into<String>, reason: impl Into<String>) -> Self {
        let key = key.into();
        Self::with_internal(
            ErrorCode::FetchFailed,
            format!("Failed to fetch value for key: {}", key),
            reason,
        )
        .with_details(ErrorDetails::new().with_key(key))
    }

    /// The value under a key is not of the requested type.
    pub fn type_mismatch(key: impl Into<String>, expected: &'static str) -> Self {
        let key = key.into();
        Self::new(
            ErrorCode::TypeMismatch,
            format!("Cached value for {} is not a {}", key, expected),
        )
        .with_details(ErrorDetails::new().with_key(key))
    }

    /// No rule with this id is registered.
    pub fn rule_not_found(rule_id: impl Into<String>) -> Self {
        let rule_id = rule_id.into();
        Self::new(
            ErrorCode::RuleNotFound,
            format!("Invalidation rule not found: {}", rule_id),
        )
        .with_details(ErrorDetails::new().with_rule(rule_id))
    }

    /// TTL must be strictly positive.
    pub fn invalid_ttl(ttl_ms: u64) -> Self {
        Self::new(
            ErrorCode::InvalidTtl,
            format!("TTL must be greater than zero, got {}ms", ttl_ms),
        )
    }

    /// A change-feed subscription could not be created.
    pub fn subscription_failed(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        let resource = resource.into();
        Self::with_internal(
            ErrorCode::SubscriptionFailed,
            format!("Failed to subscribe to changes on {}", resource),
            reason,
        )
        .with_context("resource", &resource)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Arc::new(source));
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add internal message.
    pub fn with_internal_message(mut self, message: impl Into<String>) -> Self {
        self.internal_message = Some(message.into());
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the user-friendly message.
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Get the internal message (if any).
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Get the error details.
    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Metrics
    // ─────────────────────────────────────────────────────────────────────────

    fn record_metrics(&self) {
        counter!(
            "bazaar_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "retryable" => self.is_retryable().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with error code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| BazaarError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| BazaarError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| BazaarError::new(ErrorCode::InvalidInput, message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| BazaarError::new(code, "Value not present"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<redis::RedisError> for BazaarError {
    fn from(error: redis::RedisError) -> Self {
        let (code, user_msg) = if error.is_connection_refusal() || error.is_connection_dropped() {
            (ErrorCode::CacheConnectionFailed, "Unable to connect to durable tier")
        } else if error.is_timeout() {
            (ErrorCode::DurableTierUnavailable, "Durable tier operation timed out")
        } else {
            (ErrorCode::CacheError, "A durable tier error occurred")
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for BazaarError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() {
            ErrorCode::DeserializationError
        } else if error.is_eof() {
            ErrorCode::InvalidJson
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string()).with_source(error)
    }
}

impl From<regex::Error> for BazaarError {
    fn from(error: regex::Error) -> Self {
        Self::with_internal(ErrorCode::InvalidPattern, "Invalid key pattern", error.to_string())
            .with_source(error)
    }
}

impl From<tokio::task::JoinError> for BazaarError {
    fn from(error: tokio::task::JoinError) -> Self {
        let reason = if error.is_cancelled() { "cancelled" } else { "panicked" };
        Self::with_internal(
            ErrorCode::TaskFailed,
            "Background task did not complete",
            format!("task {}: {}", reason, error),
        )
    }
}

impl From<std::io::Error> for BazaarError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let (code, user_msg) = match error.kind() {
            ErrorKind::TimedOut => (ErrorCode::FetchTimeout, "Operation timed out"),
            ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset => {
                (ErrorCode::UpstreamUnavailable, "Connection failed")
            }
            _ => (ErrorCode::InternalError, "An I/O error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<anyhow::Error> for BazaarError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<BazaarError>() {
            Ok(bazaar_error) => bazaar_error,
            Err(error) => Self::with_internal(
                ErrorCode::InternalError,
                "An internal error occurred",
                error.to_string(),
            ),
        }
    }
}

impl From<config::ConfigError> for BazaarError {
    fn from(error: config::ConfigError) -> Self {
        let (code, user_msg) = match &error {
            config::ConfigError::NotFound(_) => {
                (ErrorCode::MissingConfiguration, "Required configuration not found")
            }
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => {
                (ErrorCode::InvalidConfiguration, "Configuration file is invalid")
            }
            _ => (ErrorCode::ConfigurationError, "Configuration error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_is_retryable() {
        assert!(ErrorCode::DurableTierUnavailable.is_retryable());
        assert!(ErrorCode::CacheConnectionFailed.is_retryable());
        assert!(!ErrorCode::ValidationError.is_retryable());
        assert!(!ErrorCode::RuleNotFound.is_retryable());
    }

    #[test]
    fn test_error_code_category() {
        assert_eq!(ErrorCode::TypeMismatch.category(), "cache");
        assert_eq!(ErrorCode::RuleNotFound.category(), "invalidation");
        assert_eq!(ErrorCode::FetchFailed.category(), "fetch");
        assert_eq!(ErrorCode::InvalidConfiguration.category(), "configuration");
        assert_eq!(ErrorCode::TaskFailed.category(), "internal");
    }

    #[test]
    fn test_rule_not_found() {
        let error = BazaarError::rule_not_found("r-42");
        assert_eq!(error.code(), ErrorCode::RuleNotFound);
        assert_eq!(error.details().rule_id.as_deref(), Some("r-42"));
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_error_context() {
        let error = BazaarError::new(ErrorCode::ValidationError, "Invalid input")
            .with_context("field", "ttl")
            .with_context("reason", "zero");

        assert!(error.details().context.contains_key("field"));
        assert!(error.details().context.contains_key("reason"));
    }

    #[test]
    fn test_clone_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "upstream slow");
        let error = BazaarError::from(io);
        let cloned = error.clone();

        assert_eq!(cloned.code(), ErrorCode::FetchTimeout);
        assert!(std::error::Error::source(&cloned).is_some());
        assert_eq!(error.to_string(), cloned.to_string());
    }

    #[test]
    fn test_from_regex_error() {
        let err = regex::Regex::new("(unclosed").unwrap_err();
        let error = BazaarError::from(err);
        assert_eq!(error.code(), ErrorCode::InvalidPattern);
    }

    #[test]
    fn test_option_context() {
        let missing: Option<u32> = None;
        let error = missing.with_error_code(ErrorCode::MissingRequiredField).unwrap_err();
        assert_eq!(error.code(), ErrorCode::MissingRequiredField);
    }

    #[test]
    fn test_error_severity() {
        assert_eq!(ErrorSeverity::from_code(&ErrorCode::InvalidTtl), ErrorSeverity::Low);
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::DurableTierUnavailable),
            ErrorSeverity::Medium
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::CustomActionFailed),
            ErrorSeverity::High
        );
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::CacheConnectionFailed),
            ErrorSeverity::Critical
        );
    }

    #[test]
    fn test_error_display() {
        let error = BazaarError::with_internal(
            ErrorCode::CacheError,
            "Durable tier write failed",
            "READONLY You can't write against a read only replica",
        );

        let display = format!("{}", error);
        assert!(display.contains("CacheError"));
        assert!(display.contains("Durable tier write failed"));
        assert!(display.contains("READONLY"));
    }
}
