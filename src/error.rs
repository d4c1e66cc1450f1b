//! Error handling for reconnaissance orchestration
//!
//! Provides structured error types with contextual information for:
//! - Pre-flight failures (invalid targets, missing script catalog, no budget)
//! - Probe failures (tool errors, timeouts) recorded per operation
//! - Result document failures (unreadable or not well-formed)
//! - Upstream failures from the scan-management service
//! - Configuration, IO and HTTP errors

use std::{fmt, io};
use thiserror::Error;

/// Main result type used throughout the application
pub type Result<T> = std::result::Result<T, ScannerError>;

/// Error enum covering every failure the orchestrator can surface
#[derive(Error, Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum ScannerError {
    /// Target string failed syntactic validation
    #[error("Invalid target: {target} - {reason}")]
    InvalidTarget { target: String, reason: String },

    /// Probe-script directory missing or unreadable
    #[error("Script catalog unavailable: {path} - {reason}")]
    CatalogUnavailable { path: String, reason: String },

    /// No time left before any phase could start
    #[error("Budget exhausted: {message}")]
    BudgetExhausted { message: String },

    /// External tool failed to start or exited non-zero
    #[error("Tool error: {operation} - {message}")]
    ToolError { operation: String, message: String },

    /// Timeout errors with contextual information
    #[error("Timeout: {operation} after {duration_secs}s")]
    Timeout {
        operation: String,
        duration_secs: u64,
    },

    /// Result document could not be opened or is not well-formed
    #[error("Malformed document: {source_name} - {message}")]
    MalformedDocument { source_name: String, message: String },

    /// Scan-management service answered with an error
    #[error("Upstream error{}: {message}", status_suffix(.status))]
    Upstream { status: Option<u16>, message: String },

    /// HTTP transport errors
    #[error("HTTP error: {message}")]
    Http { status: Option<u16>, message: String },

    /// Configuration related errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Validation errors for user input
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// File I/O and persistence errors
    #[error("IO error: {operation} - {message}")]
    Io { operation: String, message: String },

    /// Output and reporting errors
    #[error("Output error: {format} - {message}")]
    Output { format: String, message: String },

    /// Generic internal errors with context
    #[error("Internal error: {context} - {message}")]
    Internal { context: String, message: String },
}

impl ScannerError {
    /// Create an invalid target error
    pub fn invalid_target<T: Into<String>, R: Into<String>>(target: T, reason: R) -> Self {
        Self::InvalidTarget {
            target: target.into(),
            reason: reason.into(),
        }
    }

    /// Create a catalog unavailable error
    pub fn catalog_unavailable<P: Into<String>, R: Into<String>>(path: P, reason: R) -> Self {
        Self::CatalogUnavailable {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a budget exhausted error
    pub fn budget_exhausted<S: Into<String>>(message: S) -> Self {
        Self::BudgetExhausted {
            message: message.into(),
        }
    }

    /// Create a tool error
    pub fn tool<O: Into<String>, M: Into<String>>(operation: O, message: M) -> Self {
        Self::ToolError {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<O: Into<String>>(operation: O, duration_secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration_secs,
        }
    }

    /// Create a malformed document error
    pub fn malformed_document<S: Into<String>, M: Into<String>>(source_name: S, message: M) -> Self {
        Self::MalformedDocument {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    /// Create an upstream error
    pub fn upstream<M: Into<String>>(status: Option<u16>, message: M) -> Self {
        Self::Upstream {
            status,
            message: message.into(),
        }
    }

    /// Create an HTTP error
    pub fn http<M: Into<String>>(status: Option<u16>, message: M) -> Self {
        Self::Http {
            status,
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a validation error
    pub fn validation<F: Into<String>, M: Into<String>>(field: F, message: M) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create an IO error
    pub fn io<O: Into<String>, M: Into<String>>(operation: O, message: M) -> Self {
        Self::Io {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create an output error
    pub fn output<F: Into<String>, M: Into<String>>(format: F, message: M) -> Self {
        Self::Output {
            format: format.into(),
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<C: Into<String>, M: Into<String>>(context: C, message: M) -> Self {
        Self::Internal {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Stable code reported to callers for every error category
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidTarget { .. } => "INVALID_TARGET",
            Self::CatalogUnavailable { .. } => "CATALOG_UNAVAILABLE",
            Self::BudgetExhausted { .. } => "BUDGET_EXHAUSTED",
            Self::ToolError { .. } => "TOOL_ERROR",
            Self::Timeout { .. } => "TIMEOUT",
            Self::MalformedDocument { .. } => "MALFORMED_DOCUMENT",
            Self::Upstream { .. } => "UPSTREAM_ERROR",
            Self::Http { .. } => "HTTP_ERROR",
            Self::Configuration { .. } => "CONFIGURATION_ERROR",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Io { .. } => "IO_ERROR",
            Self::Output { .. } => "OUTPUT_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// Errors that abort a whole request instead of being recorded in a report
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidTarget { .. }
                | Self::CatalogUnavailable { .. }
                | Self::BudgetExhausted { .. }
                | Self::Configuration { .. }
                | Self::Internal { .. }
        )
    }

    /// Check if error is recoverable (can be retried)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Http { .. } | Self::ToolError { .. }
        )
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Internal { .. } => ErrorSeverity::Critical,
            Self::CatalogUnavailable { .. } | Self::Configuration { .. } => ErrorSeverity::High,
            Self::BudgetExhausted { .. } | Self::Validation { .. } => ErrorSeverity::High,
            Self::ToolError { .. } | Self::Timeout { .. } | Self::MalformedDocument { .. } => {
                ErrorSeverity::Medium
            }
            Self::Upstream { .. } | Self::Http { .. } | Self::Io { .. } => ErrorSeverity::Medium,
            Self::InvalidTarget { .. } | Self::Output { .. } => ErrorSeverity::Low,
        }
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({})", s)).unwrap_or_default()
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

impl From<io::Error> for ScannerError {
    fn from(error: io::Error) -> Self {
        Self::io("IO operation", error.to_string())
    }
}

impl From<serde_json::Error> for ScannerError {
    fn from(error: serde_json::Error) -> Self {
        Self::output("JSON", error.to_string())
    }
}

impl From<config::ConfigError> for ScannerError {
    fn from(error: config::ConfigError) -> Self {
        Self::config(error.to_string())
    }
}

impl From<reqwest::Error> for ScannerError {
    fn from(error: reqwest::Error) -> Self {
        let status = error.status().map(|s| s.as_u16());
        if error.is_timeout() {
            return Self::timeout("HTTP request", 0);
        }
        Self::http(status, error.to_string())
    }
}

impl From<url::ParseError> for ScannerError {
    fn from(error: url::ParseError) -> Self {
        Self::validation("url", error.to_string())
    }
}

impl From<anyhow::Error> for ScannerError {
    fn from(error: anyhow::Error) -> Self {
        Self::internal("anyhow", error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(ScannerError::invalid_target("x", "bad").is_fatal());
        assert!(ScannerError::catalog_unavailable("/nope", "missing").is_fatal());
        assert!(ScannerError::budget_exhausted("0s").is_fatal());
        assert!(!ScannerError::tool("nmap", "exit 1").is_fatal());
        assert!(!ScannerError::timeout("nmap", 30).is_fatal());
    }

    #[test]
    fn test_codes_are_distinct() {
        let errors = vec![
            ScannerError::invalid_target("t", "r"),
            ScannerError::catalog_unavailable("p", "r"),
            ScannerError::budget_exhausted("m"),
            ScannerError::tool("o", "m"),
            ScannerError::timeout("o", 1),
            ScannerError::malformed_document("s", "m"),
            ScannerError::upstream(Some(500), "m"),
        ];
        let mut codes: Vec<_> = errors.iter().map(|e| e.code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_upstream_display() {
        let error = ScannerError::upstream(Some(401), "Invalid Credentials");
        assert_eq!(error.to_string(), "Upstream error (401): Invalid Credentials");

        let error = ScannerError::upstream(None, "HTTP Error: 502");
        assert_eq!(error.to_string(), "Upstream error: HTTP Error: 502");
    }

    #[test]
    fn test_error_severity() {
        let config_error = ScannerError::config("Invalid setting");
        assert_eq!(config_error.severity(), ErrorSeverity::High);

        let timeout = ScannerError::timeout("script", 30);
        assert_eq!(timeout.severity(), ErrorSeverity::Medium);
        assert!(timeout.is_recoverable());
    }
}
