//! Error types for the policy engine.
//!
//! Only schema and configuration errors are expected to cross the evaluator
//! boundary. Rule failures are converted into denials inside the evaluator and
//! never reach the caller as an `Err`.

use thiserror::Error;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the policy engine.
#[derive(Error, Debug)]
pub enum Error {
    /// Input record did not match the context schema
    #[error("Schema validation error: {message}")]
    SchemaValidation {
        /// Detailed error message
        message: String,
        /// Field that caused the error, if applicable
        field: Option<String>,
    },

    /// A rule body returned an error or panicked
    #[error("Rule '{rule}' failed: {message}")]
    RuleEvaluation {
        /// Name of the failing rule
        rule: String,
        /// Detailed error message
        message: String,
    },

    /// An audit event was emitted after `policy.end`
    #[error("Audit trail for evaluation {evaluation_id} is closed")]
    AuditClosed {
        /// The evaluation whose trail was closed
        evaluation_id: String,
    },

    /// An audit event failed structural validation
    #[error("Invalid audit event: {message}")]
    InvalidAuditEvent {
        /// Detailed error message
        message: String,
    },

    /// Rate limit configuration rejected at construction
    #[error("Invalid rate limit config: {message}")]
    InvalidRateLimitConfig {
        /// Detailed error message
        message: String,
        /// Config field that caused the error
        field: Option<String>,
    },

    /// Storage adapter failure
    #[error("Storage error: {message}")]
    Storage {
        /// Detailed error message
        message: String,
        /// Key involved in the failed operation
        key: Option<String>,
    },

    /// The adapter or component does not implement an optional operation
    #[error("Unsupported operation: {operation}")]
    Unsupported {
        /// Name of the missing operation
        operation: String,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        /// Detailed error message
        message: String,
        /// Configuration key that caused the error
        key: Option<String>,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a schema validation error.
    pub fn schema(message: impl Into<String>) -> Self {
        Error::SchemaValidation {
            message: message.into(),
            field: None,
        }
    }

    /// Create a schema validation error with field context.
    pub fn schema_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        Error::SchemaValidation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a rule evaluation error.
    pub fn rule(rule: impl Into<String>, message: impl Into<String>) -> Self {
        Error::RuleEvaluation {
            rule: rule.into(),
            message: message.into(),
        }
    }

    /// Create an audit-closed error.
    pub fn audit_closed(evaluation_id: impl Into<String>) -> Self {
        Error::AuditClosed {
            evaluation_id: evaluation_id.into(),
        }
    }

    /// Create an invalid audit event error.
    pub fn invalid_event(message: impl Into<String>) -> Self {
        Error::InvalidAuditEvent {
            message: message.into(),
        }
    }

    /// Create an invalid rate limit config error.
    pub fn rate_limit_config(message: impl Into<String>, field: impl Into<String>) -> Self {
        Error::InvalidRateLimitConfig {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Error::Storage {
            message: message.into(),
            key: None,
        }
    }

    /// Create a storage error with key context.
    pub fn storage_key(message: impl Into<String>, key: impl Into<String>) -> Self {
        Error::Storage {
            message: message.into(),
            key: Some(key.into()),
        }
    }

    /// Create an unsupported operation error.
    pub fn unsupported(operation: impl Into<String>) -> Self {
        Error::Unsupported {
            operation: operation.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: None,
        }
    }

    /// Create a configuration error with key context.
    pub fn config_key(message: impl Into<String>, key: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.into()),
        }
    }

    /// Whether this error is fatal to a policy evaluation call.
    ///
    /// Fatal errors abort before any rule runs and are returned to the caller.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::SchemaValidation { .. }
                | Error::InvalidRateLimitConfig { .. }
                | Error::Config { .. }
        )
    }

    /// Get the error category for metrics.
    pub fn category(&self) -> &'static str {
        match self {
            Error::SchemaValidation { .. } => "schema_validation",
            Error::RuleEvaluation { .. } => "rule_evaluation",
            Error::AuditClosed { .. } => "audit_closed",
            Error::InvalidAuditEvent { .. } => "invalid_audit_event",
            Error::InvalidRateLimitConfig { .. } => "invalid_rate_limit_config",
            Error::Storage { .. } => "storage",
            Error::Unsupported { .. } => "unsupported",
            Error::Config { .. } => "config",
            Error::Io(_) => "io",
            Error::Serialization(_) => "serialization",
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::config(err.to_string())
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(errs: validator::ValidationErrors) -> Self {
        let field = errs.field_errors().keys().next().map(|f| f.to_string());
        Error::SchemaValidation {
            message: errs.to_string(),
            field,
        }
    }
}
