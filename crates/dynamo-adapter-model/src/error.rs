//! Wire-level error type.
//!
//! Errors are returned to callers as JSON with a `__type` field containing
//! the fully-qualified error type name and a `message` field.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Error codes surfaced by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[non_exhaustive]
pub enum DynamoDBErrorCode {
    /// Table not found.
    ResourceNotFoundException,
    /// Condition check failed.
    ConditionalCheckFailedException,
    /// A transactional write was cancelled; nothing was written.
    TransactionCanceledException,
    /// Validation error: malformed expressions, unresolved placeholders,
    /// type mismatches, and request-shape problems.
    #[default]
    ValidationException,
    /// The request body could not be decoded.
    SerializationException,
    /// Backing store failure or timeout.
    InternalServerError,
    /// Unknown operation.
    UnrecognizedClientException,
}

impl DynamoDBErrorCode {
    /// Returns the fully-qualified error type string for JSON `__type` field.
    #[must_use]
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::ResourceNotFoundException => {
                "com.amazonaws.dynamodb.v20120810#ResourceNotFoundException"
            }
            Self::ConditionalCheckFailedException => {
                "com.amazonaws.dynamodb.v20120810#ConditionalCheckFailedException"
            }
            Self::TransactionCanceledException => {
                "com.amazonaws.dynamodb.v20120810#TransactionCanceledException"
            }
            Self::ValidationException => "com.amazon.coral.validate#ValidationException",
            Self::SerializationException => {
                "com.amazonaws.dynamodb.v20120810#SerializationException"
            }
            Self::InternalServerError => "com.amazonaws.dynamodb.v20120810#InternalServerError",
            Self::UnrecognizedClientException => {
                "com.amazonaws.dynamodb.v20120810#UnrecognizedClientException"
            }
        }
    }

    /// Returns the short error code string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ResourceNotFoundException => "ResourceNotFoundException",
            Self::ConditionalCheckFailedException => "ConditionalCheckFailedException",
            Self::TransactionCanceledException => "TransactionCanceledException",
            Self::ValidationException => "ValidationException",
            Self::SerializationException => "SerializationException",
            Self::InternalServerError => "InternalServerError",
            Self::UnrecognizedClientException => "UnrecognizedClientException",
        }
    }

    /// Returns the default HTTP status code for this error.
    #[must_use]
    pub fn default_status_code(&self) -> http::StatusCode {
        match self {
            Self::InternalServerError => http::StatusCode::INTERNAL_SERVER_ERROR,
            _ => http::StatusCode::BAD_REQUEST,
        }
    }
}

impl fmt::Display for DynamoDBErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why one member of a cancelled transaction did not go through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CancellationReason {
    /// `None`, `ConditionalCheckFailed` or `TransactionConflict`.
    pub code: String,
    /// Detail for a failed member.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CancellationReason {
    /// Reason code of a member that did not cause the cancellation.
    pub const NONE: &'static str = "None";
    /// Reason code of a member whose condition evaluated to false.
    pub const CONDITIONAL_CHECK_FAILED: &'static str = "ConditionalCheckFailed";
    /// Reason code of a member whose item changed while the transaction ran.
    pub const TRANSACTION_CONFLICT: &'static str = "TransactionConflict";
}

/// An error response.
#[derive(Debug)]
pub struct DynamoDBError {
    /// The error code.
    pub code: DynamoDBErrorCode,
    /// A human-readable error message.
    pub message: String,
    /// The HTTP status code.
    pub status_code: http::StatusCode,
    /// One entry per transaction member, set only for
    /// [`DynamoDBErrorCode::TransactionCanceledException`].
    pub cancellation_reasons: Vec<CancellationReason>,
    /// The underlying source error, if any.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl fmt::Display for DynamoDBError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DynamoDBError({}): {}", self.code, self.message)
    }
}

impl std::error::Error for DynamoDBError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl DynamoDBError {
    /// Create a new `DynamoDBError` with a custom message.
    #[must_use]
    pub fn with_message(code: DynamoDBErrorCode, message: impl Into<String>) -> Self {
        Self {
            status_code: code.default_status_code(),
            message: message.into(),
            code,
            cancellation_reasons: Vec::new(),
            source: None,
        }
    }

    /// Set the source error.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Returns the `__type` string for the JSON error response.
    #[must_use]
    pub fn error_type(&self) -> &'static str {
        self.code.error_type()
    }

    /// Downcast the source error to a concrete type.
    #[must_use]
    pub fn source_as<E: std::error::Error + 'static>(&self) -> Option<&E> {
        self.source.as_deref().and_then(|e| e.downcast_ref::<E>())
    }

    /// Render the JSON error body: `{"__type": "...", "message": "..."}`,
    /// plus `CancellationReasons` for a cancelled transaction.
    #[must_use]
    pub fn to_json_body(&self) -> serde_json::Value {
        let mut body = serde_json::json!({
            "__type": self.error_type(),
            "message": self.message,
        });
        if !self.cancellation_reasons.is_empty() {
            body["CancellationReasons"] = serde_json::json!(self.cancellation_reasons);
        }
        body
    }

    // -- Convenience constructors --

    /// Table or resource not found.
    #[must_use]
    pub fn resource_not_found(message: impl Into<String>) -> Self {
        Self::with_message(DynamoDBErrorCode::ResourceNotFoundException, message)
    }

    /// Condition expression evaluated to false.
    #[must_use]
    pub fn conditional_check_failed(message: impl Into<String>) -> Self {
        Self::with_message(DynamoDBErrorCode::ConditionalCheckFailedException, message)
    }

    /// Transaction cancelled, with one reason per member in request order.
    #[must_use]
    pub fn transaction_canceled(reasons: Vec<CancellationReason>) -> Self {
        let codes: Vec<&str> = reasons.iter().map(|r| r.code.as_str()).collect();
        let mut err = Self::with_message(
            DynamoDBErrorCode::TransactionCanceledException,
            format!(
                "Transaction cancelled, please refer cancellation reasons for specific reasons [{}]",
                codes.join(", ")
            ),
        );
        err.cancellation_reasons = reasons;
        err
    }

    /// Validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::with_message(DynamoDBErrorCode::ValidationException, message)
    }

    /// Serialization error.
    #[must_use]
    pub fn serialization_exception(message: impl Into<String>) -> Self {
        Self::with_message(DynamoDBErrorCode::SerializationException, message)
    }

    /// Internal server error.
    #[must_use]
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::with_message(DynamoDBErrorCode::InternalServerError, message)
    }

    /// Unknown operation.
    #[must_use]
    pub fn unknown_operation(target: &str) -> Self {
        Self::with_message(
            DynamoDBErrorCode::UnrecognizedClientException,
            format!("Unrecognized operation: {target}"),
        )
    }
}
