//! Conversions from core errors to the wire error type.
//!
//! Each function takes its error by value because it is used as a closure
//! argument to `.map_err()`.

use dynamo_adapter_model::error::{DynamoDBError, DynamoDBErrorCode};

use crate::catalog::{CatalogError, KeyError};
use crate::cursor::CursorError;
use crate::expression::ExpressionError;
use crate::store::StoreError;

/// Message returned when a write precondition does not hold.
pub const CONDITIONAL_REQUEST_FAILED: &str = "The conditional request failed";

/// Convert an expression error into a validation error.
#[must_use]
pub fn expression_error_to_dynamodb(e: ExpressionError) -> DynamoDBError {
    DynamoDBError::with_message(DynamoDBErrorCode::ValidationException, e.to_string())
        .with_source(e)
}

/// Convert a catalog error: unknown tables become `ResourceNotFoundException`.
#[must_use]
pub fn catalog_error_to_dynamodb(e: CatalogError) -> DynamoDBError {
    let err = match &e {
        CatalogError::TableNotFound(_) => DynamoDBError::resource_not_found(e.to_string()),
        CatalogError::InvalidSchema(_) => DynamoDBError::internal_error(e.to_string()),
    };
    err.with_source(e)
}

/// Convert a key validation error into a validation error.
#[must_use]
#[allow(clippy::needless_pass_by_value)]
pub fn key_error_to_dynamodb(e: KeyError) -> DynamoDBError {
    DynamoDBError::validation(e.to_string())
}

/// Convert a cursor error into a validation error.
#[must_use]
#[allow(clippy::needless_pass_by_value)]
pub fn cursor_error_to_dynamodb(e: CursorError) -> DynamoDBError {
    DynamoDBError::validation(e.to_string())
}

/// Convert a store error.
///
/// A missing table is `ResourceNotFoundException` and a bad key is a
/// validation error. Transport failures and timeouts become
/// `InternalServerError` carrying the original error as source.
#[must_use]
pub fn store_error_to_dynamodb(e: StoreError) -> DynamoDBError {
    let err = match &e {
        StoreError::TableNotFound(_) => DynamoDBError::resource_not_found(e.to_string()),
        StoreError::InvalidKey(_) => DynamoDBError::validation(e.to_string()),
        StoreError::Backend { .. } | StoreError::Timeout(_) => {
            DynamoDBError::internal_error(format!("Internal server error: {e}"))
        }
    };
    err.with_source(e)
}
