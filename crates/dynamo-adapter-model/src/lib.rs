//! Wire model types for the DynamoDB adapter.
//!
//! This crate holds the typed value model, the exact decimal number type, the
//! error type surfaced to callers, and the request/response shapes of the
//! item-level operations. The types are hand-written since the JSON protocol
//! makes serde derives trivial.
// "DynamoDB" appears in virtually every doc comment in this crate.
#![allow(clippy::doc_markdown)]
#![allow(clippy::module_name_repetitions)]

pub mod attribute_value;
pub mod error;
pub mod input;
pub mod number;
pub mod operations;
pub mod output;
pub mod types;

pub use attribute_value::{AttributeValue, Item, ValueError};
pub use error::{CancellationReason, DynamoDBError, DynamoDBErrorCode};
pub use number::{Number, NumberError};
pub use operations::DynamoDBOperation;
