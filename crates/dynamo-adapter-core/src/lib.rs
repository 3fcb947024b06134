//! DynamoDB-compatible item API over a relational-style backing store.
//!
//! The crate parses and evaluates the five DynamoDB expression kinds,
//! plans Query/Scan reads as key-range requests, and runs single-item,
//! batch and transactional writes through a [`store::BackingStore`]
//! described by a [`catalog::SchemaCatalog`].
#![allow(clippy::doc_markdown, clippy::module_name_repetitions)]

pub mod batch;
pub mod catalog;
pub mod config;
pub mod cursor;
pub mod error;
pub mod expression;
pub mod handler;
pub mod planner;
pub mod provider;
pub mod store;
pub mod telemetry;
pub mod transaction;

pub use catalog::{MemoryCatalog, SchemaCatalog, TableSchema};
pub use config::AdapterConfig;
pub use handler::{DynamoAdapterHandler, OperationHandler};
pub use provider::DynamoAdapter;
pub use store::{BackingStore, MemoryStore};
