//! Backing-store capability.
//!
//! The adapter never touches storage directly. Every read and write goes
//! through [`BackingStore`], which sees items under attribute names together
//! with the [`TableSchema`] that says how those attributes map onto physical
//! columns. Two primitives carry all the semantics the operations need:
//!
//! - [`BackingStore::read_range`] returns rows in a stable logical order,
//!   resuming strictly after an exclusive start key;
//! - [`BackingStore::conditional_write`] applies a put or delete, optionally
//!   guarded by an exact-match compare-and-swap on the current row;
//! - [`BackingStore::transact_write`] does the same for several rows at once,
//!   applying all of the writes or none of them.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use dynamo_adapter_model::{AttributeValue, Item, Number};

use crate::catalog::{IndexSchema, KeySchema, TableSchema};
use crate::expression::SortKeyCondition;

pub mod memory;

pub use memory::MemoryStore;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by a backing store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The physical table does not exist.
    #[error("Requested resource not found: Table: {0} not found")]
    TableNotFound(String),
    /// A key attribute could not be used as a storage key.
    #[error("invalid key: {0}")]
    InvalidKey(String),
    /// The store failed to carry out the call.
    #[error("backing store failure: {message}")]
    Backend {
        /// What failed.
        message: String,
        /// The underlying error, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
    /// The call did not complete within the configured timeout.
    #[error("backing store call timed out after {0:?}")]
    Timeout(Duration),
}

/// Run one store call under a timeout.
pub async fn with_timeout<T, F>(timeout: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| StoreError::Timeout(timeout))?
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// A key attribute value with a total order: strings by UTF-8 bytes, numbers
/// by exact decimal value, binaries byte-wise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyValue {
    /// String key.
    S(String),
    /// Number key.
    N(Number),
    /// Binary key.
    B(Bytes),
}

impl KeyValue {
    /// Convert a scalar attribute value.
    pub fn from_attribute(value: &AttributeValue) -> Result<Self, StoreError> {
        match value {
            AttributeValue::S(s) => Ok(Self::S(s.clone())),
            AttributeValue::N(n) => Number::parse(n)
                .map(Self::N)
                .map_err(|e| StoreError::InvalidKey(e.to_string())),
            AttributeValue::B(b) => Ok(Self::B(b.clone())),
            other => Err(StoreError::InvalidKey(format!(
                "key attributes must be S, N or B, got {}",
                other.type_descriptor()
            ))),
        }
    }
}

/// The position of a row in a logical ordering: key values compared in
/// sequence. A key schema without a sort key contributes `None` in its place,
/// so stored rows and start keys always have the same shape.
pub type OrderKey = Vec<Option<KeyValue>>;

/// Compute a row's position for a read over `index`, or over the base table
/// when `index` is `None`.
///
/// Index positions are (index partition, index sort, table partition, table
/// sort). Returns `None` when the item does not carry the keys the ordering
/// needs, which is how items absent from an index are excluded.
#[must_use]
pub fn order_key(schema: &TableSchema, index: Option<&IndexSchema>, item: &Item) -> Option<OrderKey> {
    let mut key = Vec::with_capacity(4);
    if let Some(index) = index {
        push_key_values(&index.key_schema, item, &mut key)?;
    }
    push_key_values(&schema.key_schema, item, &mut key)?;
    Some(key)
}

fn push_key_values(key_schema: &KeySchema, item: &Item, out: &mut OrderKey) -> Option<()> {
    out.push(Some(KeyValue::from_attribute(item.get(&key_schema.partition_key.name)?).ok()?));
    let sort = match &key_schema.sort_key {
        Some(sk) => Some(KeyValue::from_attribute(item.get(&sk.name)?).ok()?),
        None => None,
    };
    out.push(sort);
    Some(())
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// A key-range read.
#[derive(Debug, Clone, Copy)]
pub struct RangeRequest<'a> {
    /// Read an index instead of the base table.
    pub index: Option<&'a IndexSchema>,
    /// Exact partition key value (of the index when `index` is set). `None`
    /// reads every partition, as a scan does.
    pub partition: Option<&'a AttributeValue>,
    /// Sort-key predicate to push down.
    pub sort: Option<&'a SortKeyCondition>,
    /// Ascending order when `true`.
    pub forward: bool,
    /// Resume strictly after the row with these key attributes.
    pub exclusive_start: Option<&'a Item>,
    /// Maximum number of rows to return.
    pub limit: usize,
}

/// Rows returned by a range read, in request order.
#[derive(Debug, Clone, Default)]
pub struct RangePage {
    /// The rows, under attribute names.
    pub items: Vec<Item>,
    /// Whether the read stopped at the limit with rows remaining.
    pub has_more: bool,
}

/// A single-item write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Insert or replace the whole item.
    Put(Item),
    /// Delete the item with this key.
    Delete(Item),
}

/// Guard evaluated atomically with a write.
#[derive(Debug, Clone, PartialEq)]
pub enum Precondition {
    /// The stored row must still equal this snapshot; `None` means the row
    /// must not exist.
    Unchanged(Option<Item>),
}

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write was applied.
    Applied,
    /// The precondition did not hold and nothing was written.
    PredicateFailed,
}

/// One member of a transactional write.
#[derive(Debug, Clone)]
pub struct TransactWrite {
    /// Table the row lives in.
    pub schema: Arc<TableSchema>,
    /// Primary key of the row.
    pub key: Item,
    /// The write, or `None` for a member that only checks its precondition.
    pub write: Option<WriteOp>,
    /// Guard on the row, checked together with every other member's.
    pub precondition: Option<Precondition>,
}

/// Result of a transactional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactOutcome {
    /// Every precondition held and every write was applied.
    Applied,
    /// Nothing was written. Holds the positions of the members whose
    /// precondition failed.
    Conflict(Vec<usize>),
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Storage capability the adapter runs on.
#[async_trait]
pub trait BackingStore: Send + Sync + std::fmt::Debug {
    /// Read one item by its full primary key.
    async fn read_by_key(&self, schema: &TableSchema, key: &Item)
    -> Result<Option<Item>, StoreError>;

    /// Read rows in logical order: by partition then sort key for the base
    /// table, by index key then table key for an index.
    async fn read_range(
        &self,
        schema: &TableSchema,
        request: RangeRequest<'_>,
    ) -> Result<RangePage, StoreError>;

    /// Apply a write, checking `precondition` atomically with it.
    async fn conditional_write(
        &self,
        schema: &TableSchema,
        write: WriteOp,
        precondition: Option<Precondition>,
    ) -> Result<WriteOutcome, StoreError>;

    /// Check every member's precondition and apply every write as one unit.
    /// No other write may land between the checks and the writes.
    async fn transact_write(&self, members: Vec<TransactWrite>)
    -> Result<TransactOutcome, StoreError>;

    /// Whether [`RangeRequest::sort`] is honoured. When `false` the planner
    /// evaluates the sort-key predicate itself.
    fn supports_sort_key_pushdown(&self) -> bool {
        true
    }
}
