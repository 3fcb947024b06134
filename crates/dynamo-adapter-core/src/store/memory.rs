//! In-memory backing store.
//!
//! # Architecture
//!
//! ```text
//! DashMap<PhysicalTable, MemoryTable>
//!   MemoryTable: DashMap<PartitionKey, BTreeMap<Option<SortKey>, Row>>
//! ```
//!
//! - Partition-level concurrency: different partitions can be read and
//!   written concurrently without contention.
//! - Sort key ordering: within each partition rows are kept in a `BTreeMap`
//!   keyed by [`KeyValue`], which orders numbers by exact decimal value.
//!   Tables without a sort key use `None` as the single map key.
//! - Rows are stored under column identifiers, translated through the
//!   schema's column mapping on the way in and out.
//! - A conditional write holds the partition's entry lock across the
//!   compare and the write.
//! - Reads and single-row writes share the store's commit lock; a
//!   transactional write takes it exclusively, so its checks and writes are
//!   never interleaved with anything else.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use dynamo_adapter_model::{AttributeValue, Item};

use super::{
    BackingStore, KeyValue, OrderKey, Precondition, RangePage, RangeRequest, StoreError,
    TransactOutcome, TransactWrite, WriteOp, WriteOutcome, order_key,
};
use crate::catalog::{MemoryCatalog, TableSchema};

/// A stored row, keyed by column identifier.
type Row = HashMap<String, AttributeValue>;

type Partition = BTreeMap<Option<KeyValue>, Row>;

#[derive(Debug, Default)]
struct MemoryTable {
    partitions: DashMap<KeyValue, Partition>,
}

/// A [`BackingStore`] that keeps every table in process memory.
#[derive(Debug)]
pub struct MemoryStore {
    tables: DashMap<String, Arc<MemoryTable>>,
    write_seq: Mutex<u64>,
    commit: RwLock<()>,
    sort_pushdown: bool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: DashMap::new(),
            write_seq: Mutex::new(0),
            commit: RwLock::new(()),
            sort_pushdown: true,
        }
    }

    /// Create a store with a physical table for every schema in `catalog`.
    #[must_use]
    pub fn for_catalog(catalog: &MemoryCatalog) -> Self {
        let store = Self::new();
        for schema in catalog.schemas() {
            store.create_table(&schema);
        }
        store
    }

    /// Turn sort-key pushdown on or off. With it off, range reads ignore
    /// [`RangeRequest::sort`] and the caller filters rows itself.
    #[must_use]
    pub fn with_sort_key_pushdown(mut self, enabled: bool) -> Self {
        self.sort_pushdown = enabled;
        self
    }

    /// Create the physical table behind `schema` if it does not exist yet.
    pub fn create_table(&self, schema: &TableSchema) {
        self.tables
            .entry(schema.physical_name.clone())
            .or_insert_with(|| Arc::new(MemoryTable::default()));
    }

    /// Number of writes applied since the store was created.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        *self.write_seq.lock()
    }

    fn table(&self, schema: &TableSchema) -> Result<Arc<MemoryTable>, StoreError> {
        self.tables
            .get(&schema.physical_name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| StoreError::TableNotFound(schema.name.clone()))
    }

    fn bump_write_seq(&self) -> u64 {
        let mut seq = self.write_seq.lock();
        *seq += 1;
        *seq
    }

    /// Current row under `key` compared with the guard. The caller holds the
    /// commit lock.
    fn precondition_holds(
        &self,
        schema: &TableSchema,
        key: &Item,
        precondition: &Precondition,
    ) -> Result<bool, StoreError> {
        let table = self.table(schema)?;
        let (pk, sk) = primary_key(schema, key)?;
        let current = table
            .partitions
            .get(&pk)
            .and_then(|partition| partition.get(&sk).map(|row| from_row(schema, row)));
        Ok(match precondition {
            Precondition::Unchanged(expected) => current == *expected,
        })
    }

    /// Compare and write one row under its partition's entry lock. The caller
    /// holds the commit lock.
    fn apply(
        &self,
        schema: &TableSchema,
        write: WriteOp,
        precondition: Option<&Precondition>,
    ) -> Result<bool, StoreError> {
        let table = self.table(schema)?;
        let target = match &write {
            WriteOp::Put(item) | WriteOp::Delete(item) => item,
        };
        let (pk, sk) = primary_key(schema, target)?;

        let applied = {
            let mut partition = table.partitions.entry(pk.clone()).or_default();
            let unchanged = match precondition {
                Some(Precondition::Unchanged(expected)) => {
                    partition.get(&sk).map(|row| from_row(schema, row)) == *expected
                }
                None => true,
            };
            if unchanged {
                match write {
                    WriteOp::Put(item) => {
                        partition.insert(sk, to_row(schema, item));
                    }
                    WriteOp::Delete(_) => {
                        partition.remove(&sk);
                    }
                }
            }
            unchanged
        };
        table.partitions.remove_if(&pk, |_, partition| partition.is_empty());
        if applied {
            let seq = self.bump_write_seq();
            debug!(table = %schema.physical_name, seq, "applied write");
        }
        Ok(applied)
    }
}

/// Split an item or key map into its storage coordinates.
fn primary_key(
    schema: &TableSchema,
    item: &Item,
) -> Result<(KeyValue, Option<KeyValue>), StoreError> {
    let ks = &schema.key_schema;
    let pk = item.get(&ks.partition_key.name).ok_or_else(|| {
        StoreError::InvalidKey(format!("missing key attribute {}", ks.partition_key.name))
    })?;
    let sk = ks
        .sort_key
        .as_ref()
        .map(|sk| {
            item.get(&sk.name)
                .ok_or_else(|| StoreError::InvalidKey(format!("missing key attribute {}", sk.name)))
                .and_then(KeyValue::from_attribute)
        })
        .transpose()?;
    Ok((KeyValue::from_attribute(pk)?, sk))
}

fn to_row(schema: &TableSchema, item: Item) -> Row {
    item.into_iter()
        .map(|(name, value)| (schema.column_for(&name).to_owned(), value))
        .collect()
}

fn from_row(schema: &TableSchema, row: &Row) -> Item {
    row.iter()
        .map(|(column, value)| (schema.attribute_for_column(column).to_owned(), value.clone()))
        .collect()
}

#[async_trait]
impl BackingStore for MemoryStore {
    async fn read_by_key(
        &self,
        schema: &TableSchema,
        key: &Item,
    ) -> Result<Option<Item>, StoreError> {
        let _shared = self.commit.read();
        let table = self.table(schema)?;
        let (pk, sk) = primary_key(schema, key)?;
        Ok(table
            .partitions
            .get(&pk)
            .and_then(|partition| partition.get(&sk).map(|row| from_row(schema, row))))
    }

    async fn read_range(
        &self,
        schema: &TableSchema,
        request: RangeRequest<'_>,
    ) -> Result<RangePage, StoreError> {
        let _shared = self.commit.read();
        let table = self.table(schema)?;
        let mut rows = match (request.index, request.partition) {
            (None, Some(pk)) => partition_rows(schema, &table, pk, &request)?,
            _ => all_rows(schema, &table, &request)?,
        };

        if let Some(start) = request.exclusive_start {
            let start = order_key(schema, request.index, start).ok_or_else(|| {
                StoreError::InvalidKey("exclusive start key is missing key attributes".to_owned())
            })?;
            rows.retain(|(position, _)| {
                if request.forward {
                    *position > start
                } else {
                    *position < start
                }
            });
        }

        if self.sort_pushdown {
            if let Some(cond) = request.sort {
                rows.retain(|(_, item)| item.get(&cond.attribute).is_some_and(|v| cond.matches(v)));
            }
        }

        let has_more = rows.len() > request.limit;
        rows.truncate(request.limit);
        debug!(
            table = %schema.physical_name,
            index = request.index.map(|i| i.name.as_str()),
            returned = rows.len(),
            has_more,
            "range read"
        );
        Ok(RangePage {
            items: rows.into_iter().map(|(_, item)| item).collect(),
            has_more,
        })
    }

    async fn conditional_write(
        &self,
        schema: &TableSchema,
        write: WriteOp,
        precondition: Option<Precondition>,
    ) -> Result<WriteOutcome, StoreError> {
        let _shared = self.commit.read();
        if self.apply(schema, write, precondition.as_ref())? {
            Ok(WriteOutcome::Applied)
        } else {
            Ok(WriteOutcome::PredicateFailed)
        }
    }

    async fn transact_write(
        &self,
        members: Vec<TransactWrite>,
    ) -> Result<TransactOutcome, StoreError> {
        let _exclusive = self.commit.write();

        let mut conflicts = Vec::new();
        for (position, member) in members.iter().enumerate() {
            // Resolves the table and key of every member before anything is
            // written, so the apply loop below cannot fail part way.
            let holds = match &member.precondition {
                Some(precondition) => {
                    self.precondition_holds(&member.schema, &member.key, precondition)?
                }
                None => {
                    self.table(&member.schema)?;
                    primary_key(&member.schema, &member.key)?;
                    true
                }
            };
            if !holds {
                conflicts.push(position);
            }
        }
        if !conflicts.is_empty() {
            debug!(members = members.len(), ?conflicts, "transaction conflict");
            return Ok(TransactOutcome::Conflict(conflicts));
        }

        let total = members.len();
        for member in members {
            if let Some(write) = member.write {
                self.apply(&member.schema, write, None)?;
            }
        }
        debug!(members = total, "applied transaction");
        Ok(TransactOutcome::Applied)
    }

    fn supports_sort_key_pushdown(&self) -> bool {
        self.sort_pushdown
    }
}

/// Rows of one base-table partition, already in sort-key order.
fn partition_rows(
    schema: &TableSchema,
    table: &MemoryTable,
    pk: &AttributeValue,
    request: &RangeRequest<'_>,
) -> Result<Vec<(OrderKey, Item)>, StoreError> {
    let pk = KeyValue::from_attribute(pk)?;
    let Some(partition) = table.partitions.get(&pk) else {
        return Ok(Vec::new());
    };
    let mut rows: Vec<(OrderKey, Item)> = partition
        .iter()
        .map(|(sk, row)| (vec![Some(pk.clone()), sk.clone()], from_row(schema, row)))
        .collect();
    if !request.forward {
        rows.reverse();
    }
    Ok(rows)
}

/// Every row the request could see, sorted into its logical order.
fn all_rows(
    schema: &TableSchema,
    table: &MemoryTable,
    request: &RangeRequest<'_>,
) -> Result<Vec<(OrderKey, Item)>, StoreError> {
    let partition_filter = match (request.index, request.partition) {
        (Some(index), Some(value)) => Some((&index.key_schema.partition_key.name, value)),
        _ => None,
    };

    let mut rows: Vec<(OrderKey, Item)> = table
        .partitions
        .iter()
        .flat_map(|partition| {
            partition
                .value()
                .values()
                .map(|row| from_row(schema, row))
                .collect::<Vec<_>>()
        })
        .filter(|item| {
            partition_filter.is_none_or(|(name, value)| item.get(name.as_str()) == Some(value))
        })
        .filter_map(|item| Some((order_key(schema, request.index, &item)?, item)))
        .collect();

    rows.sort_by(|a, b| a.0.cmp(&b.0));
    if !request.forward {
        rows.reverse();
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{KeyAttribute, KeySchema};
    use crate::expression::ast::{AttributePath, CompareOp, Expr, Operand};
    use crate::expression::{SortKeyCondition, SortKeyOp};
    use dynamo_adapter_model::types::ScalarAttributeType;

    fn schema() -> TableSchema {
        TableSchema::new(
            "events",
            KeySchema::new(
                KeyAttribute::new("device", ScalarAttributeType::S),
                Some(KeyAttribute::new("ts", ScalarAttributeType::N)),
            ),
        )
        .with_column("device", "device_id")
        .with_index(
            "by_kind",
            KeySchema::new(
                KeyAttribute::new("kind", ScalarAttributeType::S),
                Some(KeyAttribute::new("ts", ScalarAttributeType::N)),
            ),
        )
    }

    fn event(device: &str, ts: &str, kind: Option<&str>) -> Item {
        let mut item = Item::from([
            ("device".to_owned(), AttributeValue::S(device.to_owned())),
            ("ts".to_owned(), AttributeValue::N(ts.to_owned())),
        ]);
        if let Some(kind) = kind {
            item.insert("kind".to_owned(), AttributeValue::S(kind.to_owned()));
        }
        item
    }

    async fn seeded() -> (MemoryStore, TableSchema) {
        let schema = schema();
        let store = MemoryStore::new();
        store.create_table(&schema);
        for item in [
            event("a", "10", Some("boot")),
            event("a", "9", None),
            event("a", "100", Some("halt")),
            event("b", "1", Some("boot")),
        ] {
            store
                .conditional_write(&schema, WriteOp::Put(item), None)
                .await
                .expect("put");
        }
        (store, schema)
    }

    fn request<'a>() -> RangeRequest<'a> {
        RangeRequest {
            index: None,
            partition: None,
            sort: None,
            forward: true,
            exclusive_start: None,
            limit: usize::MAX,
        }
    }

    fn ts_of(items: &[Item]) -> Vec<String> {
        items
            .iter()
            .map(|item| item["ts"].as_n().expect("ts").to_owned())
            .collect()
    }

    #[tokio::test]
    async fn test_should_store_rows_under_column_names() {
        let (store, schema) = seeded().await;
        let table = store.table(&schema).expect("table");
        let partition = table
            .partitions
            .get(&KeyValue::S("a".to_owned()))
            .expect("partition");
        let row = partition.values().next().expect("row");
        assert!(row.contains_key("device_id"));
        assert!(!row.contains_key("device"));

        let key = Item::from([
            ("device".to_owned(), AttributeValue::S("a".to_owned())),
            ("ts".to_owned(), AttributeValue::N("10.0".to_owned())),
        ]);
        let item = store.read_by_key(&schema, &key).await.expect("read").expect("found");
        assert_eq!(item["device"], AttributeValue::S("a".to_owned()));
        assert_eq!(store.write_count(), 4);
    }

    #[tokio::test]
    async fn test_should_read_partition_in_numeric_order() {
        let (store, schema) = seeded().await;
        let pk = AttributeValue::S("a".to_owned());
        let page = store
            .read_range(&schema, RangeRequest { partition: Some(&pk), ..request() })
            .await
            .expect("read");
        assert_eq!(ts_of(&page.items), ["9", "10", "100"]);

        let page = store
            .read_range(
                &schema,
                RangeRequest {
                    partition: Some(&pk),
                    forward: false,
                    limit: 2,
                    ..request()
                },
            )
            .await
            .expect("read");
        assert_eq!(ts_of(&page.items), ["100", "10"]);
        assert!(page.has_more);
    }

    #[tokio::test]
    async fn test_should_push_down_sort_condition_and_resume() {
        let (store, schema) = seeded().await;
        let pk = AttributeValue::S("a".to_owned());
        let cond = SortKeyCondition {
            attribute: "ts".to_owned(),
            op: SortKeyOp::Compare(CompareOp::Ge, AttributeValue::N("10".to_owned())),
            expr: Expr::Compare {
                left: Box::new(Operand::Path(AttributePath::attribute("ts"))),
                op: CompareOp::Ge,
                right: Box::new(Operand::Value(":t".to_owned())),
            },
        };
        let start = event("a", "10", None);
        let page = store
            .read_range(
                &schema,
                RangeRequest {
                    partition: Some(&pk),
                    sort: Some(&cond),
                    exclusive_start: Some(&start),
                    ..request()
                },
            )
            .await
            .expect("read");
        assert_eq!(ts_of(&page.items), ["100"]);
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn test_should_scan_and_read_index_in_order() {
        let (store, schema) = seeded().await;
        let page = store.read_range(&schema, request()).await.expect("scan");
        assert_eq!(ts_of(&page.items), ["9", "10", "100", "1"]);

        let index = schema.index("by_kind");
        let page = store
            .read_range(&schema, RangeRequest { index, ..request() })
            .await
            .expect("index scan");
        assert_eq!(ts_of(&page.items), ["1", "10", "100"]);

        let boot = AttributeValue::S("boot".to_owned());
        let page = store
            .read_range(
                &schema,
                RangeRequest {
                    index,
                    partition: Some(&boot),
                    forward: false,
                    ..request()
                },
            )
            .await
            .expect("index query");
        assert_eq!(ts_of(&page.items), ["10", "1"]);
    }

    #[tokio::test]
    async fn test_should_resume_after_start_key_without_sort_key() {
        let schema = TableSchema::new(
            "users",
            KeySchema::new(KeyAttribute::new("id", ScalarAttributeType::N), None),
        );
        let store = MemoryStore::new();
        store.create_table(&schema);
        let user = |id: &str| Item::from([("id".to_owned(), AttributeValue::N(id.to_owned()))]);
        for id in ["1", "2", "3"] {
            store
                .conditional_write(&schema, WriteOp::Put(user(id)), None)
                .await
                .expect("put");
        }
        let ids = |items: &[Item]| -> Vec<String> {
            items.iter().map(|i| i["id"].as_n().expect("id").to_owned()).collect()
        };

        let start = user("2");
        let pk = AttributeValue::N("2".to_owned());
        let page = store
            .read_range(
                &schema,
                RangeRequest {
                    partition: Some(&pk),
                    exclusive_start: Some(&start),
                    ..request()
                },
            )
            .await
            .expect("query");
        assert!(page.items.is_empty());

        let page = store
            .read_range(&schema, RangeRequest { exclusive_start: Some(&start), ..request() })
            .await
            .expect("scan");
        assert_eq!(ids(&page.items), ["3"]);

        let page = store
            .read_range(
                &schema,
                RangeRequest {
                    forward: false,
                    exclusive_start: Some(&start),
                    ..request()
                },
            )
            .await
            .expect("reverse scan");
        assert_eq!(ids(&page.items), ["1"]);
    }

    #[tokio::test]
    async fn test_should_compare_and_swap_atomically() {
        let (store, schema) = seeded().await;
        let current = event("b", "1", Some("boot"));
        let stale = event("b", "1", Some("stale"));

        let outcome = store
            .conditional_write(
                &schema,
                WriteOp::Put(event("b", "1", Some("halt"))),
                Some(Precondition::Unchanged(Some(stale))),
            )
            .await
            .expect("write");
        assert_eq!(outcome, WriteOutcome::PredicateFailed);

        let outcome = store
            .conditional_write(
                &schema,
                WriteOp::Delete(event("b", "1", None)),
                Some(Precondition::Unchanged(Some(current))),
            )
            .await
            .expect("write");
        assert_eq!(outcome, WriteOutcome::Applied);

        let outcome = store
            .conditional_write(
                &schema,
                WriteOp::Put(event("b", "1", None)),
                Some(Precondition::Unchanged(None)),
            )
            .await
            .expect("write");
        assert_eq!(outcome, WriteOutcome::Applied);
    }

    #[tokio::test]
    async fn test_should_apply_transaction_all_or_nothing() {
        let (store, schema) = seeded().await;
        let schema = Arc::new(schema);
        let member = |key: Item, write: Option<WriteOp>, expected: Option<Option<Item>>| {
            TransactWrite {
                schema: Arc::clone(&schema),
                key,
                write,
                precondition: expected.map(Precondition::Unchanged),
            }
        };
        let writes_before = store.write_count();

        let outcome = store
            .transact_write(vec![
                member(
                    event("c", "5", None),
                    Some(WriteOp::Put(event("c", "5", Some("boot")))),
                    Some(None),
                ),
                member(event("b", "1", None), None, Some(Some(event("b", "1", Some("stale"))))),
            ])
            .await
            .expect("transact");
        assert_eq!(outcome, TransactOutcome::Conflict(vec![1]));
        assert_eq!(store.write_count(), writes_before);
        assert!(store.read_by_key(&schema, &event("c", "5", None)).await.expect("read").is_none());

        let outcome = store
            .transact_write(vec![
                member(
                    event("c", "5", None),
                    Some(WriteOp::Put(event("c", "5", Some("boot")))),
                    Some(None),
                ),
                member(
                    event("b", "1", None),
                    Some(WriteOp::Delete(event("b", "1", None))),
                    Some(Some(event("b", "1", Some("boot")))),
                ),
                member(event("a", "9", None), None, Some(Some(event("a", "9", None)))),
            ])
            .await
            .expect("transact");
        assert_eq!(outcome, TransactOutcome::Applied);
        assert_eq!(store.write_count(), writes_before + 2);
        assert!(store.read_by_key(&schema, &event("c", "5", None)).await.expect("read").is_some());
        assert!(store.read_by_key(&schema, &event("b", "1", None)).await.expect("read").is_none());
    }

    #[tokio::test]
    async fn test_should_report_missing_table() {
        let store = MemoryStore::new();
        let err = store
            .read_range(&schema(), request())
            .await
            .expect_err("missing table");
        assert!(matches!(err, StoreError::TableNotFound(name) if name == "events"));
    }
}
