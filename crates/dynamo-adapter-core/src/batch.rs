//! `BatchGetItem` and `BatchWriteItem`.
//!
//! Both operations validate the whole request before touching the store, so
//! a bad table name or key fails the call with no partial effect. Reads then
//! fan out with bounded concurrency; writes run one at a time.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::debug;

use dynamo_adapter_model::error::DynamoDBError;
use dynamo_adapter_model::input::{BatchGetItemInput, BatchWriteItemInput};
use dynamo_adapter_model::output::{BatchGetItemOutput, BatchWriteItemOutput};
use dynamo_adapter_model::types::WriteRequest;
use dynamo_adapter_model::Item;

use crate::catalog::{SchemaCatalog, TableSchema};
use crate::config::AdapterConfig;
use crate::error::{
    catalog_error_to_dynamodb, expression_error_to_dynamodb, key_error_to_dynamodb,
    store_error_to_dynamodb,
};
use crate::expression::{AttributePath, ExpressionContext, ExpressionInput, project_item};
use crate::provider::validate_put_item;
use crate::store::{BackingStore, KeyValue, WriteOp, with_timeout};

/// Maximum keys in one `BatchGetItem` call.
pub const MAX_BATCH_GET_KEYS: usize = 100;

/// Maximum requests in one `BatchWriteItem` call.
pub const MAX_BATCH_WRITE_REQUESTS: usize = 25;

/// One table's share of a `BatchGetItem` call, validated.
struct TableRead<'a> {
    name: &'a str,
    schema: Arc<TableSchema>,
    projection: Option<Vec<AttributePath>>,
    keys: &'a [Item],
}

/// One table's share of a `BatchWriteItem` call, validated.
struct TableWrite {
    schema: Arc<TableSchema>,
    writes: Vec<WriteOp>,
}

/// Runs batch reads and writes against a catalog and store.
#[derive(Debug, Clone)]
pub struct BatchOrchestrator {
    catalog: Arc<dyn SchemaCatalog>,
    store: Arc<dyn BackingStore>,
    config: Arc<AdapterConfig>,
}

impl BatchOrchestrator {
    /// Create an orchestrator over a catalog and store.
    #[must_use]
    pub fn new(
        catalog: Arc<dyn SchemaCatalog>,
        store: Arc<dyn BackingStore>,
        config: Arc<AdapterConfig>,
    ) -> Self {
        Self {
            catalog,
            store,
            config,
        }
    }

    /// Handle `BatchGetItem`.
    pub async fn batch_get(
        &self,
        input: BatchGetItemInput,
    ) -> Result<BatchGetItemOutput, DynamoDBError> {
        let total_keys: usize = input.request_items.values().map(|ka| ka.keys.len()).sum();
        if total_keys > MAX_BATCH_GET_KEYS {
            return Err(DynamoDBError::validation(
                "Too many items requested for the BatchGetItem call",
            ));
        }
        if input.request_items.is_empty() || input.request_items.values().any(|ka| ka.keys.is_empty())
        {
            return Err(length_error("requestItems"));
        }

        let mut table_names: Vec<&String> = input.request_items.keys().collect();
        table_names.sort();
        let schemas = table_names
            .iter()
            .map(|name| self.catalog.schema(name).map_err(catalog_error_to_dynamodb))
            .collect::<Result<Vec<_>, _>>()?;

        let no_values = HashMap::new();
        let mut tables = Vec::with_capacity(schemas.len());
        for (name, schema) in table_names.into_iter().zip(schemas) {
            let request = &input.request_items[name];
            let mut seen = HashSet::new();
            for key in &request.keys {
                schema
                    .key_schema
                    .validate_key(key)
                    .map_err(key_error_to_dynamodb)?;
                if !seen.insert(key_values(&schema, key)?) {
                    return Err(DynamoDBError::validation(
                        "Provided list of item keys contains duplicates",
                    ));
                }
            }
            let ctx = ExpressionContext::compile(
                ExpressionInput {
                    projection: request.projection_expression.as_deref(),
                    ..ExpressionInput::default()
                },
                &request.expression_attribute_names,
                &no_values,
            )
            .map_err(expression_error_to_dynamodb)?;
            tables.push(TableRead {
                name: name.as_str(),
                schema,
                projection: ctx.projection,
                keys: &request.keys,
            });
        }

        debug!(
            tables = tables.len(),
            keys = total_keys,
            concurrency = self.config.batch_concurrency,
            "batch get"
        );
        // Each read owns its schema, key and store handle so the buffered
        // stream holds no borrows of `tables`.
        let timeout = self.config.request_timeout;
        let reads: Vec<_> = tables
            .iter()
            .enumerate()
            .flat_map(|(slot, table)| {
                table
                    .keys
                    .iter()
                    .map(move |key| (slot, Arc::clone(&table.schema), key.clone()))
            })
            .map(|(slot, schema, key)| {
                let store = Arc::clone(&self.store);
                async move {
                    let item = with_timeout(timeout, store.read_by_key(&schema, &key))
                        .await
                        .map_err(store_error_to_dynamodb)?;
                    Ok::<_, DynamoDBError>((slot, item))
                }
            })
            .collect();
        let fetched: Vec<(usize, Option<Item>)> = stream::iter(reads)
            .buffered(self.config.batch_concurrency.max(1))
            .try_collect()
            .await?;

        let mut responses: HashMap<String, Vec<Item>> = tables
            .iter()
            .map(|table| (table.name.to_owned(), Vec::new()))
            .collect();
        for (slot, item) in fetched {
            let (Some(item), Some(table)) = (item, tables.get(slot)) else {
                continue;
            };
            let item = match &table.projection {
                Some(paths) => project_item(&item, paths),
                None => item,
            };
            if let Some(items) = responses.get_mut(table.name) {
                items.push(item);
            }
        }

        Ok(BatchGetItemOutput {
            responses,
            unprocessed_keys: HashMap::new(),
        })
    }

    /// Handle `BatchWriteItem`.
    ///
    /// Writes are unconditional and not atomic: a store failure part way
    /// leaves the earlier writes in place.
    pub async fn batch_write(
        &self,
        input: BatchWriteItemInput,
    ) -> Result<BatchWriteItemOutput, DynamoDBError> {
        let total_writes: usize = input.request_items.values().map(Vec::len).sum();
        if total_writes > MAX_BATCH_WRITE_REQUESTS {
            return Err(DynamoDBError::validation(format!(
                "Too many items in the BatchWriteItem request; \
                 the request length {total_writes} exceeds the limit of {MAX_BATCH_WRITE_REQUESTS}"
            )));
        }
        if input.request_items.is_empty() || input.request_items.values().any(Vec::is_empty) {
            return Err(length_error("requestItems"));
        }

        let mut table_names: Vec<&String> = input.request_items.keys().collect();
        table_names.sort();
        let schemas = table_names
            .iter()
            .map(|name| self.catalog.schema(name).map_err(catalog_error_to_dynamodb))
            .collect::<Result<Vec<_>, _>>()?;

        let mut tables = Vec::with_capacity(schemas.len());
        for (name, schema) in table_names.into_iter().zip(schemas) {
            let writes = input.request_items[name]
                .iter()
                .map(|request| write_op(&schema, request))
                .collect::<Result<Vec<_>, _>>()?;
            tables.push(TableWrite { schema, writes });
        }

        for table in tables {
            debug!(table = %table.schema.name, writes = table.writes.len(), "batch write");
            for write in table.writes {
                with_timeout(
                    self.config.request_timeout,
                    self.store.conditional_write(&table.schema, write, None),
                )
                .await
                .map_err(store_error_to_dynamodb)?;
            }
        }

        Ok(BatchWriteItemOutput {
            unprocessed_items: HashMap::new(),
        })
    }
}

pub(crate) fn length_error(member: &str) -> DynamoDBError {
    DynamoDBError::validation(format!(
        "1 validation error detected: Value at '{member}' failed to satisfy constraint: \
         Member must have length greater than or equal to 1"
    ))
}

pub(crate) fn key_values(
    schema: &TableSchema,
    key: &Item,
) -> Result<Vec<KeyValue>, DynamoDBError> {
    schema
        .key_schema
        .attributes()
        .map(|ka| {
            key.get(&ka.name)
                .ok_or_else(|| DynamoDBError::validation(format!("Missing the key {}", ka.name)))
                .and_then(|value| {
                    KeyValue::from_attribute(value).map_err(store_error_to_dynamodb)
                })
        })
        .collect()
}

fn write_op(schema: &TableSchema, request: &WriteRequest) -> Result<WriteOp, DynamoDBError> {
    match (&request.put_request, &request.delete_request) {
        (Some(put), None) => {
            validate_put_item(schema, &put.item)?;
            Ok(WriteOp::Put(put.item.clone()))
        }
        (None, Some(delete)) => {
            schema
                .key_schema
                .validate_key(&delete.key)
                .map_err(key_error_to_dynamodb)?;
            Ok(WriteOp::Delete(delete.key.clone()))
        }
        _ => Err(DynamoDBError::validation(
            "Supplied WriteRequest must contain exactly one of PutRequest or DeleteRequest",
        )),
    }
}
