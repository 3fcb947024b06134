//! Adapter provider: single-item operations and the wiring of everything.
//!
//! Conditional writes are check-then-write: the provider reads a snapshot of
//! the stored item, evaluates the condition and computes the new item, then
//! hands the write to the store guarded by [`Precondition::Unchanged`]. A
//! concurrent change between the read and the write makes the store report
//! `PredicateFailed`, which surfaces exactly like a false condition.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use dynamo_adapter_model::attribute_value::item_size;
use dynamo_adapter_model::error::DynamoDBError;
use dynamo_adapter_model::input::{
    BatchGetItemInput, BatchWriteItemInput, DeleteItemInput, GetItemInput, PutItemInput,
    QueryInput, ScanInput, TransactWriteItemsInput, UpdateItemInput,
};
use dynamo_adapter_model::output::{
    BatchGetItemOutput, BatchWriteItemOutput, DeleteItemOutput, GetItemOutput, PutItemOutput,
    QueryOutput, ScanOutput, TransactWriteItemsOutput, UpdateItemOutput,
};
use dynamo_adapter_model::types::ReturnValue;
use dynamo_adapter_model::Item;

use crate::batch::BatchOrchestrator;
use crate::catalog::{MemoryCatalog, SchemaCatalog, TableSchema};
use crate::config::AdapterConfig;
use crate::error::{
    CONDITIONAL_REQUEST_FAILED, catalog_error_to_dynamodb, expression_error_to_dynamodb,
    key_error_to_dynamodb, store_error_to_dynamodb,
};
use crate::expression::{
    AttributePath, ExpressionContext, ExpressionInput, ExpressionKind, UpdateExpr, apply_update,
    project_item,
};
use crate::planner::QueryPlanner;
use crate::store::{BackingStore, MemoryStore, Precondition, WriteOp, WriteOutcome, with_timeout};
use crate::transaction::TransactionCoordinator;

/// Maximum item size in bytes (400 KB).
pub const MAX_ITEM_SIZE_BYTES: u64 = 400 * 1024;

/// Check an item about to be stored: key attributes present and typed,
/// index key attributes typed when present, values well formed, size within
/// [`MAX_ITEM_SIZE_BYTES`].
pub(crate) fn validate_put_item(schema: &TableSchema, item: &Item) -> Result<(), DynamoDBError> {
    schema
        .key_schema
        .validate_item(item)
        .map_err(key_error_to_dynamodb)?;
    for ka in schema.indexes.values().flat_map(|idx| idx.key_schema.attributes()) {
        if let Some(value) = item.get(&ka.name) {
            ka.check(value).map_err(key_error_to_dynamodb)?;
        }
    }
    for value in item.values() {
        value
            .validate()
            .map_err(|e| DynamoDBError::validation(e.to_string()))?;
    }
    if item_size(item) > MAX_ITEM_SIZE_BYTES {
        return Err(DynamoDBError::validation(format!(
            "Item size has exceeded the maximum allowed size of {MAX_ITEM_SIZE_BYTES} bytes"
        )));
    }
    Ok(())
}

/// `PutItem` and `DeleteItem` only return the old item.
fn validate_old_only_return_values(rv: Option<&ReturnValue>) -> Result<(), DynamoDBError> {
    match rv {
        None | Some(ReturnValue::None | ReturnValue::AllOld) => Ok(()),
        Some(rv) => Err(DynamoDBError::validation(format!(
            "Return values set to invalid value for this operation: {rv}"
        ))),
    }
}

/// Reject update targets that name a key attribute.
pub(crate) fn validate_update_targets(
    schema: &TableSchema,
    update: &UpdateExpr,
) -> Result<(), DynamoDBError> {
    for path in update.target_paths() {
        if let Some(name) = path.root_name() {
            if path.is_top_level() && schema.key_schema.is_key_attribute(name) {
                return Err(DynamoDBError::validation(format!(
                    "Cannot update attribute ({name}). This attribute is part of the key"
                )));
            }
        }
    }
    Ok(())
}

fn update_return_values(
    rv: Option<&ReturnValue>,
    update: Option<&UpdateExpr>,
    old: Option<&Item>,
    new: &Item,
) -> Item {
    let targets = || -> Vec<AttributePath> {
        update
            .map(|u| u.target_paths().into_iter().cloned().collect())
            .unwrap_or_default()
    };
    match rv {
        None | Some(ReturnValue::None) => HashMap::new(),
        Some(ReturnValue::AllOld) => old.cloned().unwrap_or_default(),
        Some(ReturnValue::AllNew) => new.clone(),
        Some(ReturnValue::UpdatedOld) => old.map(|o| project_item(o, &targets())).unwrap_or_default(),
        Some(ReturnValue::UpdatedNew) => project_item(new, &targets()),
    }
}

/// The adapter: resolves schemas, compiles expressions and drives the
/// backing store for every operation.
#[derive(Debug, Clone)]
pub struct DynamoAdapter {
    catalog: Arc<dyn SchemaCatalog>,
    store: Arc<dyn BackingStore>,
    config: Arc<AdapterConfig>,
    planner: QueryPlanner,
    batch: BatchOrchestrator,
    transactions: TransactionCoordinator,
}

impl DynamoAdapter {
    /// Create an adapter over a catalog and a backing store.
    #[must_use]
    pub fn new(
        catalog: Arc<dyn SchemaCatalog>,
        store: Arc<dyn BackingStore>,
        config: AdapterConfig,
    ) -> Self {
        let config = Arc::new(config);
        Self {
            planner: QueryPlanner::new(
                Arc::clone(&catalog),
                Arc::clone(&store),
                Arc::clone(&config),
            ),
            batch: BatchOrchestrator::new(
                Arc::clone(&catalog),
                Arc::clone(&store),
                Arc::clone(&config),
            ),
            transactions: TransactionCoordinator::new(
                Arc::clone(&catalog),
                Arc::clone(&store),
                Arc::clone(&config),
            ),
            catalog,
            store,
            config,
        }
    }

    /// Create an adapter backed by memory, with tables from
    /// [`AdapterConfig::tables_file`] when it is set.
    pub fn in_memory(config: AdapterConfig) -> anyhow::Result<Self> {
        let catalog = match &config.tables_file {
            Some(path) => MemoryCatalog::from_file(path)?,
            None => MemoryCatalog::new(),
        };
        let store = MemoryStore::for_catalog(&catalog);
        Ok(Self::new(Arc::new(catalog), Arc::new(store), config))
    }

    /// Returns the adapter configuration.
    #[must_use]
    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    fn schema(&self, table: &str) -> Result<Arc<TableSchema>, DynamoDBError> {
        self.catalog.schema(table).map_err(catalog_error_to_dynamodb)
    }

    async fn read(&self, schema: &TableSchema, key: &Item) -> Result<Option<Item>, DynamoDBError> {
        with_timeout(self.config.request_timeout, self.store.read_by_key(schema, key))
            .await
            .map_err(store_error_to_dynamodb)
    }

    async fn write(
        &self,
        schema: &TableSchema,
        write: WriteOp,
        precondition: Option<Precondition>,
    ) -> Result<(), DynamoDBError> {
        let outcome = with_timeout(
            self.config.request_timeout,
            self.store.conditional_write(schema, write, precondition),
        )
        .await
        .map_err(store_error_to_dynamodb)?;
        match outcome {
            WriteOutcome::Applied => Ok(()),
            WriteOutcome::PredicateFailed => {
                warn!(table = %schema.name, "item changed between read and write");
                Err(DynamoDBError::conditional_check_failed(
                    CONDITIONAL_REQUEST_FAILED,
                ))
            }
        }
    }

    /// Evaluate the request's `ConditionExpression` against the snapshot; an
    /// absent item is evaluated as an empty one.
    fn check_condition(
        schema: &TableSchema,
        ctx: &ExpressionContext<'_>,
        snapshot: Option<&Item>,
    ) -> Result<(), DynamoDBError> {
        let Some(condition) = &ctx.condition else {
            return Ok(());
        };
        let empty = Item::new();
        let holds = ctx
            .eval(snapshot.unwrap_or(&empty))
            .evaluate(condition)
            .map_err(|e| expression_error_to_dynamodb(e.within(ExpressionKind::Condition)))?;
        if holds {
            Ok(())
        } else {
            warn!(table = %schema.name, exists = snapshot.is_some(), "condition check failed");
            Err(DynamoDBError::conditional_check_failed(
                CONDITIONAL_REQUEST_FAILED,
            ))
        }
    }

    /// Handle `GetItem`.
    pub async fn handle_get_item(&self, input: GetItemInput) -> Result<GetItemOutput, DynamoDBError> {
        let schema = self.schema(&input.table_name)?;
        schema
            .key_schema
            .validate_key(&input.key)
            .map_err(key_error_to_dynamodb)?;
        let no_values = HashMap::new();
        let ctx = ExpressionContext::compile(
            ExpressionInput {
                projection: input.projection_expression.as_deref(),
                ..ExpressionInput::default()
            },
            &input.expression_attribute_names,
            &no_values,
        )
        .map_err(expression_error_to_dynamodb)?;

        let item = self.read(&schema, &input.key).await?;
        let item = match (&ctx.projection, item) {
            (Some(paths), Some(item)) => Some(project_item(&item, paths)),
            (_, item) => item,
        };
        debug!(table = %schema.name, found = item.is_some(), "get item");
        Ok(GetItemOutput { item })
    }

    /// Handle `PutItem`.
    pub async fn handle_put_item(&self, input: PutItemInput) -> Result<PutItemOutput, DynamoDBError> {
        let schema = self.schema(&input.table_name)?;
        validate_old_only_return_values(input.return_values.as_ref())?;
        validate_put_item(&schema, &input.item)?;
        let ctx = ExpressionContext::compile(
            ExpressionInput {
                condition: input.condition_expression.as_deref(),
                ..ExpressionInput::default()
            },
            &input.expression_attribute_names,
            &input.expression_attribute_values,
        )
        .map_err(expression_error_to_dynamodb)?;

        let wants_old = input.return_values == Some(ReturnValue::AllOld);
        let conditional = ctx.condition.is_some();
        let snapshot = if conditional || wants_old {
            let key = schema.key_schema.key_of(&input.item).unwrap_or_default();
            self.read(&schema, &key).await?
        } else {
            None
        };
        Self::check_condition(&schema, &ctx, snapshot.as_ref())?;

        let precondition = conditional.then(|| Precondition::Unchanged(snapshot.clone()));
        self.write(&schema, WriteOp::Put(input.item), precondition)
            .await?;
        debug!(table = %schema.name, conditional, "put item");

        Ok(PutItemOutput {
            attributes: if wants_old {
                snapshot.unwrap_or_default()
            } else {
                HashMap::new()
            },
        })
    }

    /// Handle `DeleteItem`.
    pub async fn handle_delete_item(
        &self,
        input: DeleteItemInput,
    ) -> Result<DeleteItemOutput, DynamoDBError> {
        let schema = self.schema(&input.table_name)?;
        validate_old_only_return_values(input.return_values.as_ref())?;
        schema
            .key_schema
            .validate_key(&input.key)
            .map_err(key_error_to_dynamodb)?;
        let ctx = ExpressionContext::compile(
            ExpressionInput {
                condition: input.condition_expression.as_deref(),
                ..ExpressionInput::default()
            },
            &input.expression_attribute_names,
            &input.expression_attribute_values,
        )
        .map_err(expression_error_to_dynamodb)?;

        let wants_old = input.return_values == Some(ReturnValue::AllOld);
        let conditional = ctx.condition.is_some();
        let snapshot = if conditional || wants_old {
            self.read(&schema, &input.key).await?
        } else {
            None
        };
        Self::check_condition(&schema, &ctx, snapshot.as_ref())?;

        let precondition = conditional.then(|| Precondition::Unchanged(snapshot.clone()));
        self.write(&schema, WriteOp::Delete(input.key), precondition)
            .await?;
        debug!(table = %schema.name, conditional, "delete item");

        Ok(DeleteItemOutput {
            attributes: if wants_old {
                snapshot.unwrap_or_default()
            } else {
                HashMap::new()
            },
        })
    }

    /// Handle `UpdateItem`.
    ///
    /// The update is always a read-modify-write guarded by the snapshot, so
    /// concurrent `ADD`s on the same item never lose an increment silently.
    pub async fn handle_update_item(
        &self,
        input: UpdateItemInput,
    ) -> Result<UpdateItemOutput, DynamoDBError> {
        let schema = self.schema(&input.table_name)?;
        schema
            .key_schema
            .validate_key(&input.key)
            .map_err(key_error_to_dynamodb)?;
        let ctx = ExpressionContext::compile(
            ExpressionInput {
                condition: input.condition_expression.as_deref(),
                update: input.update_expression.as_deref(),
                ..ExpressionInput::default()
            },
            &input.expression_attribute_names,
            &input.expression_attribute_values,
        )
        .map_err(expression_error_to_dynamodb)?;
        if let Some(update) = &ctx.update {
            validate_update_targets(&schema, update)?;
        }

        let snapshot = self.read(&schema, &input.key).await?;
        Self::check_condition(&schema, &ctx, snapshot.as_ref())?;

        let base = snapshot.clone().unwrap_or_else(|| input.key.clone());
        let new_item = match &ctx.update {
            Some(update) => apply_update(&base, update, ctx.values)
                .map_err(|e| expression_error_to_dynamodb(e.within(ExpressionKind::Update)))?,
            None => base,
        };

        // Nothing but the key on an absent item: nothing to store.
        if snapshot.is_none() && new_item.len() == schema.key_schema.attributes().count() {
            debug!(table = %schema.name, "update left only the key; item not created");
            return Ok(UpdateItemOutput::default());
        }
        validate_put_item(&schema, &new_item)?;

        self.write(
            &schema,
            WriteOp::Put(new_item.clone()),
            Some(Precondition::Unchanged(snapshot.clone())),
        )
        .await?;
        debug!(table = %schema.name, created = snapshot.is_none(), "update item");

        Ok(UpdateItemOutput {
            attributes: update_return_values(
                input.return_values.as_ref(),
                ctx.update.as_ref(),
                snapshot.as_ref(),
                &new_item,
            ),
        })
    }

    /// Handle `Query`.
    pub async fn handle_query(&self, input: QueryInput) -> Result<QueryOutput, DynamoDBError> {
        self.planner.query(input).await
    }

    /// Handle `Scan`.
    pub async fn handle_scan(&self, input: ScanInput) -> Result<ScanOutput, DynamoDBError> {
        self.planner.scan(input).await
    }

    /// Handle `BatchGetItem`.
    pub async fn handle_batch_get_item(
        &self,
        input: BatchGetItemInput,
    ) -> Result<BatchGetItemOutput, DynamoDBError> {
        self.batch.batch_get(input).await
    }

    /// Handle `BatchWriteItem`.
    pub async fn handle_batch_write_item(
        &self,
        input: BatchWriteItemInput,
    ) -> Result<BatchWriteItemOutput, DynamoDBError> {
        self.batch.batch_write(input).await
    }

    /// Handle `TransactWriteItems`.
    pub async fn handle_transact_write_items(
        &self,
        input: TransactWriteItemsInput,
    ) -> Result<TransactWriteItemsOutput, DynamoDBError> {
        self.transactions.transact_write(input).await
    }
}
