//! `TransactWriteItems`.
//!
//! A transaction runs in three steps. Every action is validated and its
//! expressions compiled before anything is read. The current item of every
//! action is then read, conditions are evaluated against those snapshots and
//! the new items are computed. Finally the whole set goes to the store as one
//! [`BackingStore::transact_write`], each member guarded by its snapshot, so
//! either every write lands or none does.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};

use dynamo_adapter_model::error::{CancellationReason, DynamoDBError};
use dynamo_adapter_model::input::TransactWriteItemsInput;
use dynamo_adapter_model::output::TransactWriteItemsOutput;
use dynamo_adapter_model::types::TransactWriteItem;
use dynamo_adapter_model::{AttributeValue, Item};

use crate::batch::{key_values, length_error};
use crate::catalog::{SchemaCatalog, TableSchema};
use crate::config::AdapterConfig;
use crate::error::{
    CONDITIONAL_REQUEST_FAILED, catalog_error_to_dynamodb, expression_error_to_dynamodb,
    key_error_to_dynamodb, store_error_to_dynamodb,
};
use crate::expression::{ExpressionContext, ExpressionInput, ExpressionKind, apply_update};
use crate::provider::{validate_put_item, validate_update_targets};
use crate::store::{
    BackingStore, Precondition, TransactOutcome, TransactWrite, WriteOp, with_timeout,
};

/// Maximum actions in one `TransactWriteItems` call.
pub const MAX_TRANSACT_ITEMS: usize = 100;

/// What one action does to its item.
#[derive(Debug)]
enum Action {
    Check,
    Put(Item),
    Update,
    Delete,
}

/// One validated action of a transaction.
struct Member<'a> {
    schema: Arc<TableSchema>,
    key: Item,
    action: Action,
    ctx: ExpressionContext<'a>,
}

/// Borrowed view of the fields every action kind carries.
struct ActionInput<'a> {
    table_name: &'a str,
    condition: Option<&'a str>,
    update: Option<&'a str>,
    names: &'a HashMap<String, String>,
    values: &'a HashMap<String, AttributeValue>,
}

/// Runs transactional writes against a catalog and store.
#[derive(Debug, Clone)]
pub struct TransactionCoordinator {
    catalog: Arc<dyn SchemaCatalog>,
    store: Arc<dyn BackingStore>,
    config: Arc<AdapterConfig>,
}

impl TransactionCoordinator {
    /// Create a coordinator over a catalog and store.
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

    /// Handle `TransactWriteItems`.
    pub async fn transact_write(
        &self,
        input: TransactWriteItemsInput,
    ) -> Result<TransactWriteItemsOutput, DynamoDBError> {
        let total = input.transact_items.len();
        if total == 0 {
            return Err(length_error("transactItems"));
        }
        if total > MAX_TRANSACT_ITEMS {
            return Err(DynamoDBError::validation(format!(
                "1 validation error detected: Value at 'transactItems' failed to satisfy \
                 constraint: Member must have length less than or equal to {MAX_TRANSACT_ITEMS}"
            )));
        }

        let mut seen = HashSet::new();
        let mut members = Vec::with_capacity(total);
        for item in &input.transact_items {
            let member = self.prepare(item)?;
            let target = (
                member.schema.name.clone(),
                key_values(&member.schema, &member.key)?,
            );
            if !seen.insert(target) {
                return Err(DynamoDBError::validation(
                    "Transaction request cannot include multiple operations on one item",
                ));
            }
            members.push(member);
        }

        let mut snapshots = Vec::with_capacity(total);
        for member in &members {
            let snapshot = with_timeout(
                self.config.request_timeout,
                self.store.read_by_key(&member.schema, &member.key),
            )
            .await
            .map_err(store_error_to_dynamodb)?;
            snapshots.push(snapshot);
        }

        let mut failed = Vec::new();
        for (position, (member, snapshot)) in members.iter().zip(&snapshots).enumerate() {
            if !condition_holds(member, snapshot.as_ref())? {
                failed.push(position);
            }
        }
        if !failed.is_empty() {
            warn!(actions = total, ?failed, "transaction condition check failed");
            return Err(canceled(
                total,
                &failed,
                CancellationReason::CONDITIONAL_CHECK_FAILED,
                Some(CONDITIONAL_REQUEST_FAILED),
            ));
        }

        let writes = members
            .into_iter()
            .zip(snapshots)
            .map(|(member, snapshot)| plan_write(member, snapshot))
            .collect::<Result<Vec<_>, _>>()?;

        let outcome = with_timeout(
            self.config.request_timeout,
            self.store.transact_write(writes),
        )
        .await
        .map_err(store_error_to_dynamodb)?;
        match outcome {
            TransactOutcome::Applied => {
                debug!(actions = total, "transaction applied");
                Ok(TransactWriteItemsOutput::default())
            }
            TransactOutcome::Conflict(positions) => {
                warn!(actions = total, ?positions, "items changed during transaction");
                Err(canceled(
                    total,
                    &positions,
                    CancellationReason::TRANSACTION_CONFLICT,
                    None,
                ))
            }
        }
    }

    /// Validate one action and compile its expressions.
    fn prepare<'a>(&self, item: &'a TransactWriteItem) -> Result<Member<'a>, DynamoDBError> {
        let (action, key_or_item, fields) = match item {
            TransactWriteItem {
                condition_check: Some(check),
                put: None,
                update: None,
                delete: None,
            } => (
                Action::Check,
                &check.key,
                ActionInput {
                    table_name: &check.table_name,
                    condition: Some(check.condition_expression.as_str()),
                    update: None,
                    names: &check.expression_attribute_names,
                    values: &check.expression_attribute_values,
                },
            ),
            TransactWriteItem {
                condition_check: None,
                put: Some(put),
                update: None,
                delete: None,
            } => (
                Action::Put(put.item.clone()),
                &put.item,
                ActionInput {
                    table_name: &put.table_name,
                    condition: put.condition_expression.as_deref(),
                    update: None,
                    names: &put.expression_attribute_names,
                    values: &put.expression_attribute_values,
                },
            ),
            TransactWriteItem {
                condition_check: None,
                put: None,
                update: Some(update),
                delete: None,
            } => (
                Action::Update,
                &update.key,
                ActionInput {
                    table_name: &update.table_name,
                    condition: update.condition_expression.as_deref(),
                    update: Some(update.update_expression.as_str()),
                    names: &update.expression_attribute_names,
                    values: &update.expression_attribute_values,
                },
            ),
            TransactWriteItem {
                condition_check: None,
                put: None,
                update: None,
                delete: Some(delete),
            } => (
                Action::Delete,
                &delete.key,
                ActionInput {
                    table_name: &delete.table_name,
                    condition: delete.condition_expression.as_deref(),
                    update: None,
                    names: &delete.expression_attribute_names,
                    values: &delete.expression_attribute_values,
                },
            ),
            _ => {
                return Err(DynamoDBError::validation(
                    "TransactItems can only contain one of Check, Put, Update or Delete",
                ));
            }
        };

        let schema = self
            .catalog
            .schema(fields.table_name)
            .map_err(catalog_error_to_dynamodb)?;
        let key = match &action {
            Action::Put(new_item) => {
                validate_put_item(&schema, new_item)?;
                schema
                    .key_schema
                    .key_of(new_item)
                    .ok_or_else(|| DynamoDBError::validation("Item is missing a key attribute"))?
            }
            Action::Check | Action::Update | Action::Delete => {
                schema
                    .key_schema
                    .validate_key(key_or_item)
                    .map_err(key_error_to_dynamodb)?;
                key_or_item.clone()
            }
        };

        let ctx = ExpressionContext::compile(
            ExpressionInput {
                condition: fields.condition,
                update: fields.update,
                ..ExpressionInput::default()
            },
            fields.names,
            fields.values,
        )
        .map_err(expression_error_to_dynamodb)?;
        if let Some(update) = &ctx.update {
            validate_update_targets(&schema, update)?;
        }

        Ok(Member {
            schema,
            key,
            action,
            ctx,
        })
    }
}

/// Evaluate an action's condition against its snapshot; an absent item is
/// evaluated as an empty one.
fn condition_holds(member: &Member<'_>, snapshot: Option<&Item>) -> Result<bool, DynamoDBError> {
    let Some(condition) = &member.ctx.condition else {
        return Ok(true);
    };
    let empty = Item::new();
    member
        .ctx
        .eval(snapshot.unwrap_or(&empty))
        .evaluate(condition)
        .map_err(|e| expression_error_to_dynamodb(e.within(ExpressionKind::Condition)))
}

/// Turn a checked action into its store member.
///
/// Checks and updates are always guarded by the snapshot they were evaluated
/// against; puts and deletes only when they carry a condition.
fn plan_write(member: Member<'_>, snapshot: Option<Item>) -> Result<TransactWrite, DynamoDBError> {
    let conditional = member.ctx.condition.is_some();
    let (write, guarded) = match member.action {
        Action::Check => (None, true),
        Action::Put(item) => (Some(WriteOp::Put(item)), conditional),
        Action::Delete => (Some(WriteOp::Delete(member.key.clone())), conditional),
        Action::Update => {
            let base = snapshot.clone().unwrap_or_else(|| member.key.clone());
            let new_item = match &member.ctx.update {
                Some(update) => apply_update(&base, update, member.ctx.values)
                    .map_err(|e| expression_error_to_dynamodb(e.within(ExpressionKind::Update)))?,
                None => base,
            };
            // Nothing but the key on an absent item: nothing to store.
            if snapshot.is_none()
                && new_item.len() == member.schema.key_schema.attributes().count()
            {
                (None, true)
            } else {
                validate_put_item(&member.schema, &new_item)?;
                (Some(WriteOp::Put(new_item)), true)
            }
        }
    };
    Ok(TransactWrite {
        schema: member.schema,
        key: member.key,
        write,
        precondition: guarded.then(|| Precondition::Unchanged(snapshot)),
    })
}

/// `TransactionCanceledException` naming `code` for the failed positions and
/// `None` for every other action.
fn canceled(
    total: usize,
    failed: &[usize],
    code: &str,
    message: Option<&str>,
) -> DynamoDBError {
    let reasons = (0..total)
        .map(|position| {
            if failed.contains(&position) {
                CancellationReason {
                    code: code.to_owned(),
                    message: message.map(str::to_owned),
                }
            } else {
                CancellationReason {
                    code: CancellationReason::NONE.to_owned(),
                    message: None,
                }
            }
        })
        .collect();
    DynamoDBError::transaction_canceled(reasons)
}

#[cfg(test)]
mod tests {
    use dynamo_adapter_model::error::DynamoDBErrorCode;
    use dynamo_adapter_model::types::{ConditionCheck, Delete, Put, ScalarAttributeType, Update};

    use super::*;
    use crate::catalog::{KeyAttribute, KeySchema, MemoryCatalog};
    use crate::store::MemoryStore;
    use crate::store::testing::CountingStore;

    fn s(value: &str) -> AttributeValue {
        AttributeValue::S(value.to_owned())
    }

    fn n(value: &str) -> AttributeValue {
        AttributeValue::N(value.to_owned())
    }

    fn key(id: &str) -> Item {
        Item::from([("id".to_owned(), s(id))])
    }

    fn account(id: &str, balance: &str) -> Item {
        Item::from([("id".to_owned(), s(id)), ("balance".to_owned(), n(balance))])
    }

    fn amount(value: &str) -> HashMap<String, AttributeValue> {
        HashMap::from([(":amt".to_owned(), n(value))])
    }

    type Accounts = (
        TransactionCoordinator,
        Arc<CountingStore<MemoryStore>>,
        Arc<TableSchema>,
    );

    async fn setup() -> Accounts {
        let catalog = MemoryCatalog::new();
        catalog
            .register(TableSchema::new(
                "accounts",
                KeySchema::new(KeyAttribute::new("id", ScalarAttributeType::S), None),
            ))
            .expect("register");
        let schema = catalog.schema("accounts").expect("schema");
        let store = Arc::new(CountingStore::new(MemoryStore::for_catalog(&catalog)));
        for item in [account("alice", "100"), account("bob", "5")] {
            store
                .conditional_write(&schema, WriteOp::Put(item), None)
                .await
                .expect("seed");
        }
        let coordinator = TransactionCoordinator::new(
            Arc::new(catalog),
            Arc::clone(&store) as Arc<dyn BackingStore>,
            Arc::new(AdapterConfig::default()),
        );
        (coordinator, store, schema)
    }

    fn transfer(from: &str, to: &str, amt: &str) -> TransactWriteItemsInput {
        let leg = |id: &str, expression: &str, condition: Option<&str>| TransactWriteItem {
            update: Some(Update {
                table_name: "accounts".to_owned(),
                key: key(id),
                update_expression: expression.to_owned(),
                condition_expression: condition.map(str::to_owned),
                expression_attribute_values: amount(amt),
                ..Update::default()
            }),
            ..TransactWriteItem::default()
        };
        TransactWriteItemsInput {
            transact_items: vec![
                leg(from, "SET balance = balance - :amt", Some("balance >= :amt")),
                leg(to, "ADD balance :amt", None),
            ],
            ..TransactWriteItemsInput::default()
        }
    }

    async fn balance(
        store: &CountingStore<MemoryStore>,
        schema: &TableSchema,
        id: &str,
    ) -> AttributeValue {
        store
            .read_by_key(schema, &key(id))
            .await
            .expect("read")
            .expect("account")["balance"]
            .clone()
    }

    #[tokio::test]
    async fn test_should_apply_every_action_when_conditions_hold() {
        let (coordinator, store, schema) = setup().await;
        coordinator
            .transact_write(transfer("alice", "bob", "30"))
            .await
            .expect("transfer");
        assert_eq!(balance(&store, &schema, "alice").await, n("70"));
        assert_eq!(balance(&store, &schema, "bob").await, n("35"));
    }

    #[tokio::test]
    async fn test_should_write_nothing_when_one_condition_fails() {
        let (coordinator, store, schema) = setup().await;
        let writes_before = store.writes();

        let err = coordinator
            .transact_write(transfer("bob", "alice", "30"))
            .await
            .expect_err("insufficient balance");
        assert_eq!(err.code, DynamoDBErrorCode::TransactionCanceledException);
        let codes: Vec<&str> = err.cancellation_reasons.iter().map(|r| r.code.as_str()).collect();
        assert_eq!(codes, ["ConditionalCheckFailed", "None"]);
        assert_eq!(
            err.cancellation_reasons[0].message.as_deref(),
            Some(CONDITIONAL_REQUEST_FAILED)
        );
        assert_eq!(store.writes(), writes_before);
        assert_eq!(balance(&store, &schema, "alice").await, n("100"));
        assert_eq!(balance(&store, &schema, "bob").await, n("5"));
    }

    #[tokio::test]
    async fn test_should_combine_check_put_and_delete() {
        let (coordinator, store, schema) = setup().await;
        let input = TransactWriteItemsInput {
            transact_items: vec![
                TransactWriteItem {
                    condition_check: Some(ConditionCheck {
                        table_name: "accounts".to_owned(),
                        key: key("alice"),
                        condition_expression: "balance > :amt".to_owned(),
                        expression_attribute_values: amount("50"),
                        ..ConditionCheck::default()
                    }),
                    ..TransactWriteItem::default()
                },
                TransactWriteItem {
                    put: Some(Put {
                        table_name: "accounts".to_owned(),
                        item: account("carol", "0"),
                        condition_expression: Some("attribute_not_exists(id)".to_owned()),
                        ..Put::default()
                    }),
                    ..TransactWriteItem::default()
                },
                TransactWriteItem {
                    delete: Some(Delete {
                        table_name: "accounts".to_owned(),
                        key: key("bob"),
                        ..Delete::default()
                    }),
                    ..TransactWriteItem::default()
                },
            ],
            ..TransactWriteItemsInput::default()
        };
        coordinator.transact_write(input).await.expect("transaction");

        assert_eq!(balance(&store, &schema, "carol").await, n("0"));
        assert!(store.read_by_key(&schema, &key("bob")).await.expect("read").is_none());
        assert_eq!(balance(&store, &schema, "alice").await, n("100"));
    }

    #[tokio::test]
    async fn test_should_reject_malformed_transactions_before_reading() {
        let (coordinator, store, _) = setup().await;

        let err = coordinator
            .transact_write(TransactWriteItemsInput::default())
            .await
            .expect_err("empty");
        assert_eq!(err.code, DynamoDBErrorCode::ValidationException);

        let mut twice = transfer("alice", "bob", "1");
        twice.transact_items[1] = twice.transact_items[0].clone();
        let err = coordinator.transact_write(twice).await.expect_err("same item twice");
        assert_eq!(
            err.message,
            "Transaction request cannot include multiple operations on one item"
        );

        let mut two_actions = transfer("alice", "bob", "1");
        two_actions.transact_items[0].delete = Some(Delete {
            table_name: "accounts".to_owned(),
            key: key("alice"),
            ..Delete::default()
        });
        let err = coordinator.transact_write(two_actions).await.expect_err("two actions");
        assert_eq!(err.code, DynamoDBErrorCode::ValidationException);

        let mut key_update = transfer("alice", "bob", "1");
        if let Some(update) = key_update.transact_items[1].update.as_mut() {
            update.update_expression = "SET id = :amt".to_owned();
        }
        let err = coordinator.transact_write(key_update).await.expect_err("key update");
        assert_eq!(
            err.message,
            "Cannot update attribute (id). This attribute is part of the key"
        );

        assert_eq!(store.reads(), 0);
    }
}
