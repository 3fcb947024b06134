//! Query and Scan planning.
//!
//! A read runs in four stages:
//!
//! 1. resolve the table (and index) and compile every expression, so that a
//!    bad placeholder fails before the store is touched;
//! 2. turn the key condition into a key-range request;
//! 3. page through the store, applying the filter to each row, until `Limit`
//!    rows have matched or the range is exhausted;
//! 4. project and count the matches, and mark the last one with a cursor
//!    when more rows remain.
//!
//! `Limit` bounds the rows matched, however many rows were examined to find
//! them: `Count` is at most `Limit` and `ScannedCount` includes the rows the
//! filter rejected on the way.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use dynamo_adapter_model::error::DynamoDBError;
use dynamo_adapter_model::input::{QueryInput, ScanInput};
use dynamo_adapter_model::output::{QueryOutput, ScanOutput};
use dynamo_adapter_model::types::Select;
use dynamo_adapter_model::{AttributeValue, Item};

use crate::catalog::{IndexSchema, SchemaCatalog, TableSchema};
use crate::config::AdapterConfig;
use crate::cursor::PaginationCursor;
use crate::error::{
    catalog_error_to_dynamodb, cursor_error_to_dynamodb, expression_error_to_dynamodb,
    store_error_to_dynamodb,
};
use crate::expression::{
    AttributePath, Expr, ExpressionContext, ExpressionInput, ExpressionKind, SortKeyCondition,
    plan_key_condition, project_item,
};
use crate::store::{BackingStore, RangeRequest, with_timeout};

/// Validate the `Select` parameter against the projection and index.
fn validate_select(
    select: Option<&Select>,
    has_projection: bool,
    has_index: bool,
) -> Result<(), DynamoDBError> {
    match select {
        Some(Select::AllProjectedAttributes) if !has_index => Err(DynamoDBError::validation(
            "ALL_PROJECTED_ATTRIBUTES is only supported for queries on secondary indexes",
        )),
        Some(Select::SpecificAttributes) if !has_projection => Err(DynamoDBError::validation(
            "SPECIFIC_ATTRIBUTES requires either ProjectionExpression or AttributesToGet",
        )),
        Some(sel @ (Select::AllAttributes | Select::Count)) if has_projection => {
            Err(DynamoDBError::validation(format!(
                "Cannot specify the ProjectionExpression when choosing to get {} results",
                sel.as_str()
            )))
        }
        _ => Ok(()),
    }
}

/// Everything a key-range read needs once the request has been validated.
struct ReadPlan<'a> {
    schema: &'a TableSchema,
    index: Option<&'a IndexSchema>,
    partition: Option<AttributeValue>,
    sort: Option<SortKeyCondition>,
    forward: bool,
    start: Option<PaginationCursor>,
    limit: usize,
}

/// Rows read for one page.
#[derive(Debug, Default)]
struct Examined {
    matched: Vec<Item>,
    scanned: usize,
    has_more: bool,
}

/// Result of a planned read, before it is shaped into a wire response.
#[derive(Debug)]
struct PageResult {
    items: Option<Vec<Item>>,
    count: i32,
    scanned_count: i32,
    last_evaluated_key: HashMap<String, AttributeValue>,
}

/// Plans and runs `Query` and `Scan` requests.
#[derive(Debug, Clone)]
pub struct QueryPlanner {
    catalog: Arc<dyn SchemaCatalog>,
    store: Arc<dyn BackingStore>,
    config: Arc<AdapterConfig>,
}

impl QueryPlanner {
    /// Create a planner over a catalog and store.
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

    /// Handle `Query`.
    pub async fn query(&self, input: QueryInput) -> Result<QueryOutput, DynamoDBError> {
        let schema = self
            .catalog
            .schema(&input.table_name)
            .map_err(catalog_error_to_dynamodb)?;
        let index = lookup_index(&schema, input.index_name.as_deref())?;
        validate_select(
            input.select.as_ref(),
            input.projection_expression.is_some(),
            index.is_some(),
        )?;
        let limit = self.page_limit(input.limit)?;

        let key_condition = input.key_condition_expression.as_deref().ok_or_else(|| {
            DynamoDBError::validation("KeyConditionExpression is required for Query")
        })?;
        let ctx = ExpressionContext::compile(
            ExpressionInput {
                key_condition: Some(key_condition),
                filter: input.filter_expression.as_deref(),
                projection: input.projection_expression.as_deref(),
                ..ExpressionInput::default()
            },
            &input.expression_attribute_names,
            &input.expression_attribute_values,
        )
        .map_err(expression_error_to_dynamodb)?;

        let key_expr = ctx.key_condition.as_ref().ok_or_else(|| {
            DynamoDBError::validation("KeyConditionExpression is required for Query")
        })?;
        let key_schema = index.map_or(&schema.key_schema, |idx| &idx.key_schema);
        let planned = plan_key_condition(key_expr, key_schema, ctx.values)
            .map_err(|e| expression_error_to_dynamodb(e.within(ExpressionKind::KeyCondition)))?;

        let plan = ReadPlan {
            schema: &schema,
            index,
            partition: Some(planned.partition_value),
            sort: planned.sort,
            forward: input.scan_index_forward.unwrap_or(true),
            start: start_cursor(&schema, index, &input.exclusive_start_key)?,
            limit,
        };
        debug!(
            table = %schema.name,
            index = index.map(|i| i.name.as_str()),
            partition_key = %planned.partition_key,
            sort = plan.sort.is_some(),
            forward = plan.forward,
            limit,
            "planned query"
        );

        let page = self.run(&plan, &ctx, input.select.as_ref()).await?;
        Ok(QueryOutput {
            items: page.items,
            count: page.count,
            scanned_count: page.scanned_count,
            last_evaluated_key: page.last_evaluated_key,
        })
    }

    /// Handle `Scan`.
    pub async fn scan(&self, input: ScanInput) -> Result<ScanOutput, DynamoDBError> {
        let schema = self
            .catalog
            .schema(&input.table_name)
            .map_err(catalog_error_to_dynamodb)?;
        let index = lookup_index(&schema, input.index_name.as_deref())?;
        validate_select(
            input.select.as_ref(),
            input.projection_expression.is_some(),
            index.is_some(),
        )?;
        let limit = self.page_limit(input.limit)?;

        let ctx = ExpressionContext::compile(
            ExpressionInput {
                filter: input.filter_expression.as_deref(),
                projection: input.projection_expression.as_deref(),
                ..ExpressionInput::default()
            },
            &input.expression_attribute_names,
            &input.expression_attribute_values,
        )
        .map_err(expression_error_to_dynamodb)?;

        let plan = ReadPlan {
            schema: &schema,
            index,
            partition: None,
            sort: None,
            forward: true,
            start: start_cursor(&schema, index, &input.exclusive_start_key)?,
            limit,
        };
        debug!(
            table = %schema.name,
            index = index.map(|i| i.name.as_str()),
            limit,
            "planned scan"
        );

        let page = self.run(&plan, &ctx, input.select.as_ref()).await?;
        Ok(ScanOutput {
            items: page.items,
            count: page.count,
            scanned_count: page.scanned_count,
            last_evaluated_key: page.last_evaluated_key,
        })
    }

    fn page_limit(&self, limit: Option<i32>) -> Result<usize, DynamoDBError> {
        match limit {
            Some(limit) if limit <= 0 => {
                Err(DynamoDBError::validation("Limit must be greater than 0"))
            }
            Some(limit) => Ok(usize::try_from(limit).unwrap_or(usize::MAX)),
            None => Ok(self.config.max_page_size),
        }
    }

    async fn run(
        &self,
        plan: &ReadPlan<'_>,
        ctx: &ExpressionContext<'_>,
        select: Option<&Select>,
    ) -> Result<PageResult, DynamoDBError> {
        let examined = self.examine(plan, ctx).await?;
        let scanned = examined.scanned;

        let last_evaluated_key = if examined.has_more {
            let offset = plan
                .start
                .as_ref()
                .map_or(0, |c| c.offset)
                .saturating_add(u64::try_from(scanned).unwrap_or(u64::MAX));
            examined
                .matched
                .last()
                .and_then(|row| PaginationCursor::for_row(plan.schema, plan.index, row, offset))
                .map(|cursor| cursor.to_key_map(plan.schema, plan.index))
                .unwrap_or_default()
        } else {
            HashMap::new()
        };

        let count = examined.matched.len();
        let items = if select == Some(&Select::Count) {
            None
        } else {
            Some(match &ctx.projection {
                Some(paths) => project_all(&examined.matched, paths),
                None => examined.matched,
            })
        };
        debug!(
            table = %plan.schema.name,
            scanned,
            count,
            has_more = examined.has_more,
            "read page"
        );

        Ok(PageResult {
            items,
            count: i32::try_from(count).unwrap_or(i32::MAX),
            scanned_count: i32::try_from(scanned).unwrap_or(i32::MAX),
            last_evaluated_key,
        })
    }

    /// Pull rows from the store until `plan.limit` rows have passed the
    /// filter or the key range is exhausted.
    ///
    /// Each request asks for one row more than the matches still needed, so
    /// a full page knows whether anything follows it. Rows after the last
    /// match are not examined; the first one found only sets `has_more`.
    /// Without sort-key pushdown the store returns the whole partition and
    /// rows outside the sort range are dropped here uncounted.
    async fn examine(
        &self,
        plan: &ReadPlan<'_>,
        ctx: &ExpressionContext<'_>,
    ) -> Result<Examined, DynamoDBError> {
        let pushdown = self.store.supports_sort_key_pushdown();
        let mut examined = Examined::default();
        let mut resume: Option<Item> = plan.start.as_ref().map(|c| c.key.clone());

        loop {
            let request = RangeRequest {
                index: plan.index,
                partition: plan.partition.as_ref(),
                sort: if pushdown { plan.sort.as_ref() } else { None },
                forward: plan.forward,
                exclusive_start: resume.as_ref(),
                limit: (plan.limit - examined.matched.len()).saturating_add(1),
            };
            let page = with_timeout(
                self.config.request_timeout,
                self.store.read_range(plan.schema, request),
            )
            .await
            .map_err(store_error_to_dynamodb)?;

            let store_has_more = page.has_more;
            resume = page.items.last().cloned();
            for row in page.items {
                if !pushdown && !in_sort_range(plan.sort.as_ref(), ctx, &row)? {
                    continue;
                }
                if examined.matched.len() == plan.limit {
                    examined.has_more = true;
                    return Ok(examined);
                }
                examined.scanned += 1;
                if passes_filter(ctx, &row)? {
                    examined.matched.push(row);
                }
            }
            if !store_has_more {
                return Ok(examined);
            }
        }
    }
}

fn lookup_index<'a>(
    schema: &'a TableSchema,
    name: Option<&str>,
) -> Result<Option<&'a IndexSchema>, DynamoDBError> {
    name.map(|name| {
        schema.index(name).ok_or_else(|| {
            DynamoDBError::validation(format!(
                "The table does not have the specified index: {name}"
            ))
        })
    })
    .transpose()
}

fn start_cursor(
    schema: &TableSchema,
    index: Option<&IndexSchema>,
    exclusive_start_key: &Item,
) -> Result<Option<PaginationCursor>, DynamoDBError> {
    if exclusive_start_key.is_empty() {
        return Ok(None);
    }
    PaginationCursor::from_key_map(schema, index, exclusive_start_key)
        .map(Some)
        .map_err(cursor_error_to_dynamodb)
}

fn in_sort_range(
    sort: Option<&SortKeyCondition>,
    ctx: &ExpressionContext<'_>,
    row: &Item,
) -> Result<bool, DynamoDBError> {
    let Some(sort) = sort else {
        return Ok(true);
    };
    eval_bound(ctx, &sort.expr, row)
}

fn passes_filter(ctx: &ExpressionContext<'_>, row: &Item) -> Result<bool, DynamoDBError> {
    let Some(filter) = &ctx.filter else {
        return Ok(true);
    };
    ctx.eval(row)
        .evaluate(filter)
        .map_err(|e| expression_error_to_dynamodb(e.within(ExpressionKind::Filter)))
}

fn eval_bound(ctx: &ExpressionContext<'_>, expr: &Expr, row: &Item) -> Result<bool, DynamoDBError> {
    ctx.eval(row)
        .evaluate(expr)
        .map_err(|e| expression_error_to_dynamodb(e.within(ExpressionKind::KeyCondition)))
}

fn project_all(rows: &[Item], paths: &[AttributePath]) -> Vec<Item> {
    rows.iter().map(|row| project_item(row, paths)).collect()
}
