//! Key-condition analysis.
//!
//! A `KeyConditionExpression` is parsed with the condition grammar and then
//! checked here for the one shape a key-range read can serve: an equality on
//! the partition key, optionally `AND`-ed with a single range predicate on the
//! sort key. Operands may come in either order; `:v < sk` is normalized to
//! `sk > :v`.

use std::collections::HashMap;

use dynamo_adapter_model::AttributeValue;

use super::ast::{CompareOp, Expr, FunctionName, LogicalOp, Operand, PathElement};
use super::evaluator::compare_values;
use super::parser::ExpressionError;
use crate::catalog::{KeyAttribute, KeySchema};

/// The pushed-down form of a key condition.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyCondition {
    /// Partition key attribute name.
    pub partition_key: String,
    /// The exact partition key value.
    pub partition_value: AttributeValue,
    /// Optional sort-key predicate.
    pub sort: Option<SortKeyCondition>,
}

/// A range predicate on the sort key.
#[derive(Debug, Clone, PartialEq)]
pub struct SortKeyCondition {
    /// Sort key attribute name.
    pub attribute: String,
    /// The predicate, with literal values resolved.
    pub op: SortKeyOp,
    /// The bound conjunct this predicate came from, for evaluation against
    /// whole items when the store cannot push it down.
    pub expr: Expr,
}

/// Sort-key predicates a key condition may carry.
#[derive(Debug, Clone, PartialEq)]
pub enum SortKeyOp {
    /// `sk op :v` where `op` is one of `= < <= > >=`.
    Compare(CompareOp, AttributeValue),
    /// `sk BETWEEN :lo AND :hi`, inclusive.
    Between(AttributeValue, AttributeValue),
    /// `begins_with(sk, :prefix)`.
    BeginsWith(AttributeValue),
}

impl SortKeyCondition {
    /// Whether a sort key value satisfies the predicate.
    #[must_use]
    pub fn matches(&self, value: &AttributeValue) -> bool {
        let cmp = |op: CompareOp, bound: &AttributeValue| {
            compare_values(value, bound, op).unwrap_or(false)
        };
        match &self.op {
            SortKeyOp::Compare(op, bound) => cmp(*op, bound),
            SortKeyOp::Between(low, high) => cmp(CompareOp::Ge, low) && cmp(CompareOp::Le, high),
            SortKeyOp::BeginsWith(prefix) => match (value, prefix) {
                (AttributeValue::S(s), AttributeValue::S(p)) => s.starts_with(p.as_str()),
                (AttributeValue::B(b), AttributeValue::B(p)) => b.starts_with(p),
                _ => false,
            },
        }
    }
}

fn invalid(message: impl Into<String>) -> ExpressionError {
    ExpressionError::InvalidKeyCondition {
        message: message.into(),
    }
}

/// Which key attribute a conjunct constrains.
enum Target {
    Partition,
    Sort,
}

/// Split a bound key condition into its partition equality and optional
/// sort-key predicate, checking values against `key_schema`.
///
/// # Errors
///
/// Returns `InvalidKeyCondition` for any shape other than
/// `pk = :v [AND <sort predicate>]` and for values whose type does not match
/// the key schema.
pub fn plan_key_condition(
    expr: &Expr,
    key_schema: &KeySchema,
    values: &HashMap<String, AttributeValue>,
) -> Result<KeyCondition, ExpressionError> {
    let mut conjuncts = Vec::new();
    collect_conjuncts(expr, &mut conjuncts)?;

    let mut partition: Option<AttributeValue> = None;
    let mut sort: Option<SortKeyCondition> = None;

    for conjunct in conjuncts {
        match classify(conjunct, key_schema, values)? {
            (Target::Partition, SortKeyOp::Compare(CompareOp::Eq, value)) => {
                if partition.replace(value).is_some() {
                    return Err(invalid(
                        "KeyConditionExpressions must only contain one condition per key",
                    ));
                }
            }
            (Target::Partition, _) => return Err(invalid("Query key condition not supported")),
            (Target::Sort, op) => {
                let Some(sk) = &key_schema.sort_key else {
                    return Err(invalid("Query key condition not supported"));
                };
                let previous = sort.replace(SortKeyCondition {
                    attribute: sk.name.clone(),
                    op,
                    expr: conjunct.clone(),
                });
                if previous.is_some() {
                    return Err(invalid(
                        "KeyConditionExpressions must only contain one condition per key",
                    ));
                }
            }
        }
    }

    let Some(partition_value) = partition else {
        return Err(invalid(format!(
            "Query condition missed key schema element: {}",
            key_schema.partition_key.name
        )));
    };
    check_type(&partition_value, &key_schema.partition_key)?;
    if let (Some(cond), Some(sk)) = (&sort, &key_schema.sort_key) {
        check_sort_types(cond, sk)?;
    }

    Ok(KeyCondition {
        partition_key: key_schema.partition_key.name.clone(),
        partition_value,
        sort,
    })
}

fn collect_conjuncts<'e>(expr: &'e Expr, out: &mut Vec<&'e Expr>) -> Result<(), ExpressionError> {
    match expr {
        Expr::Logical {
            op: LogicalOp::And,
            left,
            right,
        } => {
            collect_conjuncts(left, out)?;
            collect_conjuncts(right, out)
        }
        Expr::Logical {
            op: LogicalOp::Or, ..
        } => Err(invalid("Unsupported operator in KeyConditionExpression: OR")),
        Expr::Not(_) => Err(invalid("Unsupported operator in KeyConditionExpression: NOT")),
        Expr::In { .. } => Err(invalid(
            "Unsupported operator on KeyConditionExpression: operator: IN",
        )),
        other => {
            out.push(other);
            Ok(())
        }
    }
}

fn classify(
    conjunct: &Expr,
    key_schema: &KeySchema,
    values: &HashMap<String, AttributeValue>,
) -> Result<(Target, SortKeyOp), ExpressionError> {
    match conjunct {
        Expr::Compare { left, op, right } => {
            let targets = (key_target(left, key_schema)?, key_target(right, key_schema)?);
            let (target, token, op) = match targets {
                (Some(target), None) => (target, literal(right)?, *op),
                (None, Some(target)) => (target, literal(left)?, op.flipped()),
                _ => return Err(invalid("Query key condition not supported")),
            };
            if op == CompareOp::Ne {
                return Err(invalid(
                    "Unsupported operator on KeyConditionExpression: operator: <>",
                ));
            }
            Ok((target, SortKeyOp::Compare(op, lookup(values, token)?)))
        }
        Expr::Between { value, low, high } => {
            let Some(target) = key_target(value, key_schema)? else {
                return Err(invalid("Query key condition not supported"));
            };
            let low = lookup(values, literal(low)?)?;
            let high = lookup(values, literal(high)?)?;
            if compare_values(&low, &high, CompareOp::Gt)? {
                return Err(ExpressionError::InvalidOperand {
                    message: format!(
                        "The BETWEEN operator requires upper bound to be greater than or equal to lower bound; lower bound operand: {low}, upper bound operand: {high}"
                    ),
                });
            }
            Ok((target, SortKeyOp::Between(low, high)))
        }
        Expr::Function {
            name: FunctionName::BeginsWith,
            args,
        } => {
            let (Some(path), Some(prefix)) = (args.first(), args.get(1)) else {
                return Err(invalid("Query key condition not supported"));
            };
            let Some(target) = key_target(path, key_schema)? else {
                return Err(invalid("Query key condition not supported"));
            };
            Ok((target, SortKeyOp::BeginsWith(lookup(values, literal(prefix)?)?)))
        }
        Expr::Function { name, .. } => Err(invalid(format!(
            "Unsupported function in KeyConditionExpression: {name}"
        ))),
        Expr::Logical { .. } | Expr::Not(_) | Expr::In { .. } => {
            Err(invalid("Query key condition not supported"))
        }
    }
}

/// If `operand` is a path, the key attribute it names. Non-key and nested
/// paths are rejected; non-path operands yield `None`.
fn key_target(
    operand: &Operand,
    key_schema: &KeySchema,
) -> Result<Option<Target>, ExpressionError> {
    let path = match operand {
        Operand::Path(path) => path,
        Operand::Size(_) => return Err(invalid("Query key condition not supported")),
        Operand::Value(_) => return Ok(None),
    };
    if !path.is_top_level() {
        return Err(invalid(
            "Key condition expression does not support nested attribute paths",
        ));
    }
    let Some(PathElement::Attribute(name)) = path.elements.first() else {
        return Err(invalid("Query key condition not supported"));
    };
    if *name == key_schema.partition_key.name {
        Ok(Some(Target::Partition))
    } else if key_schema.sort_key.as_ref().is_some_and(|sk| sk.name == *name) {
        Ok(Some(Target::Sort))
    } else {
        Err(invalid(format!(
            "Query condition missed key schema element: {}",
            key_schema.partition_key.name
        )))
    }
}

fn literal(operand: &Operand) -> Result<&str, ExpressionError> {
    match operand {
        Operand::Value(token) => Ok(token),
        _ => Err(invalid("Query key condition not supported")),
    }
}

fn lookup(
    values: &HashMap<String, AttributeValue>,
    token: &str,
) -> Result<AttributeValue, ExpressionError> {
    values
        .get(token)
        .cloned()
        .ok_or_else(|| ExpressionError::UnresolvedAttributeValue {
            name: token.to_owned(),
        })
}

fn check_type(value: &AttributeValue, key: &KeyAttribute) -> Result<(), ExpressionError> {
    if key.attribute_type.matches(value) {
        Ok(())
    } else {
        Err(invalid(format!(
            "Condition parameter type does not match schema type for key attribute '{}'",
            key.name
        )))
    }
}

fn check_sort_types(cond: &SortKeyCondition, sk: &KeyAttribute) -> Result<(), ExpressionError> {
    match &cond.op {
        SortKeyOp::Compare(_, value) => check_type(value, sk),
        SortKeyOp::Between(low, high) => {
            check_type(low, sk)?;
            check_type(high, sk)
        }
        SortKeyOp::BeginsWith(prefix) => {
            if !matches!(prefix, AttributeValue::S(_) | AttributeValue::B(_)) {
                return Err(ExpressionError::type_mismatch(
                    FunctionName::BeginsWith,
                    prefix.type_descriptor(),
                ));
            }
            check_type(prefix, sk)
        }
    }
}
