//! Update expression application.
//!
//! Every right-hand side is computed against the unmodified item first. The
//! results are then written in a fixed order: SET, ADD, DELETE, and finally
//! REMOVE with list indexes taken highest first. Target paths are disjoint
//! (the binder rejects overlaps), so the textual clause order never changes
//! the outcome.

use std::borrow::Cow;
use std::collections::HashMap;

use dynamo_adapter_model::{AttributeValue, Item, Number};

use super::ast::{AttributePath, Operand, PathElement, SetValue, UpdateExpr};
use super::evaluator::{EvalContext, resolve_path};
use super::parser::ExpressionError;

const MISSING_OPERAND: &str =
    "The provided expression refers to an attribute that does not exist in the item";
const INVALID_DOCUMENT_PATH: &str =
    "The document path provided in the update expression is invalid for update";

/// Apply a bound update expression to `base`, returning the new item.
///
/// `base` is the stored item, or an item holding only the key when nothing is
/// stored yet.
///
/// # Errors
///
/// Returns `TypeMismatch` for operands of the wrong type, `InvalidOperand` when
/// an operand path is missing or a nested target has no parent, and
/// `InvalidNumber` when arithmetic leaves the supported number range.
pub fn apply_update(
    base: &Item,
    update: &UpdateExpr,
    values: &HashMap<String, AttributeValue>,
) -> Result<Item, ExpressionError> {
    let ctx = EvalContext { item: base, values };

    let sets = update
        .set_actions
        .iter()
        .map(|action| Ok((&action.path, eval_set_value(&ctx, &action.value)?)))
        .collect::<Result<Vec<_>, ExpressionError>>()?;
    let adds = update
        .add_actions
        .iter()
        .map(|action| {
            let operand = require(&ctx, &action.value)?;
            let value = add_value(resolve_path(base, &action.path), operand.into_owned())?;
            Ok((&action.path, value))
        })
        .collect::<Result<Vec<_>, ExpressionError>>()?;
    let deletes = update
        .delete_actions
        .iter()
        .map(|action| {
            let operand = require(&ctx, &action.value)?;
            let value = delete_value(resolve_path(base, &action.path), &operand)?;
            Ok((&action.path, value))
        })
        .collect::<Result<Vec<_>, ExpressionError>>()?;

    let mut item = base.clone();
    for (path, value) in sets.into_iter().chain(adds) {
        assign(&mut item, path, value)?;
    }
    for (path, value) in deletes {
        match value {
            DeleteResult::Unchanged => {}
            DeleteResult::Replace(value) => assign(&mut item, path, value)?,
            DeleteResult::Emptied => remove(&mut item, path),
        }
    }

    let mut removals: Vec<&AttributePath> = update.remove_paths.iter().collect();
    removals.sort_by(|a, b| b.elements.cmp(&a.elements));
    for path in removals {
        remove(&mut item, path);
    }

    Ok(item)
}

fn require<'a>(
    ctx: &EvalContext<'a>,
    operand: &Operand,
) -> Result<Cow<'a, AttributeValue>, ExpressionError> {
    ctx.resolve_operand(operand)?
        .ok_or_else(|| ExpressionError::InvalidOperand {
            message: MISSING_OPERAND.to_owned(),
        })
}

fn eval_set_value(ctx: &EvalContext<'_>, value: &SetValue) -> Result<AttributeValue, ExpressionError> {
    match value {
        SetValue::Operand(operand) => require(ctx, operand).map(Cow::into_owned),
        SetValue::Plus(a, b) => arithmetic(ctx, a, b, "+"),
        SetValue::Minus(a, b) => arithmetic(ctx, a, b, "-"),
        SetValue::IfNotExists(path, default) => match resolve_path(ctx.item, path) {
            Some(existing) => Ok(existing.clone()),
            None => eval_set_value(ctx, default),
        },
        SetValue::ListAppend(a, b) => {
            let first = eval_set_value(ctx, a)?;
            let second = eval_set_value(ctx, b)?;
            match (first, second) {
                (AttributeValue::L(mut head), AttributeValue::L(tail)) => {
                    head.extend(tail);
                    Ok(AttributeValue::L(head))
                }
                (AttributeValue::L(_), other) | (other, _) => Err(ExpressionError::type_mismatch(
                    "list_append",
                    other.type_descriptor(),
                )),
            }
        }
    }
}

fn arithmetic(
    ctx: &EvalContext<'_>,
    a: &SetValue,
    b: &SetValue,
    op: &str,
) -> Result<AttributeValue, ExpressionError> {
    let left = as_number(&eval_set_value(ctx, a)?, op)?;
    let right = as_number(&eval_set_value(ctx, b)?, op)?;
    let result = if op == "+" {
        left.checked_add(&right)?
    } else {
        left.checked_sub(&right)?
    };
    Ok(AttributeValue::number(&result))
}

fn as_number(value: &AttributeValue, op: &str) -> Result<Number, ExpressionError> {
    match value {
        AttributeValue::N(n) => Ok(Number::parse(n)?),
        other => Err(ExpressionError::type_mismatch(op, other.type_descriptor())),
    }
}

/// New value for `ADD path operand`.
fn add_value(
    existing: Option<&AttributeValue>,
    operand: AttributeValue,
) -> Result<AttributeValue, ExpressionError> {
    match (existing, operand) {
        (None, AttributeValue::N(n)) => Ok(AttributeValue::number(&Number::parse(&n)?)),
        (None, set @ (AttributeValue::Ss(_) | AttributeValue::Ns(_) | AttributeValue::Bs(_))) => {
            Ok(set)
        }
        (Some(AttributeValue::N(current)), AttributeValue::N(delta)) => {
            let sum = Number::parse(current)?.checked_add(&Number::parse(&delta)?)?;
            Ok(AttributeValue::number(&sum))
        }
        (Some(AttributeValue::Ss(current)), AttributeValue::Ss(extra)) => {
            Ok(AttributeValue::Ss(union(current, extra, |a, b| a == b)))
        }
        (Some(AttributeValue::Ns(current)), AttributeValue::Ns(extra)) => {
            Ok(AttributeValue::Ns(union(current, extra, |a, b| same_number(a, b))))
        }
        (Some(AttributeValue::Bs(current)), AttributeValue::Bs(extra)) => {
            Ok(AttributeValue::Bs(union(current, extra, |a, b| a == b)))
        }
        (Some(current), operand) => {
            let found = if matches!(
                operand,
                AttributeValue::N(_) | AttributeValue::Ss(_) | AttributeValue::Ns(_) | AttributeValue::Bs(_)
            ) {
                current.type_descriptor()
            } else {
                operand.type_descriptor()
            };
            Err(ExpressionError::type_mismatch("ADD", found))
        }
        (None, operand) => Err(ExpressionError::type_mismatch(
            "ADD",
            operand.type_descriptor(),
        )),
    }
}

enum DeleteResult {
    Unchanged,
    Replace(AttributeValue),
    Emptied,
}

/// New value for `DELETE path operand`.
fn delete_value(
    existing: Option<&AttributeValue>,
    operand: &AttributeValue,
) -> Result<DeleteResult, ExpressionError> {
    if !operand.is_set() {
        return Err(ExpressionError::type_mismatch(
            "DELETE",
            operand.type_descriptor(),
        ));
    }
    let Some(current) = existing else {
        return Ok(DeleteResult::Unchanged);
    };
    let remaining = match (current, operand) {
        (AttributeValue::Ss(have), AttributeValue::Ss(drop)) => {
            AttributeValue::Ss(difference(have, drop, |a, b| a == b))
        }
        (AttributeValue::Ns(have), AttributeValue::Ns(drop)) => {
            AttributeValue::Ns(difference(have, drop, |a, b| same_number(a, b)))
        }
        (AttributeValue::Bs(have), AttributeValue::Bs(drop)) => {
            AttributeValue::Bs(difference(have, drop, |a, b| a == b))
        }
        (other, _) => {
            return Err(ExpressionError::type_mismatch(
                "DELETE",
                other.type_descriptor(),
            ));
        }
    };
    let emptied = match &remaining {
        AttributeValue::Ss(v) | AttributeValue::Ns(v) => v.is_empty(),
        AttributeValue::Bs(v) => v.is_empty(),
        _ => false,
    };
    Ok(if emptied {
        DeleteResult::Emptied
    } else {
        DeleteResult::Replace(remaining)
    })
}

fn same_number(a: &str, b: &str) -> bool {
    match (Number::parse(a), Number::parse(b)) {
        (Ok(x), Ok(y)) => x == y,
        _ => a == b,
    }
}

fn union<T: Clone>(current: &[T], extra: Vec<T>, eq: impl Fn(&T, &T) -> bool) -> Vec<T> {
    let mut merged = current.to_vec();
    for element in extra {
        if !merged.iter().any(|m| eq(m, &element)) {
            merged.push(element);
        }
    }
    merged
}

fn difference<T: Clone>(current: &[T], drop: &[T], eq: impl Fn(&T, &T) -> bool) -> Vec<T> {
    current
        .iter()
        .filter(|c| !drop.iter().any(|d| eq(c, d)))
        .cloned()
        .collect()
}

// ---------------------------------------------------------------------------
// Path writes
// ---------------------------------------------------------------------------

fn invalid_path() -> ExpressionError {
    ExpressionError::InvalidOperand {
        message: INVALID_DOCUMENT_PATH.to_owned(),
    }
}

/// Navigate to the container holding the last element of `path`.
fn parent_mut<'i, 'p>(
    item: &'i mut Item,
    path: &'p AttributePath,
) -> Option<(&'i mut AttributeValue, &'p PathElement)> {
    let (last, init) = path.elements.split_last()?;
    let (head, middle) = init.split_first()?;
    let PathElement::Attribute(name) = head else {
        return None;
    };
    let mut current = item.get_mut(name)?;
    for element in middle {
        current = match (element, current) {
            (PathElement::Attribute(key), AttributeValue::M(map)) => map.get_mut(key)?,
            (PathElement::Index(idx), AttributeValue::L(list)) => list.get_mut(*idx)?,
            _ => return None,
        };
    }
    Some((current, last))
}

fn assign(item: &mut Item, path: &AttributePath, value: AttributeValue) -> Result<(), ExpressionError> {
    if let [PathElement::Attribute(name)] = path.elements.as_slice() {
        item.insert(name.clone(), value);
        return Ok(());
    }
    let (parent, last) = parent_mut(item, path).ok_or_else(invalid_path)?;
    match (last, parent) {
        (PathElement::Attribute(key), AttributeValue::M(map)) => {
            map.insert(key.clone(), value);
        }
        (PathElement::Index(idx), AttributeValue::L(list)) => {
            if let Some(slot) = list.get_mut(*idx) {
                *slot = value;
            } else {
                list.push(value);
            }
        }
        _ => return Err(invalid_path()),
    }
    Ok(())
}

fn remove(item: &mut Item, path: &AttributePath) {
    if let [PathElement::Attribute(name)] = path.elements.as_slice() {
        item.remove(name);
        return;
    }
    let Some((parent, last)) = parent_mut(item, path) else {
        return;
    };
    match (last, parent) {
        (PathElement::Attribute(key), AttributeValue::M(map)) => {
            map.remove(key);
        }
        (PathElement::Index(idx), AttributeValue::L(list)) => {
            if *idx < list.len() {
                list.remove(*idx);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::binder::Binder;
    use crate::expression::parser::parse_update;

    fn n(v: &str) -> AttributeValue {
        AttributeValue::N(v.to_owned())
    }

    fn s(v: &str) -> AttributeValue {
        AttributeValue::S(v.to_owned())
    }

    fn ss(v: &[&str]) -> AttributeValue {
        AttributeValue::Ss(v.iter().map(|e| (*e).to_owned()).collect())
    }

    fn make_item(pairs: &[(&str, AttributeValue)]) -> Item {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    fn run(
        text: &str,
        item: &Item,
        values: &[(&str, AttributeValue)],
    ) -> Result<Item, ExpressionError> {
        let names = HashMap::new();
        let values = make_item(values);
        let update = Binder::new(&names, &values)
            .bind_update(parse_update(text).expect("parse"))
            .expect("bind");
        apply_update(item, &update, &values)
    }

    #[test]
    fn test_should_set_and_compute_arithmetic_exactly() {
        let item = make_item(&[("price", n("0.1"))]);
        let out = run("SET price = price + :d, label = :l", &item, &[(":d", n("0.2")), (":l", s("x"))])
            .expect("apply");
        assert_eq!(out["price"], n("0.3"));
        assert_eq!(out["price"].as_n(), Some("0.3"));
        assert_eq!(out["label"], s("x"));
    }

    #[test]
    fn test_should_reject_arithmetic_on_non_numbers() {
        let item = make_item(&[("name", s("a"))]);
        let err = run("SET name = name + :d", &item, &[(":d", n("1"))]).expect_err("S + N");
        assert!(matches!(err, ExpressionError::TypeMismatch { .. }));
        let err = run("SET total = missing + :d", &item, &[(":d", n("1"))]).expect_err("missing");
        assert_eq!(err.to_string(), MISSING_OPERAND);
    }

    #[test]
    fn test_should_keep_existing_value_with_if_not_exists() {
        let item = make_item(&[("views", n("7"))]);
        let out = run(
            "SET views = if_not_exists(views, :zero) + :one, likes = if_not_exists(likes, :zero)",
            &item,
            &[(":zero", n("0")), (":one", n("1"))],
        )
        .expect("apply");
        assert_eq!(out["views"], n("8"));
        assert_eq!(out["likes"], n("0"));
    }

    #[test]
    fn test_should_append_lists_and_reject_non_lists() {
        let item = make_item(&[("tags", AttributeValue::L(vec![s("a")]))]);
        let out = run("SET tags = list_append(tags, :more)", &item, &[(":more", AttributeValue::L(vec![s("b")]))])
            .expect("apply");
        assert_eq!(out["tags"], AttributeValue::L(vec![s("a"), s("b")]));
        let err = run("SET tags = list_append(tags, :s)", &item, &[(":s", s("c"))])
            .expect_err("non-list");
        assert!(matches!(err, ExpressionError::TypeMismatch { .. }));
    }

    #[test]
    fn test_should_require_parent_for_nested_set_and_append_past_end() {
        let item = make_item(&[("list", AttributeValue::L(vec![s("a")]))]);
        let err = run("SET info.rating = :v", &item, &[(":v", n("5"))]).expect_err("no parent");
        assert_eq!(err.to_string(), INVALID_DOCUMENT_PATH);
        let out = run("SET list[10] = :v", &item, &[(":v", s("b"))]).expect("append");
        assert_eq!(out["list"], AttributeValue::L(vec![s("a"), s("b")]));
    }

    #[test]
    fn test_should_add_numbers_and_restore_with_negated_add() {
        let cases = [
            ("0.1", "0.2"),
            ("123456789012345678901234567890.12345678", "0.00000001"),
            ("-7", "7"),
            ("1.50", "0.000000000000000000000000000000000001"),
        ];
        for (original, delta) in cases {
            let item = make_item(&[("p", n(original))]);
            let added = run("ADD p :d", &item, &[(":d", n(delta))]).expect("add");
            let restored =
                run("ADD p :d", &added, &[(":d", n(&format!("-{delta}")))]).expect("add back");
            assert_eq!(restored["p"], n(original), "ADD/-ADD drifted for {original}");
        }
    }

    #[test]
    fn test_should_start_add_from_absent_attribute() {
        let item = make_item(&[]);
        let out = run("ADD counter :one, tags :t", &item, &[(":one", n("1")), (":t", ss(&["x"]))])
            .expect("apply");
        assert_eq!(out["counter"], n("1"));
        assert_eq!(out["tags"], ss(&["x"]));
    }

    #[test]
    fn test_should_union_and_difference_sets() {
        let item = make_item(&[
            ("tags", ss(&["a", "b"])),
            ("nums", AttributeValue::Ns(vec!["1".to_owned(), "2.0".to_owned()])),
        ]);
        let out = run(
            "ADD tags :more DELETE nums :drop",
            &item,
            &[
                (":more", ss(&["b", "c"])),
                (":drop", AttributeValue::Ns(vec!["2".to_owned()])),
            ],
        )
        .expect("apply");
        assert_eq!(out["tags"], ss(&["a", "b", "c"]));
        assert_eq!(out["nums"], AttributeValue::Ns(vec!["1".to_owned()]));
    }

    #[test]
    fn test_should_remove_emptied_set_and_ignore_absent_delete() {
        let item = make_item(&[("tags", ss(&["a"]))]);
        let out = run("DELETE tags :t, other :t", &item, &[(":t", ss(&["a"]))]).expect("apply");
        assert!(!out.contains_key("tags"));
        assert!(!out.contains_key("other"));
    }

    #[test]
    fn test_should_reject_add_and_delete_type_mismatches() {
        let item = make_item(&[("name", s("x")), ("tags", ss(&["a"]))]);
        let err = run("ADD name :one", &item, &[(":one", n("1"))]).expect_err("ADD to S");
        assert!(matches!(err, ExpressionError::TypeMismatch { .. }));
        let err = run("DELETE tags :one", &item, &[(":one", n("1"))]).expect_err("DELETE N");
        assert!(matches!(err, ExpressionError::TypeMismatch { .. }));
        let err = run("ADD tags :one", &item, &[(":one", n("1"))]).expect_err("ADD N to SS");
        assert!(matches!(err, ExpressionError::TypeMismatch { .. }));
    }

    #[test]
    fn test_should_remove_list_elements_highest_index_first() {
        let item = make_item(&[
            ("list", AttributeValue::L(vec![s("a"), s("b"), s("c"), s("d")])),
            ("gone", s("x")),
        ]);
        let out = run("REMOVE list[0], list[2], gone, never", &item, &[]).expect("apply");
        assert_eq!(out["list"], AttributeValue::L(vec![s("b"), s("d")]));
        assert!(!out.contains_key("gone"));
    }

    #[test]
    fn test_should_evaluate_right_hand_sides_on_snapshot() {
        let item = make_item(&[("a", n("1")), ("b", n("2"))]);
        let out = run("SET a = b, b = a", &item, &[]).expect("swap");
        assert_eq!(out["a"], n("2"));
        assert_eq!(out["b"], n("1"));
    }

    #[test]
    fn test_should_be_invariant_to_clause_order() {
        let item = make_item(&[
            ("count", n("10")),
            ("tags", ss(&["a", "b"])),
            ("old", s("x")),
            ("list", AttributeValue::L(vec![s("p"), s("q")])),
        ]);
        let values = [
            (":v", s("new")),
            (":n", n("5")),
            (":t", ss(&["a"])),
        ];
        let orders = [
            "SET label = :v, list[5] = :v ADD count :n DELETE tags :t REMOVE old, list[0]",
            "REMOVE list[0], old DELETE tags :t ADD count :n SET list[5] = :v, label = :v",
            "DELETE tags :t SET label = :v, list[5] = :v REMOVE old, list[0] ADD count :n",
        ];
        let results: Vec<Item> = orders
            .iter()
            .map(|text| run(text, &item, &values).expect("apply"))
            .collect();
        assert_eq!(results[0], results[1]);
        assert_eq!(results[1], results[2]);
        assert_eq!(results[0]["list"], AttributeValue::L(vec![s("q"), s("new")]));
    }
}
