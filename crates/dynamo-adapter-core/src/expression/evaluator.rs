//! Condition and filter evaluation.
//!
//! Evaluates a bound [`Expr`] against an item. Placeholder names have already
//! been replaced by the binder; `:token` operands are read from the request's
//! value map here.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::HashMap;

use dynamo_adapter_model::{AttributeValue, Item, Number};

use super::ast::{AttributePath, CompareOp, Expr, FunctionName, LogicalOp, Operand, PathElement};
use super::parser::ExpressionError;

/// Type names accepted by `attribute_type`.
const ATTRIBUTE_TYPES: [&str; 10] = ["B", "NULL", "SS", "BOOL", "L", "BS", "N", "NS", "S", "M"];

// ---------------------------------------------------------------------------
// Evaluation context
// ---------------------------------------------------------------------------

/// An item paired with the request's `:token` values.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    /// The item being evaluated.
    pub item: &'a Item,
    /// Expression attribute values (`:val` -> value).
    pub values: &'a HashMap<String, AttributeValue>,
}

impl<'a> EvalContext<'a> {
    /// Evaluate a condition expression against the item.
    ///
    /// # Errors
    ///
    /// Returns `ExpressionError` if a token is missing or an operand has the
    /// wrong type for a function.
    pub fn evaluate(&self, expr: &Expr) -> Result<bool, ExpressionError> {
        match expr {
            Expr::Compare { left, op, right } => self.eval_compare(left, *op, right),
            Expr::Between { value, low, high } => self.eval_between(value, low, high),
            Expr::In { value, list } => self.eval_in(value, list),
            Expr::Logical { op, left, right } => self.eval_logical(*op, left, right),
            Expr::Not(inner) => self.evaluate(inner).map(|v| !v),
            Expr::Function { name, args } => self.eval_function(*name, args),
        }
    }

    fn eval_compare(
        &self,
        left: &Operand,
        op: CompareOp,
        right: &Operand,
    ) -> Result<bool, ExpressionError> {
        let lval = self.resolve_operand(left)?;
        let rval = self.resolve_operand(right)?;
        let (Some(lv), Some(rv)) = (lval, rval) else {
            return Ok(false);
        };
        compare_values(&lv, &rv, op)
    }

    fn eval_between(
        &self,
        value: &Operand,
        low: &Operand,
        high: &Operand,
    ) -> Result<bool, ExpressionError> {
        let v = self.resolve_operand(value)?;
        let lo = self.resolve_operand(low)?;
        let hi = self.resolve_operand(high)?;

        if let (Some(lo), Some(hi)) = (&lo, &hi) {
            if compare_values(lo, hi, CompareOp::Gt)? {
                return Err(ExpressionError::InvalidOperand {
                    message: format!(
                        "The BETWEEN operator requires upper bound to be greater than or equal to lower bound; lower bound operand: {lo}, upper bound operand: {hi}"
                    ),
                });
            }
        }

        let (Some(v), Some(lo), Some(hi)) = (v, lo, hi) else {
            return Ok(false);
        };
        Ok(compare_values(&v, &lo, CompareOp::Ge)? && compare_values(&v, &hi, CompareOp::Le)?)
    }

    fn eval_in(&self, value: &Operand, list: &[Operand]) -> Result<bool, ExpressionError> {
        let Some(v) = self.resolve_operand(value)? else {
            return Ok(false);
        };
        for candidate in list {
            if let Some(c) = self.resolve_operand(candidate)? {
                if *v == *c {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn eval_logical(
        &self,
        op: LogicalOp,
        left: &Expr,
        right: &Expr,
    ) -> Result<bool, ExpressionError> {
        match op {
            LogicalOp::And => {
                if !self.evaluate(left)? {
                    return Ok(false);
                }
                self.evaluate(right)
            }
            LogicalOp::Or => {
                if self.evaluate(left)? {
                    return Ok(true);
                }
                self.evaluate(right)
            }
        }
    }

    fn eval_function(&self, name: FunctionName, args: &[Operand]) -> Result<bool, ExpressionError> {
        let [Operand::Path(path), rest @ ..] = args else {
            return Err(ExpressionError::InvalidOperand {
                message: format!(
                    "Operator or function requires a document path; operator or function: {name}"
                ),
            });
        };
        let attr = resolve_path(self.item, path);
        let second = match rest.first() {
            Some(operand) => self.resolve_operand(operand)?,
            None => None,
        };

        match name {
            FunctionName::AttributeExists => Ok(attr.is_some()),
            FunctionName::AttributeNotExists => Ok(attr.is_none()),
            FunctionName::AttributeType => {
                let Some(AttributeValue::S(type_name)) = second.as_deref() else {
                    let found = second.as_deref().map_or("NULL", AttributeValue::type_descriptor);
                    return Err(ExpressionError::type_mismatch(name, found));
                };
                if !ATTRIBUTE_TYPES.contains(&type_name.as_str()) {
                    return Err(ExpressionError::InvalidOperand {
                        message: format!(
                            "Invalid attribute type name found; type: {type_name}, valid types: {{ B,NULL,SS,BOOL,L,BS,N,NS,S,M }}"
                        ),
                    });
                }
                Ok(attr.is_some_and(|v| v.type_descriptor() == type_name))
            }
            FunctionName::BeginsWith => {
                let Some(prefix) = second else {
                    return Ok(false);
                };
                if !matches!(*prefix, AttributeValue::S(_) | AttributeValue::B(_)) {
                    return Err(ExpressionError::type_mismatch(name, prefix.type_descriptor()));
                }
                Ok(match (attr, &*prefix) {
                    (Some(AttributeValue::S(s)), AttributeValue::S(p)) => s.starts_with(p.as_str()),
                    (Some(AttributeValue::B(b)), AttributeValue::B(p)) => b.starts_with(p),
                    _ => false,
                })
            }
            FunctionName::Contains => {
                let (Some(attr), Some(search)) = (attr, second) else {
                    return Ok(false);
                };
                contains(attr, &search)
            }
        }
    }

    /// Resolve an operand to a value, or `None` when it names a missing path.
    ///
    /// # Errors
    ///
    /// Returns `UnresolvedAttributeValue` for a token missing from the value map
    /// and `TypeMismatch` for `size()` of a type that has no size.
    pub fn resolve_operand(
        &self,
        operand: &Operand,
    ) -> Result<Option<Cow<'a, AttributeValue>>, ExpressionError> {
        match operand {
            Operand::Path(path) => Ok(resolve_path(self.item, path).map(Cow::Borrowed)),
            Operand::Value(token) => self.value(token).map(|v| Some(Cow::Borrowed(v))),
            Operand::Size(path) => match resolve_path(self.item, path) {
                Some(v) => {
                    let size = attribute_size(v)?;
                    Ok(Some(Cow::Owned(AttributeValue::N(size.to_string()))))
                }
                None => Ok(None),
            },
        }
    }

    /// Look up a `:token` in the value map.
    ///
    /// # Errors
    ///
    /// Returns `UnresolvedAttributeValue` when the token is missing.
    pub fn value(&self, token: &str) -> Result<&'a AttributeValue, ExpressionError> {
        self.values
            .get(token)
            .ok_or_else(|| ExpressionError::UnresolvedAttributeValue {
                name: token.to_owned(),
            })
    }
}

// ---------------------------------------------------------------------------
// Helper functions
// ---------------------------------------------------------------------------

/// Walk a bound attribute path through an item.
#[must_use]
pub fn resolve_path<'i>(item: &'i Item, path: &AttributePath) -> Option<&'i AttributeValue> {
    let (head, rest) = path.elements.split_first()?;
    let PathElement::Attribute(name) = head else {
        return None;
    };
    let mut current = item.get(name)?;
    for element in rest {
        current = match (element, current) {
            (PathElement::Attribute(key), AttributeValue::M(map)) => map.get(key)?,
            (PathElement::Index(idx), AttributeValue::L(list)) => list.get(*idx)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Compare two values.
///
/// Equality holds across every type (`=` on mismatched types is `false`,
/// `<>` is `true`). Ordering is defined only between two strings, two numbers,
/// or two binaries.
///
/// # Errors
///
/// Returns `TypeMismatch` when an ordering operator meets a type that has no
/// order or two different scalar types, and `InvalidNumber` when an `N` value
/// cannot be parsed.
pub fn compare_values(
    left: &AttributeValue,
    right: &AttributeValue,
    op: CompareOp,
) -> Result<bool, ExpressionError> {
    match op {
        CompareOp::Eq => return Ok(left == right),
        CompareOp::Ne => return Ok(left != right),
        _ => {}
    }
    let ordering = scalar_ordering(left, right, op)?;
    Ok(match op {
        CompareOp::Lt => ordering == Ordering::Less,
        CompareOp::Le => ordering != Ordering::Greater,
        CompareOp::Gt => ordering == Ordering::Greater,
        CompareOp::Ge => ordering != Ordering::Less,
        CompareOp::Eq | CompareOp::Ne => false,
    })
}

fn scalar_ordering(
    left: &AttributeValue,
    right: &AttributeValue,
    op: CompareOp,
) -> Result<Ordering, ExpressionError> {
    match (left, right) {
        (AttributeValue::S(a), AttributeValue::S(b)) => Ok(a.as_bytes().cmp(b.as_bytes())),
        (AttributeValue::N(a), AttributeValue::N(b)) => {
            Ok(Number::parse(a)?.cmp(&Number::parse(b)?))
        }
        (AttributeValue::B(a), AttributeValue::B(b)) => Ok(a.as_ref().cmp(b.as_ref())),
        (AttributeValue::S(_) | AttributeValue::N(_) | AttributeValue::B(_), other) => {
            Err(ExpressionError::type_mismatch(op, other.type_descriptor()))
        }
        (other, _) => Err(ExpressionError::type_mismatch(op, other.type_descriptor())),
    }
}

fn contains(attr: &AttributeValue, search: &AttributeValue) -> Result<bool, ExpressionError> {
    Ok(match (attr, search) {
        (AttributeValue::S(s), AttributeValue::S(sub)) => s.contains(sub.as_str()),
        (AttributeValue::Ss(set), AttributeValue::S(val)) => set.contains(val),
        (AttributeValue::Ns(set), AttributeValue::N(_)) => set
            .iter()
            .any(|n| AttributeValue::N(n.clone()) == *search),
        (AttributeValue::Bs(set), AttributeValue::B(val)) => set.contains(val),
        (AttributeValue::L(list), _) => list.contains(search),
        (
            AttributeValue::S(_)
            | AttributeValue::Ss(_)
            | AttributeValue::Ns(_)
            | AttributeValue::Bs(_),
            _,
        ) => false,
        (other, _) => {
            return Err(ExpressionError::type_mismatch(
                FunctionName::Contains,
                other.type_descriptor(),
            ));
        }
    })
}

/// Length of a value as reported by `size()`.
///
/// # Errors
///
/// Returns `TypeMismatch` for numbers, booleans, and nulls.
pub fn attribute_size(value: &AttributeValue) -> Result<usize, ExpressionError> {
    match value {
        AttributeValue::S(s) => Ok(s.chars().count()),
        AttributeValue::B(b) => Ok(b.len()),
        AttributeValue::Ss(v) | AttributeValue::Ns(v) => Ok(v.len()),
        AttributeValue::Bs(v) => Ok(v.len()),
        AttributeValue::L(v) => Ok(v.len()),
        AttributeValue::M(m) => Ok(m.len()),
        AttributeValue::N(_) | AttributeValue::Bool(_) | AttributeValue::Null(_) => Err(
            ExpressionError::type_mismatch("size", value.type_descriptor()),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::binder::Binder;
    use crate::expression::parser::parse_condition;

    fn make_item(pairs: &[(&str, AttributeValue)]) -> Item {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    fn make_values(pairs: &[(&str, AttributeValue)]) -> HashMap<String, AttributeValue> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    fn s(v: &str) -> AttributeValue {
        AttributeValue::S(v.to_owned())
    }

    fn n(v: &str) -> AttributeValue {
        AttributeValue::N(v.to_owned())
    }

    fn eval(
        text: &str,
        item: &Item,
        names: &[(&str, &str)],
        values: &HashMap<String, AttributeValue>,
    ) -> Result<bool, ExpressionError> {
        let names: HashMap<String, String> = names
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        let expr = Binder::new(&names, values)
            .bind_condition(parse_condition(text).expect("parse"))
            .expect("bind");
        EvalContext { item, values }.evaluate(&expr)
    }

    #[test]
    fn test_should_evaluate_equality_with_alias() {
        let item = make_item(&[("name", s("Alice"))]);
        let values = make_values(&[(":val", s("Alice"))]);
        assert!(eval("#n = :val", &item, &[("#n", "name")], &values).expect("eval"));
    }

    #[test]
    fn test_should_compare_numbers_exactly() {
        let item = make_item(&[("age", n("10")), ("price", n("0.30"))]);
        let values = make_values(&[
            (":val2", n("9.99999999999999999999999999")),
            (":p", n("3e-1")),
        ]);
        assert!(eval("#ag > :val2", &item, &[("#ag", "age")], &values).expect("eval"));
        assert!(eval("price = :p", &item, &[], &values).expect("eval"));
        assert!(!eval("price <> :p", &item, &[], &values).expect("eval"));
    }

    #[test]
    fn test_should_compare_strings_by_utf8_bytes() {
        let item = make_item(&[("word", s("Zebra"))]);
        let values = make_values(&[(":v", s("apple")), (":u", s("é"))]);
        assert!(eval("word < :v", &item, &[], &values).expect("eval"));
        assert!(eval("word < :u", &item, &[], &values).expect("eval"));
    }

    #[test]
    fn test_should_treat_mismatched_types_as_unequal() {
        let item = make_item(&[("a", s("1"))]);
        let values = make_values(&[(":one", n("1"))]);
        assert!(!eval("a = :one", &item, &[], &values).expect("eval"));
        assert!(eval("a <> :one", &item, &[], &values).expect("eval"));
    }

    #[test]
    fn test_should_reject_ordering_across_types() {
        let item = make_item(&[
            ("a", s("1")),
            ("flag", AttributeValue::Bool(true)),
            ("tags", AttributeValue::Ss(vec!["x".to_owned()])),
        ]);
        let values = make_values(&[(":one", n("1")), (":two", n("2")), (":s", s("1"))]);
        for text in [
            "a < :one",
            "a >= :one",
            "flag > :one",
            "tags <= :s",
            "a BETWEEN :one AND :two",
        ] {
            let err = eval(text, &item, &[], &values).expect_err(text);
            assert!(
                matches!(err, ExpressionError::TypeMismatch { .. }),
                "{text}: {err}"
            );
        }
        // A missing path is still just false.
        assert!(!eval("ghost < :one", &item, &[], &values).expect("eval"));
    }

    #[test]
    fn test_should_reject_contains_on_scalar_without_members() {
        let item = make_item(&[
            ("age", n("10")),
            ("info", AttributeValue::M(HashMap::new())),
            ("title", s("adapter")),
        ]);
        let values = make_values(&[(":v", n("1"))]);
        for text in ["contains(age, :v)", "contains(info, :v)"] {
            let err = eval(text, &item, &[], &values).expect_err(text);
            assert!(matches!(err, ExpressionError::TypeMismatch { .. }), "{text}");
        }
        assert!(!eval("contains(title, :v)", &item, &[], &values).expect("eval"));
        assert!(!eval("contains(ghost, :v)", &item, &[], &values).expect("eval"));
    }

    #[test]
    fn test_should_evaluate_missing_path_as_false() {
        let item = make_item(&[]);
        let values = make_values(&[(":v", n("1"))]);
        assert!(!eval("ghost = :v", &item, &[], &values).expect("eval"));
        assert!(!eval("ghost <> :v", &item, &[], &values).expect("eval"));
        assert!(!eval("begins_with(ghost, :v)", &item, &[], &make_values(&[(":v", s("x"))]))
            .expect("eval"));
        assert!(eval("NOT ghost = :v", &item, &[], &values).expect("eval"));
    }

    #[test]
    fn test_should_evaluate_between_inclusive_and_reject_inverted_bounds() {
        let item = make_item(&[("n", n("5"))]);
        let values = make_values(&[(":lo", n("5")), (":hi", n("10"))]);
        assert!(eval("n BETWEEN :lo AND :hi", &item, &[], &values).expect("eval"));
        let err = eval("n BETWEEN :hi AND :lo", &item, &[], &values).expect_err("inverted");
        assert!(err.to_string().contains("BETWEEN operator requires upper bound"));
    }

    #[test]
    fn test_should_evaluate_in_membership() {
        let item = make_item(&[("color", s("red"))]);
        let values = make_values(&[(":a", s("blue")), (":b", s("red"))]);
        assert!(eval("color IN (:a, :b)", &item, &[], &values).expect("eval"));
        assert!(!eval("color IN (:a)", &item, &[], &values).expect("eval"));
    }

    #[test]
    fn test_should_short_circuit_logical_operators() {
        let item = make_item(&[("a", n("1")), ("flag", AttributeValue::Bool(true))]);
        let values = make_values(&[(":one", n("1")), (":two", n("2"))]);
        // size(flag) would fail; short-circuiting never evaluates it.
        assert!(eval("a = :one OR size(flag) > :one", &item, &[], &values).expect("eval"));
        assert!(!eval("a = :two AND size(flag) > :one", &item, &[], &values).expect("eval"));
        let err = eval("a = :one AND size(flag) > :one", &item, &[], &values)
            .expect_err("size of BOOL");
        assert!(matches!(err, ExpressionError::TypeMismatch { .. }));
    }

    #[test]
    fn test_should_compute_size_per_type() {
        let item = make_item(&[
            ("word", s("héllo")),
            ("blob", AttributeValue::B(bytes::Bytes::from_static(b"abc"))),
            ("tags", AttributeValue::Ss(vec!["a".to_owned(), "b".to_owned()])),
            ("list", AttributeValue::L(vec![n("1")])),
        ]);
        let values = make_values(&[(":five", n("5")), (":three", n("3")), (":two", n("2")), (":one", n("1"))]);
        assert!(eval("size(word) = :five", &item, &[], &values).expect("eval"));
        assert!(eval("size(blob) = :three", &item, &[], &values).expect("eval"));
        assert!(eval("size(tags) = :two AND size(list) = :one", &item, &[], &values).expect("eval"));
        assert!(!eval("size(missing) = :one", &item, &[], &values).expect("eval"));
    }

    #[test]
    fn test_should_test_existence_with_null_as_present() {
        let item = make_item(&[("gone", AttributeValue::Null(true))]);
        let values = make_values(&[]);
        assert!(eval("attribute_exists(gone)", &item, &[], &values).expect("eval"));
        assert!(eval("attribute_not_exists(other)", &item, &[], &values).expect("eval"));
    }

    #[test]
    fn test_should_evaluate_begins_with_on_strings_and_binary() {
        let item = make_item(&[
            ("sk", s("ORDER#2024")),
            ("raw", AttributeValue::B(bytes::Bytes::from_static(b"\x01\x02\x03"))),
        ]);
        let values = make_values(&[
            (":p", s("ORDER#")),
            (":b", AttributeValue::B(bytes::Bytes::from_static(b"\x01\x02"))),
            (":n", n("1")),
        ]);
        assert!(eval("begins_with(sk, :p)", &item, &[], &values.clone()).expect("eval"));
        assert!(eval("begins_with(raw, :b)", &item, &[], &values).expect("eval"));
        let err = eval("begins_with(sk, :n)", &item, &[], &values).expect_err("numeric prefix");
        assert!(matches!(err, ExpressionError::TypeMismatch { .. }));
    }

    #[test]
    fn test_should_evaluate_contains_on_strings_sets_and_lists() {
        let item = make_item(&[
            ("title", s("dynamo adapter")),
            ("scores", AttributeValue::Ns(vec!["1.50".to_owned(), "2".to_owned()])),
            ("items", AttributeValue::L(vec![s("x"), n("3")])),
        ]);
        let values = make_values(&[(":sub", s("adapt")), (":score", n("1.5")), (":x", s("x"))]);
        assert!(eval("contains(title, :sub)", &item, &[], &values).expect("eval"));
        assert!(eval("contains(scores, :score)", &item, &[], &values).expect("eval"));
        assert!(eval("contains(#i, :x)", &item, &[("#i", "items")], &values).expect("eval"));
    }

    #[test]
    fn test_should_evaluate_attribute_type() {
        let item = make_item(&[("tags", AttributeValue::Ss(vec!["a".to_owned()]))]);
        let values = make_values(&[(":ss", s("SS")), (":bad", s("STRING"))]);
        assert!(eval("attribute_type(tags, :ss)", &item, &[], &values).expect("eval"));
        let err = eval("attribute_type(tags, :bad)", &item, &[], &values).expect_err("bad type");
        assert!(err.to_string().starts_with("Invalid attribute type name found"));
    }

    #[test]
    fn test_should_resolve_nested_paths() {
        let inner = AttributeValue::M(HashMap::from([(
            "ratings".to_owned(),
            AttributeValue::L(vec![n("3"), n("5")]),
        )]));
        let item = make_item(&[("info", inner)]);
        let path = AttributePath {
            elements: vec![
                PathElement::Attribute("info".to_owned()),
                PathElement::Attribute("ratings".to_owned()),
                PathElement::Index(1),
            ],
        };
        assert_eq!(resolve_path(&item, &path), Some(&n("5")));
        let wrong = AttributePath {
            elements: vec![
                PathElement::Attribute("info".to_owned()),
                PathElement::Index(0),
            ],
        };
        assert_eq!(resolve_path(&item, &wrong), None);
    }
}
