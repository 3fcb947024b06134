//! Placeholder binding.
//!
//! The binder walks parsed expressions, swaps every `#alias` path element for
//! the attribute name it stands for, and checks that every `:token` operand
//! exists in the value map. Tokens stay as references; the evaluator reads
//! them when it needs the value. Once every expression of a request has been
//! bound, [`Binder::finish`] rejects placeholders the caller supplied but
//! never used.
//!
//! [`ExpressionContext::compile`] runs all of this for one request, so every
//! placeholder problem surfaces before the backing store is touched.

use std::collections::{HashMap, HashSet};

use dynamo_adapter_model::{AttributeValue, Item};

use super::ast::{
    AddAction, AttributePath, DeleteAction, Expr, Operand, PathElement, SetAction, SetValue,
    UpdateExpr,
};
use super::evaluator::EvalContext;
use super::parser::{
    ExpressionError, ExpressionKind, parse_condition, parse_projection, parse_update,
};

/// Resolves placeholders against one request's name and value maps.
#[derive(Debug)]
pub struct Binder<'a> {
    names: &'a HashMap<String, String>,
    values: &'a HashMap<String, AttributeValue>,
    used_names: HashSet<String>,
    used_values: HashSet<String>,
}

impl<'a> Binder<'a> {
    /// Create a binder over the caller's maps. The maps are never modified.
    #[must_use]
    pub fn new(
        names: &'a HashMap<String, String>,
        values: &'a HashMap<String, AttributeValue>,
    ) -> Self {
        Self {
            names,
            values,
            used_names: HashSet::new(),
            used_values: HashSet::new(),
        }
    }

    /// Bind a condition, filter or key-condition expression.
    pub fn bind_condition(&mut self, expr: Expr) -> Result<Expr, ExpressionError> {
        Ok(match expr {
            Expr::Compare { left, op, right } => Expr::Compare {
                left: Box::new(self.bind_operand(*left)?),
                op,
                right: Box::new(self.bind_operand(*right)?),
            },
            Expr::Between { value, low, high } => Expr::Between {
                value: Box::new(self.bind_operand(*value)?),
                low: Box::new(self.bind_operand(*low)?),
                high: Box::new(self.bind_operand(*high)?),
            },
            Expr::In { value, list } => Expr::In {
                value: Box::new(self.bind_operand(*value)?),
                list: list
                    .into_iter()
                    .map(|operand| self.bind_operand(operand))
                    .collect::<Result<_, _>>()?,
            },
            Expr::Logical { op, left, right } => Expr::Logical {
                op,
                left: Box::new(self.bind_condition(*left)?),
                right: Box::new(self.bind_condition(*right)?),
            },
            Expr::Not(inner) => Expr::Not(Box::new(self.bind_condition(*inner)?)),
            Expr::Function { name, args } => Expr::Function {
                name,
                args: args
                    .into_iter()
                    .map(|operand| self.bind_operand(operand))
                    .collect::<Result<_, _>>()?,
            },
        })
    }

    /// Bind an update expression and reject overlapping target paths.
    pub fn bind_update(&mut self, update: UpdateExpr) -> Result<UpdateExpr, ExpressionError> {
        let bound = UpdateExpr {
            set_actions: update
                .set_actions
                .into_iter()
                .map(|action| {
                    Ok(SetAction {
                        path: self.bind_path(action.path)?,
                        value: self.bind_set_value(action.value)?,
                    })
                })
                .collect::<Result<_, ExpressionError>>()?,
            remove_paths: update
                .remove_paths
                .into_iter()
                .map(|path| self.bind_path(path))
                .collect::<Result<_, _>>()?,
            add_actions: update
                .add_actions
                .into_iter()
                .map(|action| {
                    Ok(AddAction {
                        path: self.bind_path(action.path)?,
                        value: self.bind_operand(action.value)?,
                    })
                })
                .collect::<Result<_, ExpressionError>>()?,
            delete_actions: update
                .delete_actions
                .into_iter()
                .map(|action| {
                    Ok(DeleteAction {
                        path: self.bind_path(action.path)?,
                        value: self.bind_operand(action.value)?,
                    })
                })
                .collect::<Result<_, ExpressionError>>()?,
        };
        check_disjoint(&bound.target_paths())?;
        Ok(bound)
    }

    /// Bind a projection path list and reject overlapping paths.
    pub fn bind_projection(
        &mut self,
        paths: Vec<AttributePath>,
    ) -> Result<Vec<AttributePath>, ExpressionError> {
        let bound = paths
            .into_iter()
            .map(|path| self.bind_path(path))
            .collect::<Result<Vec<_>, _>>()?;
        check_disjoint(&bound.iter().collect::<Vec<_>>())?;
        Ok(bound)
    }

    /// Fail if any supplied name or value placeholder was never referenced.
    pub fn finish(self) -> Result<(), ExpressionError> {
        unused("ExpressionAttributeNames", self.names.keys(), &self.used_names)?;
        unused("ExpressionAttributeValues", self.values.keys(), &self.used_values)
    }

    fn bind_set_value(&mut self, value: SetValue) -> Result<SetValue, ExpressionError> {
        Ok(match value {
            SetValue::Operand(operand) => SetValue::Operand(self.bind_operand(operand)?),
            SetValue::Plus(a, b) => SetValue::Plus(
                Box::new(self.bind_set_value(*a)?),
                Box::new(self.bind_set_value(*b)?),
            ),
            SetValue::Minus(a, b) => SetValue::Minus(
                Box::new(self.bind_set_value(*a)?),
                Box::new(self.bind_set_value(*b)?),
            ),
            SetValue::IfNotExists(path, default) => SetValue::IfNotExists(
                self.bind_path(path)?,
                Box::new(self.bind_set_value(*default)?),
            ),
            SetValue::ListAppend(a, b) => SetValue::ListAppend(
                Box::new(self.bind_set_value(*a)?),
                Box::new(self.bind_set_value(*b)?),
            ),
        })
    }

    fn bind_operand(&mut self, operand: Operand) -> Result<Operand, ExpressionError> {
        match operand {
            Operand::Value(token) => {
                if !self.values.contains_key(&token) {
                    return Err(ExpressionError::UnresolvedAttributeValue { name: token });
                }
                self.used_values.insert(token.clone());
                Ok(Operand::Value(token))
            }
            Operand::Path(path) => Ok(Operand::Path(self.bind_path(path)?)),
            Operand::Size(path) => Ok(Operand::Size(self.bind_path(path)?)),
        }
    }

    fn bind_path(&mut self, path: AttributePath) -> Result<AttributePath, ExpressionError> {
        let elements = path
            .elements
            .into_iter()
            .map(|element| match element {
                PathElement::Alias(alias) => {
                    let Some(name) = self.names.get(&alias) else {
                        return Err(ExpressionError::UnresolvedAttributeName { name: alias });
                    };
                    let name = name.clone();
                    self.used_names.insert(alias);
                    Ok(PathElement::Attribute(name))
                }
                other => Ok(other),
            })
            .collect::<Result<_, _>>()?;
        Ok(AttributePath { elements })
    }
}

fn unused<'k>(
    field: &'static str,
    supplied: impl Iterator<Item = &'k String>,
    used: &HashSet<String>,
) -> Result<(), ExpressionError> {
    let mut keys: Vec<&str> = supplied
        .filter(|k| !used.contains(k.as_str()))
        .map(String::as_str)
        .collect();
    if keys.is_empty() {
        return Ok(());
    }
    keys.sort_unstable();
    Err(ExpressionError::UnusedPlaceholders {
        field,
        keys: keys.join(", "),
    })
}

/// Reject two paths that are equal, where one is a prefix of the other, or
/// that reach the same position once as a map key and once as a list index.
fn check_disjoint(paths: &[&AttributePath]) -> Result<(), ExpressionError> {
    for (i, a) in paths.iter().enumerate() {
        for b in &paths[i + 1..] {
            let common = a.elements.len().min(b.elements.len());
            let diverge = (0..common).find(|&k| a.elements[k] != b.elements[k]);
            match diverge {
                None => {
                    return Err(ExpressionError::DuplicatePath {
                        message: format!(
                            "Two document paths overlap with each other; must remove or rewrite one of these paths; path one: {}, path two: {}",
                            bracketed(a),
                            bracketed(b)
                        ),
                    });
                }
                Some(k) => {
                    let kinds_differ = matches!(
                        (&a.elements[k], &b.elements[k]),
                        (PathElement::Index(_), PathElement::Attribute(_))
                            | (PathElement::Attribute(_), PathElement::Index(_))
                    );
                    if kinds_differ {
                        return Err(ExpressionError::DuplicatePath {
                            message: format!(
                                "Two document paths conflict with each other; must remove or rewrite one of these paths; path one: {}, path two: {}",
                                bracketed(a),
                                bracketed(b)
                            ),
                        });
                    }
                }
            }
        }
    }
    Ok(())
}

fn bracketed(path: &AttributePath) -> String {
    let parts: Vec<String> = path
        .elements
        .iter()
        .map(|e| match e {
            PathElement::Attribute(name) | PathElement::Alias(name) => name.clone(),
            PathElement::Index(idx) => format!("[{idx}]"),
        })
        .collect();
    format!("[{}]", parts.join(", "))
}

// ---------------------------------------------------------------------------
// Per-request compilation
// ---------------------------------------------------------------------------

/// The raw expression strings carried by one request.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpressionInput<'a> {
    /// `ConditionExpression`.
    pub condition: Option<&'a str>,
    /// `KeyConditionExpression`.
    pub key_condition: Option<&'a str>,
    /// `FilterExpression`.
    pub filter: Option<&'a str>,
    /// `UpdateExpression`.
    pub update: Option<&'a str>,
    /// `ProjectionExpression`.
    pub projection: Option<&'a str>,
}

/// Every expression of a request, parsed and bound.
#[derive(Debug)]
pub struct ExpressionContext<'a> {
    /// The caller's `:token` map, read at evaluation time.
    pub values: &'a HashMap<String, AttributeValue>,
    /// Bound `ConditionExpression`.
    pub condition: Option<Expr>,
    /// Bound `KeyConditionExpression`.
    pub key_condition: Option<Expr>,
    /// Bound `FilterExpression`.
    pub filter: Option<Expr>,
    /// Bound `UpdateExpression`.
    pub update: Option<UpdateExpr>,
    /// Bound `ProjectionExpression`.
    pub projection: Option<Vec<AttributePath>>,
}

impl<'a> ExpressionContext<'a> {
    /// Parse and bind every expression present in `input`, then reject unused
    /// placeholders and invalid literal values.
    pub fn compile(
        input: ExpressionInput<'_>,
        names: &'a HashMap<String, String>,
        values: &'a HashMap<String, AttributeValue>,
    ) -> Result<Self, ExpressionError> {
        for (token, value) in values {
            value
                .validate()
                .map_err(|e| ExpressionError::InvalidOperand {
                    message: format!(
                        "ExpressionAttributeValues contains invalid value: {e} for key {token}"
                    ),
                })?;
        }

        let mut binder = Binder::new(names, values);
        let condition = compile_condition(&mut binder, input.condition, ExpressionKind::Condition)?;
        let key_condition =
            compile_condition(&mut binder, input.key_condition, ExpressionKind::KeyCondition)?;
        let filter = compile_condition(&mut binder, input.filter, ExpressionKind::Filter)?;
        let update = input
            .update
            .map(|text| {
                parse_update(text)
                    .and_then(|parsed| binder.bind_update(parsed))
                    .map_err(|e| e.within(ExpressionKind::Update))
            })
            .transpose()?;
        let projection = input
            .projection
            .map(|text| {
                parse_projection(text)
                    .and_then(|parsed| binder.bind_projection(parsed))
                    .map_err(|e| e.within(ExpressionKind::Projection))
            })
            .transpose()?;
        binder.finish()?;

        Ok(Self {
            values,
            condition,
            key_condition,
            filter,
            update,
            projection,
        })
    }

    /// An evaluation context for `item` over this request's values.
    #[must_use]
    pub fn eval<'i>(&'i self, item: &'i Item) -> EvalContext<'i> {
        EvalContext {
            item,
            values: self.values,
        }
    }
}

fn compile_condition(
    binder: &mut Binder<'_>,
    text: Option<&str>,
    kind: ExpressionKind,
) -> Result<Option<Expr>, ExpressionError> {
    text.map(|text| {
        parse_condition(text)
            .and_then(|parsed| binder.bind_condition(parsed))
            .map_err(|e| e.within(kind))
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    fn values(keys: &[&str]) -> HashMap<String, AttributeValue> {
        keys.iter()
            .map(|k| ((*k).to_owned(), AttributeValue::N("1".to_owned())))
            .collect()
    }

    #[test]
    fn test_should_replace_aliases_with_attribute_names() {
        let names = names(&[("#a", "age"), ("#i", "info")]);
        let values = values(&[":v"]);
        let mut binder = Binder::new(&names, &values);
        let expr = binder
            .bind_condition(parse_condition("#i.#a > :v").expect("parse"))
            .expect("bind");
        let Expr::Compare { left, .. } = expr else {
            panic!("expected Compare");
        };
        assert_eq!(*left, Operand::Path(parse_projection("info.age").expect("parse").remove(0)));
        binder.finish().expect("all placeholders used");
    }

    #[test]
    fn test_should_reject_unresolved_name_and_value() {
        let names = names(&[]);
        let values = values(&[]);
        let mut binder = Binder::new(&names, &values);
        let err = binder
            .bind_condition(parse_condition("#missing = :v").expect("parse"))
            .expect_err("unresolved name");
        assert!(
            matches!(err, ExpressionError::UnresolvedAttributeName { ref name } if name == "#missing")
        );

        let err = binder
            .bind_condition(parse_condition("a = :v").expect("parse"))
            .expect_err("unresolved value");
        assert!(matches!(err, ExpressionError::UnresolvedAttributeValue { ref name } if name == ":v"));
    }

    #[test]
    fn test_should_reject_unused_placeholders() {
        let names = names(&[("#a", "a"), ("#z", "z"), ("#b", "b")]);
        let values = values(&[":v"]);
        let mut binder = Binder::new(&names, &values);
        binder
            .bind_condition(parse_condition("#a = :v").expect("parse"))
            .expect("bind");
        let err = binder.finish().expect_err("unused names");
        assert_eq!(
            err.to_string(),
            "Value provided in ExpressionAttributeNames unused in expressions: keys: {#b, #z}"
        );
    }

    #[test]
    fn test_should_reject_overlapping_update_paths() {
        let names = names(&[("#a", "a")]);
        let values = values(&[":v"]);
        let mut binder = Binder::new(&names, &values);
        let err = binder
            .bind_update(parse_update("SET a.b = :v REMOVE #a").expect("parse"))
            .expect_err("overlap after alias resolution");
        assert!(err.to_string().starts_with("Two document paths overlap"));

        let mut binder = Binder::new(&names, &values);
        let err = binder
            .bind_update(parse_update("SET a[0] = :v, #a.b = :v").expect("parse"))
            .expect_err("conflict");
        assert!(err.to_string().starts_with("Two document paths conflict"));

        let mut binder = Binder::new(&names, &values);
        binder
            .bind_update(parse_update("SET #a.b = :v, a.c = :v").expect("parse"))
            .expect("siblings are disjoint");
    }

    #[test]
    fn test_should_compile_all_expressions_before_any_read() {
        let names = names(&[("#n", "name")]);
        let values = values(&[":v"]);
        let input = ExpressionInput {
            filter: Some("#n = :missing"),
            ..Default::default()
        };
        let err = ExpressionContext::compile(input, &names, &values).expect_err("unresolved");
        assert_eq!(
            err.to_string(),
            "Invalid FilterExpression: An expression attribute value used in expression is not defined; attribute value: :missing"
        );
        assert!(matches!(err.root(), ExpressionError::UnresolvedAttributeValue { .. }));
    }

    #[test]
    fn test_should_count_placeholders_across_expressions() {
        let names = names(&[("#n", "name"), ("#p", "price")]);
        let values = values(&[":v"]);
        let input = ExpressionInput {
            condition: Some("attribute_exists(#n)"),
            update: Some("SET #p = :v"),
            ..Default::default()
        };
        let ctx = ExpressionContext::compile(input, &names, &values).expect("compile");
        assert!(ctx.condition.is_some());
        assert!(ctx.update.is_some());
        assert!(ctx.projection.is_none());
    }

    #[test]
    fn test_should_reject_invalid_literal_values() {
        let names = names(&[]);
        let values = HashMap::from([(":n".to_owned(), AttributeValue::N("abc".to_owned()))]);
        let input = ExpressionInput {
            condition: Some("a = :n"),
            ..Default::default()
        };
        let err = ExpressionContext::compile(input, &names, &values).expect_err("invalid value");
        assert!(err.to_string().starts_with("ExpressionAttributeValues contains invalid value"));
    }
}
