//! Projection of items onto a list of document paths.
//!
//! Paths are grouped by their first element and the walk recurses on the
//! remaining suffixes, so `a.b, a.c` produce one `a` map holding both keys and
//! list elements come out in ascending index order. Paths that do not resolve
//! are dropped silently.

use std::collections::{BTreeMap, HashMap};

use dynamo_adapter_model::{AttributeValue, Item};

use super::ast::{AttributePath, PathElement};

/// Build a new item holding only the attributes named by `paths`.
///
/// An empty path list returns the whole item.
#[must_use]
pub fn project_item(item: &Item, paths: &[AttributePath]) -> Item {
    if paths.is_empty() {
        return item.clone();
    }
    let suffixes: Vec<&[PathElement]> = paths.iter().map(|p| p.elements.as_slice()).collect();
    project_map(item, &suffixes)
}

fn project_map(
    map: &HashMap<String, AttributeValue>,
    paths: &[&[PathElement]],
) -> HashMap<String, AttributeValue> {
    let mut groups: BTreeMap<&str, Vec<&[PathElement]>> = BTreeMap::new();
    for path in paths {
        if let Some((PathElement::Attribute(name), rest)) = path.split_first() {
            groups.entry(name.as_str()).or_default().push(rest);
        }
    }

    groups
        .into_iter()
        .filter_map(|(name, rests)| {
            let value = project_value(map.get(name)?, &rests)?;
            Some((name.to_owned(), value))
        })
        .collect()
}

fn project_value(value: &AttributeValue, rests: &[&[PathElement]]) -> Option<AttributeValue> {
    if rests.iter().any(|rest| rest.is_empty()) {
        return Some(value.clone());
    }

    match value {
        AttributeValue::M(map) => {
            let projected = project_map(map, rests);
            (!projected.is_empty()).then_some(AttributeValue::M(projected))
        }
        AttributeValue::L(list) => {
            let mut groups: BTreeMap<usize, Vec<&[PathElement]>> = BTreeMap::new();
            for rest in rests {
                if let Some((PathElement::Index(idx), tail)) = rest.split_first() {
                    groups.entry(*idx).or_default().push(tail);
                }
            }
            let projected: Vec<AttributeValue> = groups
                .into_iter()
                .filter_map(|(idx, tails)| project_value(list.get(idx)?, &tails))
                .collect();
            (!projected.is_empty()).then_some(AttributeValue::L(projected))
        }
        _ => None,
    }
}
