//! Pagination cursors.
//!
//! A cursor marks the last row a page returned. On the wire it travels as
//! `LastEvaluatedKey` / `ExclusiveStartKey`: the key attributes of that row
//! (the table key, plus the index key for index reads) and an `offset`
//! number giving the row's ordinal in the logical ordering of the read.
//! Callers hand the map back unchanged; a start key without `offset` is read
//! as offset zero.

use std::collections::HashSet;

use thiserror::Error;

use dynamo_adapter_model::{AttributeValue, Item};

use crate::catalog::{IndexSchema, KeyAttribute, TableSchema};

/// Name of the ordinal attribute carried next to the key attributes.
pub const OFFSET_ATTRIBUTE: &str = "offset";

/// Errors raised while reading a start key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CursorError {
    /// The start key does not hold exactly the key attributes of the read.
    #[error(
        "The provided starting key is invalid: The provided key element does not match the schema"
    )]
    InvalidStartKey,
    /// The `offset` attribute is not a non-negative integer.
    #[error("The provided starting key is invalid: offset must be a non-negative integer")]
    InvalidOffset,
}

/// Position of the last returned row of a page.
#[derive(Debug, Clone, PartialEq)]
pub struct PaginationCursor {
    /// Key attributes of the row.
    pub key: Item,
    /// Number of rows examined up to and including this one, counted from
    /// the first page of the run.
    pub offset: u64,
}

fn cursor_attributes<'a>(
    schema: &'a TableSchema,
    index: Option<&'a IndexSchema>,
) -> impl Iterator<Item = &'a KeyAttribute> {
    schema
        .key_schema
        .attributes()
        .chain(index.into_iter().flat_map(|idx| idx.key_schema.attributes()))
}

fn offset_is_key(schema: &TableSchema, index: Option<&IndexSchema>) -> bool {
    cursor_attributes(schema, index).any(|ka| ka.name == OFFSET_ATTRIBUTE)
}

impl PaginationCursor {
    /// Build the cursor for `item`, or `None` if it lacks a key attribute.
    #[must_use]
    pub fn for_row(
        schema: &TableSchema,
        index: Option<&IndexSchema>,
        item: &Item,
        offset: u64,
    ) -> Option<Self> {
        let key = cursor_attributes(schema, index)
            .map(|ka| Some((ka.name.clone(), item.get(&ka.name)?.clone())))
            .collect::<Option<Item>>()?;
        Some(Self { key, offset })
    }

    /// The wire form: the key attributes plus `offset`. A table keyed on an
    /// attribute called `offset` gets the key attributes only.
    #[must_use]
    pub fn to_key_map(&self, schema: &TableSchema, index: Option<&IndexSchema>) -> Item {
        let mut map = self.key.clone();
        if !offset_is_key(schema, index) {
            map.insert(
                OFFSET_ATTRIBUTE.to_owned(),
                AttributeValue::N(self.offset.to_string()),
            );
        }
        map
    }

    /// Read an `ExclusiveStartKey`. The map must hold exactly the cursor's
    /// key attributes with their declared types, plus an optional `offset`.
    pub fn from_key_map(
        schema: &TableSchema,
        index: Option<&IndexSchema>,
        map: &Item,
    ) -> Result<Self, CursorError> {
        let mut key = Item::new();
        let mut names = HashSet::new();
        for ka in cursor_attributes(schema, index) {
            let value = map.get(&ka.name).ok_or(CursorError::InvalidStartKey)?;
            if !ka.attribute_type.matches(value) {
                return Err(CursorError::InvalidStartKey);
            }
            if names.insert(ka.name.as_str()) {
                key.insert(ka.name.clone(), value.clone());
            }
        }

        let offset = match map.get(OFFSET_ATTRIBUTE) {
            Some(value) if !names.contains(OFFSET_ATTRIBUTE) => {
                names.insert(OFFSET_ATTRIBUTE);
                value
                    .as_n()
                    .and_then(|n| n.parse::<u64>().ok())
                    .ok_or(CursorError::InvalidOffset)?
            }
            _ => 0,
        };
        if map.len() != names.len() {
            return Err(CursorError::InvalidStartKey);
        }
        Ok(Self { key, offset })
    }
}
