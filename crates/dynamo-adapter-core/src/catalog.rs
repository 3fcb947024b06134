//! Table schemas and the catalog that serves them.
//!
//! A [`TableSchema`] describes how a logical table maps onto the backing
//! store: its key attributes, its secondary indexes, the physical table it
//! lives in, and the column identifier each attribute is stored under.
//! Schemas are immutable once registered and shared as `Arc<TableSchema>`.
//!
//! The catalog can be populated in code or from a JSON table file:
//!
//! ```json
//! {
//!   "employee": {
//!     "partitionKey": "emp_id",
//!     "partitionKeyType": "N",
//!     "columns": { "emp_id": "emp_id", "first_name": "first_name" },
//!     "indices": {
//!       "by_age": { "partitionKey": "age", "partitionKeyType": "N" }
//!     }
//!   },
//!   "staff": { "actualTable": "employee" }
//! }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use dashmap::DashMap;
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use dynamo_adapter_model::types::ScalarAttributeType;
use dynamo_adapter_model::{AttributeValue, Item};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised by schema lookups.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    /// The table is not registered.
    #[error("Requested resource not found: Table: {0} not found")]
    TableNotFound(String),
    /// A schema definition is unusable.
    #[error("Invalid table definition: {0}")]
    InvalidSchema(String),
}

/// Errors raised when a key map or item does not fit a key schema.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    /// The key map names attributes other than the key attributes.
    #[error(
        "One or more parameter values are not valid. Number of user supplied keys don't match number of table schema keys. Keys provided: [{provided}], schema keys: [{schema}]"
    )]
    CountMismatch {
        /// Attribute names supplied, sorted.
        provided: String,
        /// Key attribute names of the schema.
        schema: String,
    },
    /// A key attribute is absent.
    #[error("One or more parameter values were invalid: Missing the key {name} in the item")]
    Missing {
        /// The key attribute name.
        name: String,
    },
    /// A key attribute has the wrong scalar type.
    #[error(
        "The provided key element does not match the schema. Expected type {expected} for key column {name}, got type {actual}"
    )]
    TypeMismatch {
        /// The key attribute name.
        name: String,
        /// The declared type.
        expected: ScalarAttributeType,
        /// The supplied type tag.
        actual: &'static str,
    },
    /// A string or binary key attribute is empty.
    #[error(
        "One or more parameter values are not valid. The AttributeValue for a key attribute cannot contain an empty string value. Key: {name}"
    )]
    EmptyValue {
        /// The key attribute name.
        name: String,
    },
}

// ---------------------------------------------------------------------------
// Key schema
// ---------------------------------------------------------------------------

/// A key attribute definition with its name and scalar type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyAttribute {
    /// The attribute name.
    pub name: String,
    /// The scalar type (S, N, or B).
    pub attribute_type: ScalarAttributeType,
}

impl KeyAttribute {
    /// Create a key attribute definition.
    #[must_use]
    pub fn new(name: impl Into<String>, attribute_type: ScalarAttributeType) -> Self {
        Self {
            name: name.into(),
            attribute_type,
        }
    }

    /// Check a value supplied for this attribute: declared type, non-empty.
    pub fn check(&self, value: &AttributeValue) -> Result<(), KeyError> {
        if !self.attribute_type.matches(value) {
            return Err(KeyError::TypeMismatch {
                name: self.name.clone(),
                expected: self.attribute_type.clone(),
                actual: value.type_descriptor(),
            });
        }
        let empty = match value {
            AttributeValue::S(s) => s.is_empty(),
            AttributeValue::B(b) => b.is_empty(),
            _ => false,
        };
        if empty {
            return Err(KeyError::EmptyValue {
                name: self.name.clone(),
            });
        }
        Ok(())
    }
}

/// Partition key plus optional sort key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySchema {
    /// Partition (HASH) key.
    pub partition_key: KeyAttribute,
    /// Optional sort (RANGE) key.
    pub sort_key: Option<KeyAttribute>,
}

impl KeySchema {
    /// Create a key schema.
    #[must_use]
    pub fn new(partition_key: KeyAttribute, sort_key: Option<KeyAttribute>) -> Self {
        Self {
            partition_key,
            sort_key,
        }
    }

    /// The key attributes, partition key first.
    pub fn attributes(&self) -> impl Iterator<Item = &KeyAttribute> {
        std::iter::once(&self.partition_key).chain(self.sort_key.iter())
    }

    /// Whether `name` is the partition or sort key.
    #[must_use]
    pub fn is_key_attribute(&self, name: &str) -> bool {
        self.attributes().any(|ka| ka.name == name)
    }

    /// Copy the key attributes out of `item`, or `None` if any is missing.
    #[must_use]
    pub fn key_of(&self, item: &Item) -> Option<Item> {
        self.attributes()
            .map(|ka| Some((ka.name.clone(), item.get(&ka.name)?.clone())))
            .collect()
    }

    /// Check a `Key` map: it must hold exactly the key attributes with the
    /// declared types.
    pub fn validate_key(&self, key: &Item) -> Result<(), KeyError> {
        let expected = self.attributes().count();
        if key.len() != expected || key.keys().any(|name| !self.is_key_attribute(name)) {
            let mut provided: Vec<&str> = key.keys().map(String::as_str).collect();
            provided.sort_unstable();
            return Err(KeyError::CountMismatch {
                provided: provided.join(", "),
                schema: self
                    .attributes()
                    .map(|ka| ka.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        }
        self.validate_item(key)
    }

    /// Check that `item` carries every key attribute with the declared type.
    pub fn validate_item(&self, item: &Item) -> Result<(), KeyError> {
        for ka in self.attributes() {
            let value = item.get(&ka.name).ok_or_else(|| KeyError::Missing {
                name: ka.name.clone(),
            })?;
            ka.check(value)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Table schema
// ---------------------------------------------------------------------------

/// A secondary index: a name and its own key schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSchema {
    /// Index name as used in `IndexName`.
    pub name: String,
    /// The index key.
    pub key_schema: KeySchema,
}

/// Everything the adapter knows about one logical table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    /// Logical table name as used in requests.
    pub name: String,
    /// Name of the table in the backing store.
    pub physical_name: String,
    /// The primary key.
    pub key_schema: KeySchema,
    /// Secondary indexes by name.
    pub indexes: HashMap<String, IndexSchema>,
    /// Attribute name to backing-store column identifier. Attributes with no
    /// entry are stored under their own name.
    pub columns: HashMap<String, String>,
}

impl TableSchema {
    /// A table stored under its own name with no indexes and identity
    /// column mapping.
    #[must_use]
    pub fn new(name: impl Into<String>, key_schema: KeySchema) -> Self {
        let name = name.into();
        Self {
            physical_name: name.clone(),
            name,
            key_schema,
            indexes: HashMap::new(),
            columns: HashMap::new(),
        }
    }

    /// Store the table under a different physical name.
    #[must_use]
    pub fn with_physical_name(mut self, physical_name: impl Into<String>) -> Self {
        self.physical_name = physical_name.into();
        self
    }

    /// Add a secondary index.
    #[must_use]
    pub fn with_index(mut self, name: impl Into<String>, key_schema: KeySchema) -> Self {
        let name = name.into();
        self.indexes.insert(
            name.clone(),
            IndexSchema {
                name,
                key_schema,
            },
        );
        self
    }

    /// Map an attribute onto a backing-store column.
    #[must_use]
    pub fn with_column(mut self, attribute: impl Into<String>, column: impl Into<String>) -> Self {
        self.columns.insert(attribute.into(), column.into());
        self
    }

    /// Look up a secondary index.
    #[must_use]
    pub fn index(&self, name: &str) -> Option<&IndexSchema> {
        self.indexes.get(name)
    }

    /// Column identifier for an attribute.
    #[must_use]
    pub fn column_for<'a>(&'a self, attribute: &'a str) -> &'a str {
        self.columns.get(attribute).map_or(attribute, String::as_str)
    }

    /// Attribute name for a column identifier.
    #[must_use]
    pub fn attribute_for_column<'a>(&'a self, column: &'a str) -> &'a str {
        self.columns
            .iter()
            .find(|(_, c)| c.as_str() == column)
            .map_or(column, |(attribute, _)| attribute.as_str())
    }

    fn validate(&self) -> Result<(), CatalogError> {
        for ka in self
            .key_schema
            .attributes()
            .chain(self.indexes.values().flat_map(|idx| idx.key_schema.attributes()))
        {
            if !ka.attribute_type.is_valid_key_type() {
                return Err(CatalogError::InvalidSchema(format!(
                    "table {}: key attribute {} has type {}, expected S, N or B",
                    self.name, ka.name, ka.attribute_type
                )));
            }
        }
        let mut seen = HashMap::new();
        for (attribute, column) in &self.columns {
            if let Some(other) = seen.insert(column.as_str(), attribute.as_str()) {
                return Err(CatalogError::InvalidSchema(format!(
                    "table {}: attributes {other} and {attribute} share column {column}",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// Schema lookup capability.
pub trait SchemaCatalog: Send + Sync + fmt::Debug {
    /// Resolve a logical table name.
    fn schema(&self, table: &str) -> Result<Arc<TableSchema>, CatalogError>;
}

/// A catalog held in memory.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    tables: DashMap<String, Arc<TableSchema>>,
}

impl MemoryCatalog {
    /// Create an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a table.
    pub fn register(&self, schema: TableSchema) -> Result<Arc<TableSchema>, CatalogError> {
        schema.validate()?;
        let schema = Arc::new(schema);
        self.tables.insert(schema.name.clone(), Arc::clone(&schema));
        Ok(schema)
    }

    /// Names of all registered tables, sorted.
    #[must_use]
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Every registered schema.
    #[must_use]
    pub fn schemas(&self) -> Vec<Arc<TableSchema>> {
        self.tables.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Build a catalog from a JSON table definition document.
    ///
    /// An entry with `actualTable` is an alias: it takes the key layout of
    /// the named entry and reads and writes that entry's physical table.
    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let raw: HashMap<String, TableConfig> = serde_json::from_str(json)
            .map_err(|e| CatalogError::InvalidSchema(format!("malformed table file: {e}")))?;

        let catalog = Self::new();
        for (name, config) in &raw {
            let (layout, physical_name) = match &config.actual_table {
                Some(actual) if actual != name => {
                    let target = raw.get(actual).ok_or_else(|| {
                        CatalogError::InvalidSchema(format!(
                            "table {name} refers to unknown actualTable {actual}"
                        ))
                    })?;
                    (target, actual.as_str())
                }
                _ => (config, name.as_str()),
            };
            catalog.register(layout.to_schema(name, physical_name)?)?;
        }
        Ok(catalog)
    }

    /// Load a catalog from a JSON table definition file.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read table file {}", path.display()))?;
        let catalog = Self::from_json(&json)
            .with_context(|| format!("failed to load table file {}", path.display()))?;
        info!(path = %path.display(), tables = catalog.tables.len(), "loaded table catalog");
        Ok(catalog)
    }
}

impl SchemaCatalog for MemoryCatalog {
    fn schema(&self, table: &str) -> Result<Arc<TableSchema>, CatalogError> {
        self.tables
            .get(table)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| CatalogError::TableNotFound(table.to_owned()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableConfig {
    #[serde(default)]
    partition_key: Option<String>,
    #[serde(default)]
    partition_key_type: ScalarAttributeType,
    #[serde(default)]
    sort_key: Option<String>,
    #[serde(default)]
    sort_key_type: ScalarAttributeType,
    #[serde(default)]
    actual_table: Option<String>,
    #[serde(default)]
    columns: HashMap<String, String>,
    #[serde(default)]
    indices: HashMap<String, TableConfig>,
}

impl TableConfig {
    fn key_schema(&self, owner: &str) -> Result<KeySchema, CatalogError> {
        let partition = self
            .partition_key
            .as_deref()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| CatalogError::InvalidSchema(format!("{owner} has no partitionKey")))?;
        let sort = self
            .sort_key
            .as_deref()
            .filter(|name| !name.is_empty())
            .map(|name| KeyAttribute::new(name, self.sort_key_type.clone()));
        Ok(KeySchema::new(
            KeyAttribute::new(partition, self.partition_key_type.clone()),
            sort,
        ))
    }

    fn to_schema(&self, name: &str, physical_name: &str) -> Result<TableSchema, CatalogError> {
        let mut schema =
            TableSchema::new(name, self.key_schema(name)?).with_physical_name(physical_name);
        for (index_name, index) in &self.indices {
            let key_schema = index.key_schema(&format!("{name}.{index_name}"))?;
            schema = schema.with_index(index_name.clone(), key_schema);
        }
        schema.columns.clone_from(&self.columns);
        Ok(schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn employee() -> TableSchema {
        TableSchema::new(
            "employee",
            KeySchema::new(KeyAttribute::new("emp_id", ScalarAttributeType::N), None),
        )
    }

    #[test]
    fn test_should_resolve_registered_table() {
        let catalog = MemoryCatalog::new();
        catalog.register(employee()).expect("register");
        let schema = catalog.schema("employee").expect("lookup");
        assert_eq!(schema.physical_name, "employee");
        assert_eq!(
            catalog.schema("nope").expect_err("missing"),
            CatalogError::TableNotFound("nope".to_owned())
        );
    }

    #[test]
    fn test_should_validate_key_maps() {
        let schema = TableSchema::new(
            "orders",
            KeySchema::new(
                KeyAttribute::new("customer", ScalarAttributeType::S),
                Some(KeyAttribute::new("order_no", ScalarAttributeType::N)),
            ),
        );
        let ks = &schema.key_schema;
        let good = Item::from([
            ("customer".to_owned(), AttributeValue::S("c1".to_owned())),
            ("order_no".to_owned(), AttributeValue::N("7".to_owned())),
        ]);
        ks.validate_key(&good).expect("valid key");

        let mut extra = good.clone();
        extra.insert("note".to_owned(), AttributeValue::S("x".to_owned()));
        assert!(matches!(
            ks.validate_key(&extra),
            Err(KeyError::CountMismatch { .. })
        ));

        let mut wrong_type = good.clone();
        wrong_type.insert("order_no".to_owned(), AttributeValue::S("7".to_owned()));
        let err = ks.validate_key(&wrong_type).expect_err("type mismatch");
        assert_eq!(
            err.to_string(),
            "The provided key element does not match the schema. Expected type N for key column order_no, got type S"
        );

        let mut empty = good;
        empty.insert("customer".to_owned(), AttributeValue::S(String::new()));
        assert!(matches!(ks.validate_key(&empty), Err(KeyError::EmptyValue { .. })));
    }

    #[test]
    fn test_should_load_catalog_from_json() {
        let json = r#"{
            "employee": {
                "partitionKey": "emp_id",
                "partitionKeyType": "N",
                "columns": {"first_name": "fname"},
                "indices": {
                    "by_dept": {"partitionKey": "dept", "sortKey": "age", "sortKeyType": "N"}
                }
            },
            "staff": {"actualTable": "employee"}
        }"#;
        let catalog = MemoryCatalog::from_json(json).expect("load");
        assert_eq!(catalog.table_names(), vec!["employee", "staff"]);

        let employee = catalog.schema("employee").expect("employee");
        assert_eq!(employee.key_schema.partition_key.attribute_type, ScalarAttributeType::N);
        assert_eq!(employee.column_for("first_name"), "fname");
        assert_eq!(employee.attribute_for_column("fname"), "first_name");
        assert_eq!(employee.column_for("age"), "age");
        let index = employee.index("by_dept").expect("index");
        assert_eq!(index.key_schema.partition_key.attribute_type, ScalarAttributeType::S);
        assert_eq!(
            index.key_schema.sort_key.as_ref().map(|k| k.name.as_str()),
            Some("age")
        );

        let staff = catalog.schema("staff").expect("alias");
        assert_eq!(staff.physical_name, "employee");
        assert_eq!(staff.key_schema, employee.key_schema);
    }

    #[test]
    fn test_should_reject_invalid_table_definitions() {
        let err = MemoryCatalog::from_json(r#"{"t": {"partitionKey": "id", "partitionKeyType": "BOOL"}}"#)
            .expect_err("bad key type");
        assert!(matches!(err, CatalogError::InvalidSchema(_)));

        let err = MemoryCatalog::from_json(r#"{"t": {"sortKey": "sk"}}"#).expect_err("no pk");
        assert!(err.to_string().contains("no partitionKey"));

        let err =
            MemoryCatalog::from_json(r#"{"t": {"actualTable": "ghost"}}"#).expect_err("dangling");
        assert!(err.to_string().contains("ghost"));
    }
}
