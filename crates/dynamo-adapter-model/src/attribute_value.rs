//! `AttributeValue`: the typed value carried by every item attribute.
//!
//! `AttributeValue` is a tagged union where exactly one variant is present.
//! The JSON wire format uses single-key objects like `{"S": "hello"}`.
//!
//! Equality is value-based rather than textual: numbers compare through
//! [`Number`], and the three set variants compare without regard to element
//! order. `Hash` is kept consistent with that equality so attribute values
//! can be used as partition keys.

use std::collections::HashMap;
use std::fmt;

use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::number::{Number, NumberError};

/// An item: attribute name to typed value.
pub type Item = HashMap<String, AttributeValue>;

/// A typed attribute value.
///
/// Numbers are string-encoded on the wire and validated through [`Number`]
/// whenever they are compared or computed with.
#[derive(Debug, Clone)]
pub enum AttributeValue {
    /// String value.
    S(String),
    /// Number value (string-encoded for arbitrary precision).
    N(String),
    /// Binary value (base64-encoded in JSON).
    B(bytes::Bytes),
    /// String Set.
    Ss(Vec<String>),
    /// Number Set (string-encoded).
    Ns(Vec<String>),
    /// Binary Set (base64-encoded in JSON).
    Bs(Vec<bytes::Bytes>),
    /// Boolean value.
    Bool(bool),
    /// Null value.
    Null(bool),
    /// List of attribute values.
    L(Vec<AttributeValue>),
    /// Map of attribute values.
    M(HashMap<String, AttributeValue>),
}

/// Reasons an attribute value is not storable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValueError {
    /// A number or number-set element failed to parse.
    #[error(transparent)]
    Number(#[from] NumberError),
    /// A set with no elements.
    #[error("One or more parameter values were invalid: An empty set is not allowed")]
    EmptySet,
    /// A set containing the same element twice.
    #[error("One or more parameter values were invalid: Input collection contains duplicates")]
    DuplicateSetElement,
}

impl AttributeValue {
    /// Build an `N` value from an exact number, using its canonical text.
    #[must_use]
    pub fn number(n: &Number) -> Self {
        Self::N(n.to_canonical_string())
    }

    /// Returns `true` if this is a string value.
    #[must_use]
    pub fn is_s(&self) -> bool {
        matches!(self, Self::S(_))
    }

    /// Returns `true` if this is a number value.
    #[must_use]
    pub fn is_n(&self) -> bool {
        matches!(self, Self::N(_))
    }

    /// Returns `true` if this is a null value.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null(true))
    }

    /// Returns `true` for the three set variants.
    #[must_use]
    pub fn is_set(&self) -> bool {
        matches!(self, Self::Ss(_) | Self::Ns(_) | Self::Bs(_))
    }

    /// Returns the string value if this is an `S` variant.
    #[must_use]
    pub fn as_s(&self) -> Option<&str> {
        match self {
            Self::S(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the number string if this is an `N` variant.
    #[must_use]
    pub fn as_n(&self) -> Option<&str> {
        match self {
            Self::N(n) => Some(n),
            _ => None,
        }
    }

    /// Parses an `N` variant into an exact [`Number`].
    ///
    /// Returns `None` for every other variant.
    #[must_use]
    pub fn to_number(&self) -> Option<Result<Number, NumberError>> {
        self.as_n().map(Number::parse)
    }

    /// Returns the map if this is an `M` variant.
    #[must_use]
    pub fn as_m(&self) -> Option<&HashMap<String, AttributeValue>> {
        match self {
            Self::M(m) => Some(m),
            _ => None,
        }
    }

    /// Returns the list if this is an `L` variant.
    #[must_use]
    pub fn as_l(&self) -> Option<&[AttributeValue]> {
        match self {
            Self::L(l) => Some(l),
            _ => None,
        }
    }

    /// Returns the DynamoDB type descriptor string (e.g., "S", "N", "BOOL").
    #[must_use]
    pub fn type_descriptor(&self) -> &'static str {
        match self {
            Self::S(_) => "S",
            Self::N(_) => "N",
            Self::B(_) => "B",
            Self::Ss(_) => "SS",
            Self::Ns(_) => "NS",
            Self::Bs(_) => "BS",
            Self::Bool(_) => "BOOL",
            Self::Null(_) => "NULL",
            Self::L(_) => "L",
            Self::M(_) => "M",
        }
    }

    /// Check that this value can be stored: numbers parse within limits and
    /// sets are non-empty without duplicates. Recurses into lists and maps.
    pub fn validate(&self) -> Result<(), ValueError> {
        match self {
            Self::N(n) => {
                Number::parse(n)?;
                Ok(())
            }
            Self::Ss(v) => check_set(v.iter().cloned()),
            Self::Bs(v) => check_set(v.iter().cloned()),
            Self::Ns(v) => {
                let parsed = v
                    .iter()
                    .map(|n| Number::parse(n))
                    .collect::<Result<Vec<_>, _>>()?;
                check_set(parsed.into_iter())
            }
            Self::L(list) => list.iter().try_for_each(Self::validate),
            Self::M(map) => map.values().try_for_each(Self::validate),
            Self::S(_) | Self::B(_) | Self::Bool(_) | Self::Null(_) => Ok(()),
        }
    }

    /// Size of this value under DynamoDB's item size accounting.
    #[must_use]
    pub fn size_in_bytes(&self) -> u64 {
        match self {
            Self::S(s) => s.len() as u64,
            Self::N(n) => number_size(n),
            Self::B(b) => b.len() as u64,
            Self::Bool(_) | Self::Null(_) => 1,
            Self::Ss(v) => v.iter().map(|s| s.len() as u64).sum(),
            Self::Ns(v) => v.iter().map(|n| number_size(n)).sum(),
            Self::Bs(v) => v.iter().map(|b| b.len() as u64).sum(),
            Self::L(list) => 3 + list.iter().map(|e| 1 + e.size_in_bytes()).sum::<u64>(),
            Self::M(map) => {
                3 + map
                    .iter()
                    .map(|(k, v)| k.len() as u64 + 1 + v.size_in_bytes())
                    .sum::<u64>()
            }
        }
    }
}

/// Total size of an item: attribute name lengths plus value sizes.
#[must_use]
#[allow(clippy::implicit_hasher)]
pub fn item_size(item: &HashMap<String, AttributeValue>) -> u64 {
    item.iter()
        .map(|(name, value)| name.len() as u64 + value.size_in_bytes())
        .sum()
}

fn number_size(n: &str) -> u64 {
    (n.len().div_ceil(2) + 1) as u64
}

fn check_set<T: Eq + std::hash::Hash>(elements: impl Iterator<Item = T>) -> Result<(), ValueError> {
    let mut seen = std::collections::HashSet::new();
    for element in elements {
        if !seen.insert(element) {
            return Err(ValueError::DuplicateSetElement);
        }
    }
    if seen.is_empty() {
        return Err(ValueError::EmptySet);
    }
    Ok(())
}

/// Compare two number strings by value, falling back to text when either
/// side is not a valid number.
fn numbers_equal(a: &str, b: &str) -> bool {
    match (Number::parse(a), Number::parse(b)) {
        (Ok(x), Ok(y)) => x == y,
        _ => a == b,
    }
}

/// Canonical text of a number string for hashing.
fn number_hash_key(n: &str) -> String {
    Number::parse(n).map_or_else(|_| n.to_owned(), |num| num.to_canonical_string())
}

fn same_elements<T>(a: &[T], b: &[T], eq: impl Fn(&T, &T) -> bool) -> bool {
    a.len() == b.len() && a.iter().all(|x| b.iter().any(|y| eq(x, y)))
}

impl PartialEq for AttributeValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::S(a), Self::S(b)) => a == b,
            (Self::N(a), Self::N(b)) => numbers_equal(a, b),
            (Self::B(a), Self::B(b)) => a == b,
            (Self::Ss(a), Self::Ss(b)) => same_elements(a, b, |x, y| x == y),
            (Self::Ns(a), Self::Ns(b)) => same_elements(a, b, |x, y| numbers_equal(x, y)),
            (Self::Bs(a), Self::Bs(b)) => same_elements(a, b, |x, y| x == y),
            (Self::Bool(a), Self::Bool(b)) | (Self::Null(a), Self::Null(b)) => a == b,
            (Self::L(a), Self::L(b)) => a == b,
            (Self::M(a), Self::M(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for AttributeValue {}

impl std::hash::Hash for AttributeValue {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        core::mem::discriminant(self).hash(state);
        match self {
            Self::S(s) => s.hash(state),
            Self::N(n) => number_hash_key(n).hash(state),
            Self::B(b) => b.hash(state),
            Self::Bool(b) | Self::Null(b) => b.hash(state),
            Self::Ss(v) => {
                let mut sorted: Vec<&String> = v.iter().collect();
                sorted.sort();
                sorted.hash(state);
            }
            Self::Ns(v) => {
                let mut sorted: Vec<String> = v.iter().map(|n| number_hash_key(n)).collect();
                sorted.sort();
                sorted.hash(state);
            }
            Self::Bs(v) => {
                let mut sorted: Vec<&bytes::Bytes> = v.iter().collect();
                sorted.sort();
                sorted.hash(state);
            }
            Self::L(v) => v.hash(state),
            Self::M(m) => {
                // Deterministic hash for maps: sort keys.
                let mut pairs: Vec<_> = m.iter().collect();
                pairs.sort_by_key(|(k, _)| *k);
                for (k, v) in pairs {
                    k.hash(state);
                    v.hash(state);
                }
            }
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::S(s) => write!(f, "{{S: {s}}}"),
            Self::N(n) => write!(f, "{{N: {n}}}"),
            Self::B(b) => write!(f, "{{B: {} bytes}}", b.len()),
            Self::Ss(v) => write!(f, "{{SS: {v:?}}}"),
            Self::Ns(v) => write!(f, "{{NS: {v:?}}}"),
            Self::Bs(v) => write!(f, "{{BS: {} items}}", v.len()),
            Self::Bool(b) => write!(f, "{{BOOL: {b}}}"),
            Self::Null(b) => write!(f, "{{NULL: {b}}}"),
            Self::L(v) => write!(f, "{{L: {} items}}", v.len()),
            Self::M(m) => write!(f, "{{M: {} keys}}", m.len()),
        }
    }
}

impl Serialize for AttributeValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use base64::Engine;

        let mut map = serializer.serialize_map(Some(1))?;
        match self {
            Self::S(s) => map.serialize_entry("S", s)?,
            Self::N(n) => map.serialize_entry("N", n)?,
            Self::B(b) => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(b);
                map.serialize_entry("B", &encoded)?;
            }
            Self::Ss(v) => map.serialize_entry("SS", v)?,
            Self::Ns(v) => map.serialize_entry("NS", v)?,
            Self::Bs(v) => {
                let encoded: Vec<String> = v
                    .iter()
                    .map(|b| base64::engine::general_purpose::STANDARD.encode(b))
                    .collect();
                map.serialize_entry("BS", &encoded)?;
            }
            Self::Bool(b) => map.serialize_entry("BOOL", b)?,
            Self::Null(b) => map.serialize_entry("NULL", b)?,
            Self::L(list) => map.serialize_entry("L", list)?,
            Self::M(m) => map.serialize_entry("M", m)?,
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for AttributeValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(AttributeValueVisitor)
    }
}

struct AttributeValueVisitor;

impl<'de> Visitor<'de> for AttributeValueVisitor {
    type Value = AttributeValue;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("an AttributeValue object with exactly one type key")
    }

    fn visit_map<M: MapAccess<'de>>(self, mut map: M) -> Result<Self::Value, M::Error> {
        use base64::Engine;

        let Some(key) = map.next_key::<String>()? else {
            return Err(de::Error::custom(
                "AttributeValue must have exactly one key",
            ));
        };

        let value = match key.as_str() {
            "S" => AttributeValue::S(map.next_value()?),
            "N" => AttributeValue::N(map.next_value()?),
            "B" => {
                let encoded: String = map.next_value()?;
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(&encoded)
                    .map_err(de::Error::custom)?;
                AttributeValue::B(bytes::Bytes::from(decoded))
            }
            "SS" => AttributeValue::Ss(map.next_value()?),
            "NS" => AttributeValue::Ns(map.next_value()?),
            "BS" => {
                let encoded: Vec<String> = map.next_value()?;
                let decoded: Result<Vec<bytes::Bytes>, _> = encoded
                    .iter()
                    .map(|e| {
                        base64::engine::general_purpose::STANDARD
                            .decode(e)
                            .map(bytes::Bytes::from)
                    })
                    .collect();
                AttributeValue::Bs(decoded.map_err(de::Error::custom)?)
            }
            "BOOL" => AttributeValue::Bool(map.next_value()?),
            "NULL" => AttributeValue::Null(map.next_value()?),
            "L" => AttributeValue::L(map.next_value()?),
            "M" => AttributeValue::M(map.next_value()?),
            other => {
                return Err(de::Error::unknown_field(
                    other,
                    &["S", "N", "B", "SS", "NS", "BS", "BOOL", "NULL", "L", "M"],
                ));
            }
        };

        if map.next_key::<String>()?.is_some() {
            return Err(de::Error::custom(
                "AttributeValue must have exactly one key",
            ));
        }

        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_serialize_wire_tags() {
        let val = AttributeValue::L(vec![
            AttributeValue::S("a".to_owned()),
            AttributeValue::N("1".to_owned()),
            AttributeValue::Bool(true),
            AttributeValue::Null(true),
        ]);
        let json = serde_json::to_string(&val).expect("serialize list");
        assert_eq!(
            json,
            r#"{"L":[{"S":"a"},{"N":"1"},{"BOOL":true},{"NULL":true}]}"#
        );
    }

    #[test]
    fn test_should_roundtrip_binary_value() {
        let val = AttributeValue::B(bytes::Bytes::from_static(b"test data"));
        let json = serde_json::to_string(&val).expect("serialize binary");
        assert_eq!(json, r#"{"B":"dGVzdCBkYXRh"}"#);
        let deserialized: AttributeValue = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(val, deserialized);
    }

    #[test]
    fn test_should_reject_unknown_or_multiple_type_keys() {
        assert!(serde_json::from_str::<AttributeValue>(r#"{"X":"1"}"#).is_err());
        assert!(serde_json::from_str::<AttributeValue>(r#"{"S":"a","N":"1"}"#).is_err());
        assert!(serde_json::from_str::<AttributeValue>("{}").is_err());
    }

    #[test]
    fn test_should_compare_numbers_by_value() {
        assert_eq!(
            AttributeValue::N("1".to_owned()),
            AttributeValue::N("1.00".to_owned())
        );
        assert_ne!(
            AttributeValue::N("1".to_owned()),
            AttributeValue::S("1".to_owned())
        );
    }

    #[test]
    fn test_should_hash_equal_values_identically() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(AttributeValue::N("10".to_owned()));
        assert!(set.contains(&AttributeValue::N("1e1".to_owned())));

        set.insert(AttributeValue::Ss(vec!["a".to_owned(), "b".to_owned()]));
        assert!(set.contains(&AttributeValue::Ss(vec!["b".to_owned(), "a".to_owned()])));
    }

    #[test]
    fn test_should_reject_duplicate_and_empty_sets() {
        let dup = AttributeValue::Ns(vec!["1".to_owned(), "1.0".to_owned()]);
        assert_eq!(dup.validate(), Err(ValueError::DuplicateSetElement));
        assert_eq!(AttributeValue::Ss(vec![]).validate(), Err(ValueError::EmptySet));

        let nested = AttributeValue::M(HashMap::from([(
            "n".to_owned(),
            AttributeValue::N("abc".to_owned()),
        )]));
        assert!(matches!(nested.validate(), Err(ValueError::Number(_))));
    }

    #[test]
    fn test_should_compute_item_size() {
        let item: Item = HashMap::from([
            ("pk".to_owned(), AttributeValue::S("abc".to_owned())),
            ("n".to_owned(), AttributeValue::N("123".to_owned())),
        ]);
        // "pk" (2) + "abc" (3) + "n" (1) + N "123" (2 + 1)
        assert_eq!(item_size(&item), 9);
    }
}
