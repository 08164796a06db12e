//! Row, condition and update types shared by every backend
//!
//! The evaluation helpers here are the single definition of conditional-write
//! semantics; backends only provide the per-row atomicity around them.

use crate::error::{KvError, KvResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Two-part row key: the partition selects the hash bucket, the sort key
/// orders rows inside it.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemKey {
    pub partition: String,
    pub sort: String,
}

impl ItemKey {
    pub fn new(partition: impl Into<String>, sort: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            sort: sort.into(),
        }
    }
}

impl fmt::Debug for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ItemKey({:?}, {:?})", self.partition, self.sort)
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.partition, self.sort)
    }
}

/// A single attribute value
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttrValue {
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
    /// Ordered list of strings
    List(Vec<String>),
}

impl AttrValue {
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            Self::List(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for AttrValue {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Vec<u8>> for AttrValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<Vec<String>> for AttrValue {
    fn from(v: Vec<String>) -> Self {
        Self::List(v)
    }
}

/// Attribute map of one row
pub type Attrs = BTreeMap<String, AttrValue>;

/// A row: key plus attributes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Item {
    pub key: ItemKey,
    pub attrs: Attrs,
}

impl Item {
    #[must_use]
    pub const fn new(key: ItemKey) -> Self {
        Self {
            key,
            attrs: BTreeMap::new(),
        }
    }

    /// Builder-style attribute setter
    #[must_use]
    pub fn with(mut self, name: &str, value: impl Into<AttrValue>) -> Self {
        self.attrs.insert(name.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.attrs.get(name)
    }

    #[must_use]
    pub fn int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(AttrValue::as_int)
    }

    #[must_use]
    pub fn str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(AttrValue::as_str)
    }

    #[must_use]
    pub fn bytes(&self, name: &str) -> Option<&[u8]> {
        self.get(name).and_then(AttrValue::as_bytes)
    }

    #[must_use]
    pub fn list(&self, name: &str) -> Option<&[String]> {
        self.get(name).and_then(AttrValue::as_list)
    }

    /// Keep only the named attributes (`None` keeps everything)
    #[must_use]
    pub fn project(mut self, projection: Option<&[&str]>) -> Self {
        if let Some(names) = projection {
            self.attrs.retain(|k, _| names.contains(&k.as_str()));
        }
        self
    }
}

/// Precondition for a conditional write, evaluated against the current row
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Condition {
    Always,
    Exists,
    NotExists,
    AttrExists(String),
    AttrAbsent(String),
    AttrEquals(String, AttrValue),
    /// The list attribute contains the value
    Contains(String, String),
    And(Vec<Condition>),
}

impl Condition {
    pub fn attr_equals(name: &str, value: impl Into<AttrValue>) -> Self {
        Self::AttrEquals(name.to_string(), value.into())
    }

    pub fn contains(name: &str, value: impl Into<String>) -> Self {
        Self::Contains(name.to_string(), value.into())
    }

    /// Evaluate against the current state of the row
    #[must_use]
    pub fn evaluate(&self, current: Option<&Attrs>) -> bool {
        match self {
            Self::Always => true,
            Self::Exists => current.is_some(),
            Self::NotExists => current.is_none(),
            Self::AttrExists(name) => current.is_some_and(|a| a.contains_key(name)),
            Self::AttrAbsent(name) => current.is_none_or(|a| !a.contains_key(name)),
            Self::AttrEquals(name, value) => current.is_some_and(|a| a.get(name) == Some(value)),
            Self::Contains(name, value) => current.is_some_and(|a| {
                a.get(name)
                    .and_then(AttrValue::as_list)
                    .is_some_and(|l| l.iter().any(|v| v == value))
            }),
            Self::And(all) => all.iter().all(|c| c.evaluate(current)),
        }
    }
}

/// One attribute mutation inside an update
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdateOp {
    Set(String, AttrValue),
    Remove(String),
    /// Add to an integer attribute (missing counts as zero)
    Add(String, i64),
    /// Append to a list attribute unless already present
    Append(String, String),
    /// Remove every occurrence of a value from a list attribute
    Discard(String, String),
}

impl UpdateOp {
    pub fn set(name: &str, value: impl Into<AttrValue>) -> Self {
        Self::Set(name.to_string(), value.into())
    }

    pub fn remove(name: &str) -> Self {
        Self::Remove(name.to_string())
    }

    pub fn add(name: &str, delta: i64) -> Self {
        Self::Add(name.to_string(), delta)
    }

    pub fn append(name: &str, value: impl Into<String>) -> Self {
        Self::Append(name.to_string(), value.into())
    }

    pub fn discard(name: &str, value: impl Into<String>) -> Self {
        Self::Discard(name.to_string(), value.into())
    }
}

/// Apply update operations in order. Type mismatches reject the whole update.
pub fn apply_updates(attrs: &mut Attrs, ops: &[UpdateOp]) -> KvResult<()> {
    for op in ops {
        match op {
            UpdateOp::Set(name, value) => {
                attrs.insert(name.clone(), value.clone());
            }
            UpdateOp::Remove(name) => {
                attrs.remove(name);
            }
            UpdateOp::Add(name, delta) => {
                let current = match attrs.get(name) {
                    None => 0,
                    Some(AttrValue::Int(v)) => *v,
                    Some(other) => {
                        return Err(KvError::Rejected(format!(
                            "cannot add to non-integer attribute {name}: {other:?}"
                        )));
                    }
                };
                attrs.insert(name.clone(), AttrValue::Int(current + delta));
            }
            UpdateOp::Append(name, value) | UpdateOp::Discard(name, value) => {
                let entry = attrs
                    .entry(name.clone())
                    .or_insert_with(|| AttrValue::List(Vec::new()));
                let AttrValue::List(list) = entry else {
                    return Err(KvError::Rejected(format!(
                        "attribute {name} is not a list"
                    )));
                };
                if matches!(op, UpdateOp::Append(..)) {
                    if !list.contains(value) {
                        list.push(value.clone());
                    }
                } else {
                    list.retain(|v| v != value);
                }
            }
        }
    }
    Ok(())
}

/// Predicate on the sort key for range queries
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SortCondition {
    All,
    Ge(String),
}

impl SortCondition {
    #[must_use]
    pub fn matches(&self, sort: &str) -> bool {
        match self {
            Self::All => true,
            Self::Ge(bound) => sort >= bound.as_str(),
        }
    }
}

/// Outcome of a conditional write. A failed condition is an expected
/// result, not an error.
#[derive(Clone, Debug, PartialEq, Eq)]
#[must_use]
pub enum Conditional<T> {
    Applied(T),
    ConditionFailed,
}

impl<T> Conditional<T> {
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    pub fn applied(self) -> Option<T> {
        match self {
            Self::Applied(v) => Some(v),
            Self::ConditionFailed => None,
        }
    }
}

/// One page of a range query or scan
#[derive(Clone, Debug, Default)]
pub struct Page {
    pub items: Vec<Item>,
    /// Resume point; `None` when the range is exhausted
    pub last_key: Option<ItemKey>,
}
