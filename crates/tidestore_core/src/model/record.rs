//! Untyped records and the typed `Persistable` bridge.
//!
//! # Responsibility
//! - Carry attribute values between typed entities and storage.
//! - Provide attribute ordering for sort descriptors.
//!
//! # Invariants
//! - `Record::entity` names the entity the record was created for and never
//!   changes for the record's lifetime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Stable identifier of a persisted record.
pub type RecordId = Uuid;

/// One attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum AttributeValue {
    Null,
    Text(String),
    Integer(i64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
}

impl AttributeValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Total order used by sort descriptors.
    ///
    /// `Null` sorts first; values of different kinds order by kind.
    pub fn compare(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Text(left), Self::Text(right)) => left.cmp(right),
            (Self::Integer(left), Self::Integer(right)) => left.cmp(right),
            (Self::Bool(left), Self::Bool(right)) => left.cmp(right),
            (Self::Timestamp(left), Self::Timestamp(right)) => left.cmp(right),
            _ => self.rank().cmp(&other.rank()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Integer(_) => 2,
            Self::Timestamp(_) => 3,
            Self::Text(_) => 4,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<DateTime<Utc>> for AttributeValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl<T: Into<AttributeValue>> From<Option<T>> for AttributeValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Untyped entity instance as stored by contexts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub entity: String,
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl Record {
    /// Creates an empty record with a generated id.
    pub fn new(entity: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), entity)
    }

    pub fn with_id(id: RecordId, entity: impl Into<String>) -> Self {
        Self {
            id,
            entity: entity.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Builder-style attribute setter.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<AttributeValue>) {
        self.attributes.insert(name.into(), value.into());
    }

    /// Returns the attribute value; missing attributes read as `Null`.
    pub fn get(&self, name: &str) -> &AttributeValue {
        static NULL: AttributeValue = AttributeValue::Null;
        self.attributes.get(name).unwrap_or(&NULL)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            AttributeValue::Text(value) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn integer(&self, name: &str) -> Option<i64> {
        match self.get(name) {
            AttributeValue::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        match self.get(name) {
            AttributeValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn timestamp(&self, name: &str) -> Option<DateTime<Utc>> {
        match self.get(name) {
            AttributeValue::Timestamp(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the text attribute or a `MissingAttribute` error.
    pub fn require_text(&self, name: &str) -> Result<String, RecordError> {
        self.text(name)
            .map(str::to_string)
            .ok_or_else(|| RecordError::MissingAttribute {
                entity: self.entity.clone(),
                attribute: name.to_string(),
            })
    }

    pub fn is_entity(&self, entity: &str) -> bool {
        self.entity == entity
    }
}

/// Conversion failure between a `Record` and a typed entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    WrongEntity { expected: String, actual: String },
    MissingAttribute { entity: String, attribute: String },
}

impl Display for RecordError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WrongEntity { expected, actual } => {
                write!(f, "expected `{expected}` record, got `{actual}`")
            }
            Self::MissingAttribute { entity, attribute } => {
                write!(f, "`{entity}` record is missing attribute `{attribute}`")
            }
        }
    }
}

impl Error for RecordError {}

/// Capability implemented by every typed entity the store persists.
///
/// Replaces lookup by runtime type name: generic context operations use
/// `ENTITY` to select records and the conversions to cross the boundary.
pub trait Persistable: Sized {
    /// Entity name as declared in the model schema.
    const ENTITY: &'static str;

    fn id(&self) -> RecordId;

    fn to_record(&self) -> Record;

    fn from_record(record: &Record) -> Result<Self, RecordError>;

    /// Rejects records of another entity before `from_record` runs.
    fn decode(record: &Record) -> Result<Self, RecordError> {
        if !record.is_entity(Self::ENTITY) {
            return Err(RecordError::WrongEntity {
                expected: Self::ENTITY.to_string(),
                actual: record.entity.clone(),
            });
        }
        Self::from_record(record)
    }
}

/// Sort key for fetch requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortDescriptor {
    pub attribute: String,
    pub ascending: bool,
}

impl SortDescriptor {
    pub fn ascending(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            ascending: true,
        }
    }

    pub fn descending(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            ascending: false,
        }
    }
}

/// Orders two records by a list of sort descriptors, then by id.
pub fn compare_records(left: &Record, right: &Record, sort: &[SortDescriptor]) -> Ordering {
    for descriptor in sort {
        let ordering = left
            .get(&descriptor.attribute)
            .compare(right.get(&descriptor.attribute));
        let ordering = if descriptor.ascending {
            ordering
        } else {
            ordering.reverse()
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    left.id.cmp(&right.id)
}
