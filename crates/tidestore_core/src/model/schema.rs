//! Model schema definition and record validation.
//!
//! # Responsibility
//! - Load the model definition a store is opened with.
//! - Validate the definition itself and records written against it.
//!
//! # Invariants
//! - Entity and attribute names match `^[A-Za-z][A-Za-z0-9_]*$`.
//! - Only `text` and `timestamp` attributes may be encrypted.
//! - `version` starts at 1 and only grows across model revisions.

use crate::model::record::{AttributeValue, Record};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").expect("valid name regex"));

/// Returns whether `value` is usable as a model, entity or attribute name.
pub fn is_valid_name(value: &str) -> bool {
    NAME_RE.is_match(value)
}

/// Declared storage kind of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeKind {
    Text,
    Integer,
    Bool,
    Timestamp,
}

impl AttributeKind {
    /// Returns whether `value` may be stored in an attribute of this kind.
    ///
    /// `Null` is accepted here; optionality is checked separately.
    pub fn accepts(self, value: &AttributeValue) -> bool {
        matches!(
            (self, value),
            (_, AttributeValue::Null)
                | (Self::Text, AttributeValue::Text(_))
                | (Self::Integer, AttributeValue::Integer(_))
                | (Self::Bool, AttributeValue::Bool(_))
                | (Self::Timestamp, AttributeValue::Timestamp(_))
        )
    }

    pub fn is_encryptable(self) -> bool {
        matches!(self, Self::Text | Self::Timestamp)
    }
}

impl Display for AttributeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Text => "text",
            Self::Integer => "integer",
            Self::Bool => "bool",
            Self::Timestamp => "timestamp",
        };
        f.write_str(name)
    }
}

fn default_optional() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeSchema {
    pub name: String,
    pub kind: AttributeKind,
    /// Optional attributes may be missing or `Null`.
    #[serde(default = "default_optional")]
    pub optional: bool,
    /// Persisted as ciphertext through the attribute transform.
    #[serde(default)]
    pub encrypted: bool,
}

impl AttributeSchema {
    pub fn new(name: impl Into<String>, kind: AttributeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            optional: true,
            encrypted: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.optional = false;
        self
    }

    pub fn encrypted(mut self) -> Self {
        self.encrypted = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySchema {
    pub name: String,
    pub attributes: Vec<AttributeSchema>,
}

impl EntitySchema {
    pub fn new(name: impl Into<String>, attributes: Vec<AttributeSchema>) -> Self {
        Self {
            name: name.into(),
            attributes,
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeSchema> {
        self.attributes
            .iter()
            .find(|attribute| attribute.name == name)
    }
}

/// Full model definition for one store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSchema {
    pub name: String,
    pub version: u32,
    pub entities: Vec<EntitySchema>,
}

impl ModelSchema {
    /// Reads and validates a model definition file.
    ///
    /// # Errors
    /// - `NotFound` when `path` does not exist.
    /// - `Io` when the file exists but cannot be read.
    /// - `Malformed`/`Invalid` when the content is not a usable model.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(SchemaError::NotFound(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path).map_err(|err| SchemaError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        Self::from_json(&text)
    }

    /// Parses and validates a JSON model definition.
    pub fn from_json(text: &str) -> Result<Self, SchemaError> {
        let schema: Self =
            serde_json::from_str(text).map_err(|err| SchemaError::Malformed(err.to_string()))?;
        schema.validate()?;
        Ok(schema)
    }

    /// Checks declaration-level invariants of the model itself.
    pub fn validate(&self) -> Result<(), SchemaError> {
        if !is_valid_name(&self.name) {
            return Err(SchemaError::Invalid(format!(
                "invalid model name `{}`",
                self.name
            )));
        }
        if self.version == 0 {
            return Err(SchemaError::Invalid("model version must be >= 1".to_string()));
        }

        let mut entity_names = BTreeSet::new();
        for entity in &self.entities {
            if !is_valid_name(&entity.name) {
                return Err(SchemaError::Invalid(format!(
                    "invalid entity name `{}`",
                    entity.name
                )));
            }
            if !entity_names.insert(entity.name.as_str()) {
                return Err(SchemaError::Invalid(format!(
                    "duplicate entity `{}`",
                    entity.name
                )));
            }

            let mut attribute_names = BTreeSet::new();
            for attribute in &entity.attributes {
                if !is_valid_name(&attribute.name) {
                    return Err(SchemaError::Invalid(format!(
                        "invalid attribute name `{}.{}`",
                        entity.name, attribute.name
                    )));
                }
                if !attribute_names.insert(attribute.name.as_str()) {
                    return Err(SchemaError::Invalid(format!(
                        "duplicate attribute `{}.{}`",
                        entity.name, attribute.name
                    )));
                }
                if attribute.encrypted && !attribute.kind.is_encryptable() {
                    return Err(SchemaError::Invalid(format!(
                        "attribute `{}.{}` of kind {} cannot be encrypted",
                        entity.name, attribute.name, attribute.kind
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn entity(&self, name: &str) -> Option<&EntitySchema> {
        self.entities.iter().find(|entity| entity.name == name)
    }

    /// Validates one record against its entity declaration.
    pub fn validate_record(&self, record: &Record) -> Result<(), ValidationError> {
        let entity = self
            .entity(&record.entity)
            .ok_or_else(|| ValidationError::UnknownEntity(record.entity.clone()))?;

        for (name, value) in &record.attributes {
            let attribute =
                entity
                    .attribute(name)
                    .ok_or_else(|| ValidationError::UnknownAttribute {
                        entity: entity.name.clone(),
                        attribute: name.clone(),
                    })?;
            if !attribute.kind.accepts(value) {
                return Err(ValidationError::TypeMismatch {
                    entity: entity.name.clone(),
                    attribute: name.clone(),
                    expected: attribute.kind,
                });
            }
        }

        for attribute in entity.attributes.iter().filter(|item| !item.optional) {
            if record.get(&attribute.name).is_null() {
                return Err(ValidationError::MissingRequired {
                    entity: entity.name.clone(),
                    attribute: attribute.name.clone(),
                });
            }
        }

        Ok(())
    }
}

/// Model definition could not be loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    NotFound(PathBuf),
    Io { path: PathBuf, message: String },
    Malformed(String),
    Invalid(String),
}

impl Display for SchemaError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(path) => write!(f, "model definition not found: {}", path.display()),
            Self::Io { path, message } => {
                write!(f, "failed to read model `{}`: {message}", path.display())
            }
            Self::Malformed(message) => write!(f, "malformed model definition: {message}"),
            Self::Invalid(message) => write!(f, "invalid model definition: {message}"),
        }
    }
}

impl Error for SchemaError {}

/// Record does not conform to the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    UnknownEntity(String),
    UnknownAttribute {
        entity: String,
        attribute: String,
    },
    TypeMismatch {
        entity: String,
        attribute: String,
        expected: AttributeKind,
    },
    MissingRequired {
        entity: String,
        attribute: String,
    },
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownEntity(entity) => write!(f, "unknown entity `{entity}`"),
            Self::UnknownAttribute { entity, attribute } => {
                write!(f, "unknown attribute `{entity}.{attribute}`")
            }
            Self::TypeMismatch {
                entity,
                attribute,
                expected,
            } => write!(f, "attribute `{entity}.{attribute}` expects {expected}"),
            Self::MissingRequired { entity, attribute } => {
                write!(f, "required attribute `{entity}.{attribute}` is missing")
            }
        }
    }
}

impl Error for ValidationError {}
