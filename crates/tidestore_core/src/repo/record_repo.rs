//! SQLite record repository.
//!
//! # Responsibility
//! - Load records by id or entity from the `records` table.
//! - Persist a reader context's pending changes atomically.
//! - Run the lightweight model migration on open.
//!
//! # Invariants
//! - `store_metadata` holds the model name and version the file was last
//!   written with; a newer stored version is never downgraded.
//! - Encrypted attributes are stored as `{"cipher": "<base64>"}`; a failed
//!   seal stores `Null` and a failed open reads back `Null`.

use crate::crypto::AttributeTransform;
use crate::db::DbError;
use crate::model::change::PendingChange;
use crate::model::record::{AttributeValue, Record, RecordId};
use crate::model::schema::{AttributeKind, ModelSchema};
use log::{info, warn};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use uuid::Uuid;

const RECORD_SELECT_SQL: &str = "SELECT uuid, entity, attributes FROM records";
const META_MODEL_NAME: &str = "model_name";
const META_MODEL_VERSION: &str = "model_version";

pub type RepoResult<T> = Result<T, RepoError>;

#[derive(Debug)]
pub enum RepoError {
    Db(DbError),
    NotFound(RecordId),
    Duplicate(RecordId),
    InvalidData(String),
    ModelMismatch { stored: String, expected: String },
    UnsupportedModelVersion { stored: u32, supported: u32 },
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::NotFound(id) => write!(f, "record not found: {id}"),
            Self::Duplicate(id) => write!(f, "record already exists: {id}"),
            Self::InvalidData(message) => write!(f, "invalid persisted record data: {message}"),
            Self::ModelMismatch { stored, expected } => write!(
                f,
                "store was created for model `{stored}`, not `{expected}`"
            ),
            Self::UnsupportedModelVersion { stored, supported } => write!(
                f,
                "store model version {stored} is newer than supported {supported}"
            ),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// On-disk form of one attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum StoredValue {
    Plain(AttributeValue),
    Cipher(String),
}

type StoredAttributes = BTreeMap<String, StoredValue>;

/// SQLite-backed record store owned by one `StoreHandle`.
pub struct SqliteRecordRepository {
    conn: Connection,
    schema: Arc<ModelSchema>,
    transform: Arc<AttributeTransform>,
}

impl SqliteRecordRepository {
    /// Wraps a bootstrapped connection and migrates stored records to `schema`.
    ///
    /// # Errors
    /// - `ModelMismatch` when the file belongs to another model.
    /// - `UnsupportedModelVersion` when the file was written by a newer model.
    pub fn open(
        conn: Connection,
        schema: Arc<ModelSchema>,
        transform: Arc<AttributeTransform>,
    ) -> RepoResult<Self> {
        let mut repo = Self {
            conn,
            schema,
            transform,
        };
        repo.migrate_model()?;
        Ok(repo)
    }

    pub fn load_record(&self, id: RecordId) -> RepoResult<Option<Record>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{RECORD_SELECT_SQL} WHERE uuid = ?1;"))?;
        let mut rows = stmt.query([id.to_string()])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(self.parse_record_row(row)?));
        }
        Ok(None)
    }

    /// Loads every record of `entity`, ordered by id.
    pub fn load_records(&self, entity: &str) -> RepoResult<Vec<Record>> {
        let mut stmt = self.conn.prepare(&format!(
            "{RECORD_SELECT_SQL} WHERE entity = ?1 ORDER BY uuid ASC;"
        ))?;
        let mut rows = stmt.query([entity])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(self.parse_record_row(row)?);
        }
        Ok(records)
    }

    /// Writes all `changes` in one transaction.
    ///
    /// Nothing is written when any statement fails.
    pub fn apply_changes(&mut self, changes: &BTreeMap<RecordId, PendingChange>) -> RepoResult<()> {
        let mut sealed = Vec::with_capacity(changes.len());
        for change in changes.values() {
            let attributes = match change {
                PendingChange::Delete(_) => None,
                PendingChange::Insert(record) | PendingChange::Update(record) => {
                    Some(self.seal_attributes(record)?)
                }
            };
            sealed.push((change, attributes));
        }

        let tx = self.conn.transaction()?;
        for (change, attributes) in &sealed {
            let record = change.record();
            match change {
                PendingChange::Insert(_) => {
                    let result = tx.execute(
                        "INSERT INTO records (uuid, entity, attributes) VALUES (?1, ?2, ?3);",
                        params![record.id.to_string(), record.entity, attributes],
                    );
                    if let Err(err) = result {
                        return Err(map_insert_error(err, record.id));
                    }
                }
                PendingChange::Update(_) => {
                    let changed = tx.execute(
                        "UPDATE records
                         SET
                            entity = ?3,
                            attributes = ?1,
                            updated_at = (strftime('%s', 'now') * 1000)
                         WHERE uuid = ?2;",
                        params![attributes, record.id.to_string(), record.entity],
                    )?;
                    if changed == 0 {
                        return Err(RepoError::NotFound(record.id));
                    }
                }
                PendingChange::Delete(_) => {
                    let changed = tx.execute(
                        "DELETE FROM records WHERE uuid = ?1;",
                        [record.id.to_string()],
                    )?;
                    if changed == 0 {
                        return Err(RepoError::NotFound(record.id));
                    }
                }
            }
        }
        tx.commit()?;

        Ok(())
    }

    fn seal_attributes(&self, record: &Record) -> RepoResult<String> {
        let entity = self.schema.entity(&record.entity);
        let mut stored = StoredAttributes::new();

        for (name, value) in &record.attributes {
            let encrypted = entity
                .and_then(|entity| entity.attribute(name))
                .is_some_and(|attribute| attribute.encrypted);
            let stored_value = if encrypted {
                self.seal_value(value)
            } else {
                StoredValue::Plain(value.clone())
            };
            stored.insert(name.clone(), stored_value);
        }

        serde_json::to_string(&stored).map_err(|err| {
            RepoError::InvalidData(format!("failed to encode record {}: {err}", record.id))
        })
    }

    fn seal_value(&self, value: &AttributeValue) -> StoredValue {
        if value.is_null() {
            return StoredValue::Plain(AttributeValue::Null);
        }
        self.transform
            .seal_value(value)
            .map_or(StoredValue::Plain(AttributeValue::Null), StoredValue::Cipher)
    }

    fn parse_record_row(&self, row: &Row<'_>) -> RepoResult<Record> {
        let uuid_text: String = row.get("uuid")?;
        let id = Uuid::parse_str(&uuid_text).map_err(|_| {
            RepoError::InvalidData(format!("invalid uuid value `{uuid_text}` in records.uuid"))
        })?;
        let entity: String = row.get("entity")?;
        let json: String = row.get("attributes")?;
        let stored: StoredAttributes = serde_json::from_str(&json).map_err(|err| {
            RepoError::InvalidData(format!("invalid attributes for record {id}: {err}"))
        })?;

        let entity_schema = self.schema.entity(&entity);
        let mut record = Record::with_id(id, entity);
        for (name, value) in stored {
            let kind = entity_schema
                .and_then(|schema| schema.attribute(&name))
                .map(|attribute| attribute.kind);
            let value = match value {
                StoredValue::Plain(value) => value,
                StoredValue::Cipher(sealed) => self.open_value(kind, &sealed),
            };
            record.attributes.insert(name, value);
        }
        Ok(record)
    }

    fn open_value(&self, kind: Option<AttributeKind>, sealed: &str) -> AttributeValue {
        let kind = kind.unwrap_or(AttributeKind::Text);
        self.transform
            .open_value(sealed, kind)
            .unwrap_or(AttributeValue::Null)
    }

    fn migrate_model(&mut self) -> RepoResult<()> {
        let stored_name = self.read_metadata(META_MODEL_NAME)?;
        let stored_version = self
            .read_metadata(META_MODEL_VERSION)?
            .map(|value| {
                value.parse::<u32>().map_err(|_| {
                    RepoError::InvalidData(format!("invalid stored model version `{value}`"))
                })
            })
            .transpose()?;
        let expected_name = self.schema.name.clone();
        let target_version = self.schema.version;

        let (Some(stored_name), Some(stored_version)) = (stored_name, stored_version) else {
            self.write_model_metadata()?;
            info!(
                "event=model_init module=repo status=ok model={} version={}",
                expected_name, target_version
            );
            return Ok(());
        };

        if stored_name != expected_name {
            return Err(RepoError::ModelMismatch {
                stored: stored_name,
                expected: expected_name,
            });
        }
        if stored_version > target_version {
            return Err(RepoError::UnsupportedModelVersion {
                stored: stored_version,
                supported: target_version,
            });
        }
        if stored_version == target_version {
            return Ok(());
        }

        let (rewritten, removed) = self.rewrite_for_model()?;
        info!(
            "event=model_migrate module=repo status=ok model={} from_version={} to_version={} rewritten_records={} removed_records={}",
            expected_name, stored_version, target_version, rewritten, removed
        );
        Ok(())
    }

    /// Drops undeclared attributes and records of removed entities, then
    /// stamps the new model version. Ciphertext is carried over unopened.
    fn rewrite_for_model(&mut self) -> RepoResult<(usize, usize)> {
        let rows = {
            let mut stmt = self.conn.prepare(RECORD_SELECT_SQL)?;
            let mapped = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>("uuid")?,
                    row.get::<_, String>("entity")?,
                    row.get::<_, String>("attributes")?,
                ))
            })?;
            let rows = mapped.collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let schema = Arc::clone(&self.schema);
        let tx = self.conn.transaction()?;
        let mut rewritten = 0;
        let mut removed = 0;

        for (uuid, entity, json) in rows {
            let Some(entity_schema) = schema.entity(&entity) else {
                tx.execute("DELETE FROM records WHERE uuid = ?1;", [&uuid])?;
                removed += 1;
                continue;
            };

            let mut stored: StoredAttributes = serde_json::from_str(&json).map_err(|err| {
                RepoError::InvalidData(format!("invalid attributes for record {uuid}: {err}"))
            })?;
            let before = stored.len();
            stored.retain(|name, _| entity_schema.attribute(name).is_some());
            if stored.len() == before {
                continue;
            }

            let json = serde_json::to_string(&stored).map_err(|err| {
                RepoError::InvalidData(format!("failed to encode record {uuid}: {err}"))
            })?;
            tx.execute(
                "UPDATE records SET attributes = ?1 WHERE uuid = ?2;",
                params![json, uuid],
            )?;
            rewritten += 1;
        }

        tx.execute(
            "INSERT INTO store_metadata (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
            params![META_MODEL_VERSION, schema.version.to_string()],
        )?;
        tx.commit()?;

        if removed > 0 {
            warn!(
                "event=model_migrate module=repo status=ok removed_records={} reason=entity_not_in_model",
                removed
            );
        }
        Ok((rewritten, removed))
    }

    fn read_metadata(&self, key: &str) -> RepoResult<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM store_metadata WHERE key = ?1;",
                [key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn write_model_metadata(&self) -> RepoResult<()> {
        self.conn.execute(
            "INSERT INTO store_metadata (key, value) VALUES (?1, ?2), (?3, ?4)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
            params![
                META_MODEL_NAME,
                self.schema.name,
                META_MODEL_VERSION,
                self.schema.version.to_string()
            ],
        )?;
        Ok(())
    }
}

fn map_insert_error(err: rusqlite::Error, id: RecordId) -> RepoError {
    if let rusqlite::Error::SqliteFailure(failure, _) = &err {
        if failure.code == ErrorCode::ConstraintViolation
            && failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        {
            return RepoError::Duplicate(id);
        }
    }
    err.into()
}
