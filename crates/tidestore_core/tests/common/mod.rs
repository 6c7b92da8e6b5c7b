#![allow(dead_code)]

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tidestore_core::{
    FileProtection, Persistable, Record, RecordError, RecordId, SaveStatus, StaticSecretProvider,
    StoreConfig, StoreHandle,
};
use uuid::Uuid;

pub const MODEL_NAME: &str = "Accounts";

pub const ACCOUNTS_V1: &str = r#"{
    "name": "Accounts",
    "version": 1,
    "entities": [
        {
            "name": "User",
            "attributes": [
                { "name": "name", "kind": "text", "optional": false },
                { "name": "secret", "kind": "text", "encrypted": true },
                { "name": "birth_date", "kind": "timestamp", "encrypted": true },
                { "name": "age", "kind": "integer" }
            ]
        }
    ]
}"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: RecordId,
    pub name: String,
    pub secret: Option<String>,
    pub birth_date: Option<DateTime<Utc>>,
    pub age: Option<i64>,
}

impl User {
    pub fn new(name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            secret: None,
            birth_date: None,
            age: None,
        }
    }

    pub fn with_secret(mut self, secret: &str) -> Self {
        self.secret = Some(secret.to_string());
        self
    }
}

impl Persistable for User {
    const ENTITY: &'static str = "User";

    fn id(&self) -> RecordId {
        self.id
    }

    fn to_record(&self) -> Record {
        Record::with_id(self.id, Self::ENTITY)
            .with("name", self.name.as_str())
            .with("secret", self.secret.clone())
            .with("birth_date", self.birth_date)
            .with("age", self.age)
    }

    fn from_record(record: &Record) -> Result<Self, RecordError> {
        Ok(Self {
            id: record.id,
            name: record.require_text("name")?,
            secret: record.text("secret").map(str::to_string),
            birth_date: record.timestamp("birth_date"),
            age: record.integer("age"),
        })
    }
}

pub fn secrets() -> StaticSecretProvider {
    StaticSecretProvider::new(&[0x5a; 32], &[0x0f; 16]).unwrap()
}

/// Model and data directories for one on-disk store.
pub struct StoreDirs {
    pub model_dir: TempDir,
    pub data_dir: TempDir,
}

impl StoreDirs {
    pub fn new(model_json: &str) -> Self {
        let dirs = Self {
            model_dir: tempfile::tempdir().unwrap(),
            data_dir: tempfile::tempdir().unwrap(),
        };
        dirs.write_model(model_json);
        dirs
    }

    pub fn write_model(&self, model_json: &str) {
        std::fs::write(
            self.model_dir
                .path()
                .join(format!("{MODEL_NAME}.model.json")),
            model_json,
        )
        .unwrap();
    }

    pub fn config(&self) -> StoreConfig {
        StoreConfig::new(MODEL_NAME, self.model_dir.path(), self.data_dir.path())
            .with_file_protection(FileProtection::Complete)
    }

    pub fn store_path(&self) -> PathBuf {
        self.config().store_path()
    }

    pub fn open(&self) -> StoreHandle {
        StoreHandle::open(&self.config(), &secrets()).unwrap()
    }
}

/// Collects save statuses delivered on the foreground.
#[derive(Clone, Default)]
pub struct StatusRecorder {
    statuses: Arc<Mutex<Vec<SaveStatus>>>,
}

impl StatusRecorder {
    pub fn callback(&self) -> impl FnOnce(SaveStatus) + Send + 'static {
        let statuses = Arc::clone(&self.statuses);
        move |status| statuses.lock().unwrap().push(status)
    }

    pub fn statuses(&self) -> Vec<SaveStatus> {
        self.statuses.lock().unwrap().clone()
    }

    /// Drains the foreground until `count` statuses arrived.
    pub fn wait_for(&self, store: &StoreHandle, count: usize) -> Vec<SaveStatus> {
        let deadline = Instant::now() + Duration::from_secs(10);
        while self.statuses.lock().unwrap().len() < count {
            assert!(Instant::now() < deadline, "timed out waiting for save status");
            store
                .process_foreground_timeout(Duration::from_millis(50))
                .unwrap();
        }
        self.statuses()
    }
}

pub fn raw_attributes(path: &Path) -> Vec<String> {
    let conn = rusqlite::Connection::open(path).unwrap();
    let mut stmt = conn.prepare("SELECT attributes FROM records;").unwrap();
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    rows
}
