//! Store handle bootstrap and context routing.
//!
//! # Responsibility
//! - Validate configuration, load the model and resolve key material.
//! - Open the SQLite file and wire the context pair to it.
//! - Expose save, routing, subscription and foreground draining entry points.
//!
//! # Invariants
//! - The thread that opens a handle is its foreground thread.
//! - One handle (and its clones) owns the connection to one store file.

use super::context::{Context, ContextState};
use super::executor::{BackgroundWorker, ForegroundQueue};
use super::notify::{ChangeNotification, NotificationCenter, Subscription};
use super::save::{self, Completion, Mutation};
use super::{ContextRole, ExecutionContext, SaveMode, SaveStatus, StoreError, StoreResult};
use crate::config::StoreConfig;
use crate::crypto::{AttributeTransform, SecretProvider};
use crate::db::{open_db, open_db_in_memory, OpenOptions};
use crate::model::record::Persistable;
use crate::model::schema::{ModelSchema, SchemaError};
use crate::repo::record_repo::SqliteRecordRepository;
use crate::watch::{ChangeType, SingleEntityWatcher};
use log::{error, info};
use rusqlite::Connection;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

const IN_MEMORY_LABEL: &str = ":memory:";

pub(crate) struct StoreInner {
    label: String,
    pub(crate) schema: Arc<ModelSchema>,
    transform: Arc<AttributeTransform>,
    repo: Mutex<SqliteRecordRepository>,
    pub(crate) writer: ContextState,
    pub(crate) reader: ContextState,
    pub(crate) write_lock: Mutex<()>,
    pub(crate) notifications: Arc<NotificationCenter>,
    pub(crate) foreground: ForegroundQueue,
    pub(crate) worker: BackgroundWorker,
}

impl StoreInner {
    pub(crate) fn repo(&self) -> MutexGuard<'_, SqliteRecordRepository> {
        self.repo.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }
}

/// Cloneable handle to one persistent store.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<StoreInner>,
}

impl StoreHandle {
    /// Opens (or creates) the store described by `config`.
    ///
    /// The calling thread becomes the store's foreground thread.
    ///
    /// # Errors
    /// - `StorePathNotFound` when `config.data_dir` is not a directory.
    /// - `ModelNotFound` when the model file is missing.
    /// - `ModelCreation` when the model file is invalid or belongs to another
    ///   store.
    /// - `KeyUnavailable` when `secrets` cannot provide key material.
    /// - `UnsupportedModelVersion` when the file was written by a newer model.
    pub fn open(config: &StoreConfig, secrets: &dyn SecretProvider) -> StoreResult<Self> {
        let started_at = Instant::now();
        info!(
            "event=store_open module=store status=start mode=file model={}",
            config.model_name
        );

        let result = Self::open_file(config, secrets);
        log_open_result(&result, "file", started_at);
        result
    }

    /// Opens a store on an in-memory database.
    pub fn open_in_memory(schema: ModelSchema, secrets: &dyn SecretProvider) -> StoreResult<Self> {
        let started_at = Instant::now();
        info!(
            "event=store_open module=store status=start mode=memory model={}",
            schema.name
        );

        let result = Self::open_memory(schema, secrets);
        log_open_result(&result, "memory", started_at);
        result
    }

    fn open_memory(schema: ModelSchema, secrets: &dyn SecretProvider) -> StoreResult<Self> {
        schema
            .validate()
            .map_err(|err| StoreError::ModelCreation(err.to_string()))?;
        let transform = resolve_transform(secrets)?;
        let conn = open_db_in_memory(&OpenOptions::default())?;
        Self::assemble(IN_MEMORY_LABEL.to_string(), schema, transform, conn)
    }

    fn open_file(config: &StoreConfig, secrets: &dyn SecretProvider) -> StoreResult<Self> {
        config
            .validate()
            .map_err(|err| StoreError::ModelCreation(err.to_string()))?;
        if !config.data_dir.is_dir() {
            return Err(StoreError::StorePathNotFound(config.data_dir.clone()));
        }

        let schema = ModelSchema::load(config.model_path()).map_err(|err| match err {
            SchemaError::NotFound(path) => StoreError::ModelNotFound(path),
            other => StoreError::ModelCreation(other.to_string()),
        })?;
        if schema.name != config.model_name {
            return Err(StoreError::ModelCreation(format!(
                "model file declares `{}`, expected `{}`",
                schema.name, config.model_name
            )));
        }

        let transform = resolve_transform(secrets)?;
        let options = OpenOptions {
            busy_timeout: config.busy_timeout,
            file_protection: config.file_protection,
        };
        let conn = open_db(config.store_path(), &options)?;
        Self::assemble(config.model_name.clone(), schema, transform, conn)
    }

    fn assemble(
        label: String,
        schema: ModelSchema,
        transform: AttributeTransform,
        conn: Connection,
    ) -> StoreResult<Self> {
        let schema = Arc::new(schema);
        let transform = Arc::new(transform);
        let repo =
            SqliteRecordRepository::open(conn, Arc::clone(&schema), Arc::clone(&transform))?;
        let worker = BackgroundWorker::spawn()?;

        Ok(Self {
            inner: Arc::new(StoreInner {
                label,
                schema,
                transform,
                repo: Mutex::new(repo),
                writer: ContextState::default(),
                reader: ContextState::default(),
                write_lock: Mutex::new(()),
                notifications: Arc::new(NotificationCenter::default()),
                foreground: ForegroundQueue::bind_current(),
                worker,
            }),
        })
    }

    pub fn model(&self) -> &ModelSchema {
        &self.inner.schema
    }

    /// Background context; its parent is the reader.
    ///
    /// Stage writer changes only inside a `save` mutation. Changes staged
    /// elsewhere are not covered by the write lock and are committed by
    /// whichever save runs next.
    pub fn writer_context(&self) -> Context {
        Context::new(Arc::clone(&self.inner), ContextRole::Writer)
    }

    /// Foreground context; its parent is the durable store.
    pub fn reader_context(&self) -> Context {
        Context::new(Arc::clone(&self.inner), ContextRole::Reader)
    }

    /// Reader on the foreground thread, writer anywhere else.
    pub fn current_context(&self) -> Context {
        if self.is_foreground() {
            self.reader_context()
        } else {
            self.writer_context()
        }
    }

    pub fn context_for(&self, execution: ExecutionContext) -> Context {
        match execution {
            ExecutionContext::Foreground => self.reader_context(),
            ExecutionContext::Background => self.writer_context(),
        }
    }

    pub fn is_foreground(&self) -> bool {
        self.inner.foreground.is_current()
    }

    /// Number of attribute transforms that failed and were read or written
    /// as `Null`.
    pub fn crypto_failure_count(&self) -> u64 {
        self.inner.transform.failure_count()
    }

    /// Runs `mutate` against the writer and cascades the result to disk.
    ///
    /// `on_complete` always runs on the foreground thread, from
    /// [`Self::process_foreground`] unless the save was issued there in
    /// `Blocking` mode. A `Blocking` save from another thread waits until the
    /// foreground has run the reader commit.
    pub fn save<M, C>(&self, mode: SaveMode, mutate: M, on_complete: C)
    where
        M: FnOnce(&Context) -> StoreResult<()> + Send + 'static,
        C: FnOnce(SaveStatus) + Send + 'static,
    {
        let mutate: Mutation = Box::new(mutate);
        let on_complete: Completion = Box::new(on_complete);
        save::run(&self.inner, mode, mutate, on_complete);
    }

    /// Runs queued foreground jobs without waiting.
    ///
    /// # Errors
    /// - `WrongExecutionContext` when called off the foreground thread.
    pub fn process_foreground(&self) -> StoreResult<usize> {
        self.inner.foreground.drain(&self.inner)
    }

    /// Waits up to `timeout` for a foreground job, then runs all queued jobs.
    pub fn process_foreground_timeout(&self, timeout: Duration) -> StoreResult<usize> {
        self.inner.foreground.drain_timeout(&self.inner, timeout)
    }

    /// Registers `listener` for every commit of either context.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ChangeNotification) + Send + Sync + 'static,
    {
        self.inner.notifications.subscribe(Arc::new(listener))
    }

    /// Creates a subscribed single-entity watcher on `context`.
    pub fn watch<T, P, C>(&self, predicate: P, context: Context, on_change: C) -> SingleEntityWatcher<T>
    where
        T: Persistable + Clone + Send + Sync + 'static,
        P: Fn(&T) -> bool + Send + Sync + 'static,
        C: Fn(&T, ChangeType) + Send + Sync + 'static,
    {
        SingleEntityWatcher::new(predicate, context, on_change)
    }
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle")
            .field("store", &self.inner.label())
            .field("model_version", &self.inner.schema.version)
            .finish()
    }
}

fn resolve_transform(secrets: &dyn SecretProvider) -> StoreResult<AttributeTransform> {
    let material = secrets
        .key_material()
        .map_err(StoreError::KeyUnavailable)?;
    Ok(AttributeTransform::new(material))
}

fn log_open_result(result: &StoreResult<StoreHandle>, mode: &str, started_at: Instant) {
    match result {
        Ok(handle) => info!(
            "event=store_open module=store status=ok mode={} store={} duration_ms={}",
            mode,
            handle.inner.label(),
            started_at.elapsed().as_millis()
        ),
        Err(err) => error!(
            "event=store_open module=store status=error mode={} duration_ms={} error_code={} error={}",
            mode,
            started_at.elapsed().as_millis(),
            err.code(),
            err
        ),
    }
}
