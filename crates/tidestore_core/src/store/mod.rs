//! Store handle, contexts and the cascading save pipeline.
//!
//! # Responsibility
//! - Own the durable record repository and the writer/reader context pair.
//! - Route callers to the context bound to their execution context.
//! - Commit writer changes into the reader, then reader changes to disk.
//!
//! # Invariants
//! - Writer changes become durable only after the reader commits.
//! - Reader commits run on the foreground thread only.
//! - Save completion callbacks run on the foreground thread only.
//!
//! # See also
//! - `crate::watch` for the single-entity change feed built on notifications.

mod context;
mod executor;
mod handle;
mod notify;
mod save;

pub use context::Context;
pub use handle::StoreHandle;
pub use notify::{ChangeNotification, Subscription};

use crate::crypto::CryptoError;
use crate::db::DbError;
use crate::model::record::{RecordError, RecordId};
use crate::model::schema::ValidationError;
use crate::repo::record_repo::RepoError;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome reported to save completion callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SaveStatus {
    Saved,
    RolledBack,
    NoChanges,
}

impl SaveStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Saved => "saved",
            Self::RolledBack => "rolled_back",
            Self::NoChanges => "no_changes",
        }
    }
}

/// Where the mutation step of a save runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveMode {
    /// On the background worker; the call returns immediately.
    Background,
    /// On the calling thread; the call returns once the pipeline finished.
    Blocking,
}

/// Logical role of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextRole {
    /// Background-bound, parent is the reader.
    Writer,
    /// Foreground-bound, parent is the durable store.
    Reader,
}

impl ContextRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Writer => "writer",
            Self::Reader => "reader",
        }
    }
}

/// Execution context a caller runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionContext {
    Foreground,
    Background,
}

#[derive(Debug)]
pub enum StoreError {
    ModelNotFound(PathBuf),
    ModelCreation(String),
    StorePathNotFound(PathBuf),
    KeyUnavailable(CryptoError),
    UnsupportedModelVersion { stored: u32, supported: u32 },
    Worker(std::io::Error),
    Db(DbError),
    Repo(RepoError),
    Validation(ValidationError),
    Record(RecordError),
    NotFound(RecordId),
    Duplicate(RecordId),
    AmbiguousMatch { entity: &'static str, count: usize },
    WrongExecutionContext(&'static str),
}

impl StoreError {
    /// Errors raised while opening a store; callers should not proceed.
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            Self::ModelNotFound(_)
                | Self::ModelCreation(_)
                | Self::StorePathNotFound(_)
                | Self::KeyUnavailable(_)
                | Self::UnsupportedModelVersion { .. }
        )
    }

    /// Stable code used in log events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ModelNotFound(_) => "model_not_found",
            Self::ModelCreation(_) => "model_creation_failed",
            Self::StorePathNotFound(_) => "store_path_not_found",
            Self::KeyUnavailable(_) => "key_unavailable",
            Self::UnsupportedModelVersion { .. } => "unsupported_model_version",
            Self::Worker(_) => "worker_spawn_failed",
            Self::Db(_) => "db_error",
            Self::Repo(_) => "repo_error",
            Self::Validation(_) => "validation_failed",
            Self::Record(_) => "record_decode_failed",
            Self::NotFound(_) => "not_found",
            Self::Duplicate(_) => "duplicate",
            Self::AmbiguousMatch { .. } => "ambiguous_match",
            Self::WrongExecutionContext(_) => "wrong_execution_context",
        }
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ModelNotFound(path) => write!(f, "model not found: {}", path.display()),
            Self::ModelCreation(message) => write!(f, "model could not be created: {message}"),
            Self::StorePathNotFound(path) => {
                write!(f, "store directory not found: {}", path.display())
            }
            Self::KeyUnavailable(err) => write!(f, "attribute key unavailable: {err}"),
            Self::UnsupportedModelVersion { stored, supported } => write!(
                f,
                "store model version {stored} is newer than supported {supported}"
            ),
            Self::Worker(err) => write!(f, "failed to start background worker: {err}"),
            Self::Db(err) => write!(f, "{err}"),
            Self::Repo(err) => write!(f, "{err}"),
            Self::Validation(err) => write!(f, "{err}"),
            Self::Record(err) => write!(f, "{err}"),
            Self::NotFound(id) => write!(f, "record not found: {id}"),
            Self::Duplicate(id) => write!(f, "record already exists: {id}"),
            Self::AmbiguousMatch { entity, count } => write!(
                f,
                "predicate matched {count} `{entity}` records, expected at most one"
            ),
            Self::WrongExecutionContext(operation) => {
                write!(f, "`{operation}` must run on the foreground thread")
            }
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::KeyUnavailable(err) => Some(err),
            Self::Worker(err) => Some(err),
            Self::Db(err) => Some(err),
            Self::Repo(err) => Some(err),
            Self::Validation(err) => Some(err),
            Self::Record(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for StoreError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<RepoError> for StoreError {
    fn from(value: RepoError) -> Self {
        match value {
            RepoError::NotFound(id) => Self::NotFound(id),
            RepoError::Duplicate(id) => Self::Duplicate(id),
            RepoError::UnsupportedModelVersion { stored, supported } => {
                Self::UnsupportedModelVersion { stored, supported }
            }
            RepoError::ModelMismatch { .. } => Self::ModelCreation(value.to_string()),
            RepoError::Db(err) => Self::Db(err),
            other => Self::Repo(other),
        }
    }
}

impl From<ValidationError> for StoreError {
    fn from(value: ValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<RecordError> for StoreError {
    fn from(value: RecordError) -> Self {
        Self::Record(value)
    }
}
