//! Persistence write-coordination core.
//!
//! A two-tier writer/reader context pair cascades background mutations to a
//! SQLite store, selected attributes are encrypted at rest, and a
//! single-entity watcher turns commit notifications into a classified feed.

pub mod config;
pub mod crypto;
pub mod db;
pub mod logging;
pub mod model;
pub mod repo;
pub mod store;
pub mod watch;

pub use config::{ConfigError, FileProtection, StoreConfig};
pub use crypto::{
    decrypt, encrypt, AttributeTransform, CryptoError, EnvSecretProvider, KeyMaterial,
    SecretProvider, StaticSecretProvider,
};
pub use logging::{init_logging, init_logging_from_env, LogLevel, LoggingError};
pub use model::change::{ChangeKind, ChangeSet};
pub use model::record::{
    AttributeValue, Persistable, Record, RecordError, RecordId, SortDescriptor,
};
pub use model::schema::{
    AttributeKind, AttributeSchema, EntitySchema, ModelSchema, SchemaError, ValidationError,
};
pub use store::{
    ChangeNotification, Context, ContextRole, ExecutionContext, SaveMode, SaveStatus,
    StoreError, StoreHandle, StoreResult, Subscription,
};
pub use watch::{ChangeType, SingleEntityWatcher, WatchState};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::core_version;

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
