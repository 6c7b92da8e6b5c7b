//! Record model shared by contexts, persistence and watchers.
//!
//! # Responsibility
//! - Define the untyped `Record` shape every context stores.
//! - Define the `Persistable` capability typed entities implement.
//! - Describe and validate the model schema a store is opened with.
//!
//! # Invariants
//! - Every record is identified by a stable `RecordId` that is never reused.
//! - A record belongs to exactly one entity declared by the schema.

pub mod change;
pub mod record;
pub mod schema;
