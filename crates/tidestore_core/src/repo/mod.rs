//! Durable record persistence.
//!
//! # Responsibility
//! - Keep SQLite details behind the reader context's parent boundary.
//! - Apply the attribute transform on the way to and from disk.
//! - Migrate stored records when the model version grows.
//!
//! # Invariants
//! - A batch of changes is applied in one SQLite transaction or not at all.
//! - Ciphertext never leaves this module in decoded form except as plaintext
//!   attribute values of returned records.

pub mod record_repo;
