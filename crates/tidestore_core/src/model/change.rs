//! Pending changes and their collapse rules.
//!
//! # Invariants
//! - A context holds at most one pending change per record id.
//! - `Delete` carries the last visible snapshot of the record, so observers
//!   can still evaluate predicates against deleted records.

use crate::model::record::{Record, RecordId};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Uncommitted change staged in a context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingChange {
    Insert(Record),
    Update(Record),
    Delete(Record),
}

impl PendingChange {
    pub fn record(&self) -> &Record {
        match self {
            Self::Insert(record) | Self::Update(record) | Self::Delete(record) => record,
        }
    }

    pub fn id(&self) -> RecordId {
        self.record().id
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            Self::Insert(_) => ChangeKind::Insert,
            Self::Update(_) => ChangeKind::Update,
            Self::Delete(_) => ChangeKind::Delete,
        }
    }

    /// Record as visible after this change, `None` for deletions.
    pub fn visible(&self) -> Option<&Record> {
        match self {
            Self::Insert(record) | Self::Update(record) => Some(record),
            Self::Delete(_) => None,
        }
    }
}

/// Collapses a newer change onto an already staged one for the same id.
///
/// Returns `None` when the two cancel out (insert followed by delete).
pub fn merge_change(
    existing: Option<PendingChange>,
    incoming: PendingChange,
) -> Option<PendingChange> {
    use PendingChange::{Delete, Insert, Update};

    match (existing, incoming) {
        (None, change) => Some(change),
        (Some(Insert(_)), Insert(record) | Update(record)) => Some(Insert(record)),
        (Some(Insert(_)), Delete(_)) => None,
        (Some(Update(_)), Insert(record) | Update(record)) => Some(Update(record)),
        (Some(Update(_)), Delete(snapshot)) => Some(Delete(snapshot)),
        // Replaces the stored row, entity included.
        (Some(Delete(_)), Insert(record) | Update(record)) => Some(Update(record)),
        (Some(Delete(snapshot)), Delete(_)) => Some(Delete(snapshot)),
    }
}

/// Commit payload grouped by classification, ordered by id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub inserted: BTreeMap<RecordId, Record>,
    pub updated: BTreeMap<RecordId, Record>,
    pub deleted: BTreeMap<RecordId, Record>,
}

impl ChangeSet {
    pub fn from_pending<'a>(changes: impl IntoIterator<Item = &'a PendingChange>) -> Self {
        let mut set = Self::default();
        for change in changes {
            let record = change.record().clone();
            let target = match change.kind() {
                ChangeKind::Insert => &mut set.inserted,
                ChangeKind::Update => &mut set.updated,
                ChangeKind::Delete => &mut set.deleted,
            };
            target.insert(record.id, record);
        }
        set
    }

    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inserted.len() + self.updated.len() + self.deleted.len()
    }
}
