//! Writer and reader contexts.
//!
//! # Responsibility
//! - Stage typed inserts, updates and deletes as pending changes.
//! - Read through pending changes layered over the parent's view.
//!
//! # Invariants
//! - The writer's parent is the reader; the reader's parent is the repository.
//! - Lock order is writer pending, reader pending, repository; the writer's
//!   pending map is never held while the reader's view is read.

use super::handle::StoreInner;
use super::{ContextRole, StoreError, StoreResult};
use crate::model::change::{merge_change, PendingChange};
use crate::model::record::{compare_records, Persistable, Record, RecordId, SortDescriptor};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub(crate) type PendingMap = BTreeMap<RecordId, PendingChange>;

/// Pending changes of one context.
#[derive(Default)]
pub(crate) struct ContextState {
    pending: Mutex<PendingMap>,
}

impl ContextState {
    pub(crate) fn lock(&self) -> MutexGuard<'_, PendingMap> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn has_changes(&self) -> bool {
        !self.lock().is_empty()
    }

    pub(crate) fn take(&self) -> PendingMap {
        std::mem::take(&mut *self.lock())
    }

    pub(crate) fn discard(&self) -> usize {
        let dropped = self.take();
        dropped.len()
    }

    pub(crate) fn pending_change(&self, id: RecordId) -> Option<PendingChange> {
        self.lock().get(&id).cloned()
    }

    pub(crate) fn stage(&self, change: PendingChange) {
        merge_into(&mut self.lock(), change);
    }
}

/// Collapses `change` into `pending` using the per-id merge rules.
pub(crate) fn merge_into(pending: &mut PendingMap, change: PendingChange) {
    let id = change.id();
    let existing = pending.remove(&id);
    if let Some(merged) = merge_change(existing, change) {
        pending.insert(id, merged);
    }
}

/// Handle to the writer or the reader context of a store.
#[derive(Clone)]
pub struct Context {
    store: Arc<StoreInner>,
    role: ContextRole,
}

impl Context {
    pub(crate) fn new(store: Arc<StoreInner>, role: ContextRole) -> Self {
        Self { store, role }
    }

    pub fn role(&self) -> ContextRole {
        self.role
    }

    pub(crate) fn store(&self) -> &Arc<StoreInner> {
        &self.store
    }

    /// Whether this context has uncommitted changes.
    pub fn has_changes(&self) -> bool {
        self.store.state(self.role).has_changes()
    }

    /// Stages an insert.
    ///
    /// # Errors
    /// - `Validation` when the record does not match the model.
    /// - `Duplicate` when a record with the same id is already visible.
    pub fn insert<T: Persistable>(&self, value: &T) -> StoreResult<()> {
        let record = value.to_record();
        self.store.schema.validate_record(&record)?;
        if self.visible_record(record.id)?.is_some() {
            return Err(StoreError::Duplicate(record.id));
        }
        self.store
            .state(self.role)
            .stage(PendingChange::Insert(record));
        Ok(())
    }

    /// Stages an update of a visible record.
    ///
    /// # Errors
    /// - `Validation` when the record does not match the model.
    /// - `NotFound` when no record of `T` with this id is visible.
    pub fn update<T: Persistable>(&self, value: &T) -> StoreResult<()> {
        let record = value.to_record();
        self.store.schema.validate_record(&record)?;
        match self.visible_record(record.id)? {
            Some(current) if current.is_entity(T::ENTITY) => {
                self.store
                    .state(self.role)
                    .stage(PendingChange::Update(record));
                Ok(())
            }
            _ => Err(StoreError::NotFound(record.id)),
        }
    }

    /// Stages a delete, keeping the last visible snapshot.
    ///
    /// # Errors
    /// - `NotFound` when no record of `T` with this id is visible.
    pub fn delete<T: Persistable>(&self, id: RecordId) -> StoreResult<()> {
        match self.visible_record(id)? {
            Some(snapshot) if snapshot.is_entity(T::ENTITY) => {
                self.store
                    .state(self.role)
                    .stage(PendingChange::Delete(snapshot));
                Ok(())
            }
            _ => Err(StoreError::NotFound(id)),
        }
    }

    pub fn get<T: Persistable>(&self, id: RecordId) -> StoreResult<Option<T>> {
        match self.visible_record(id)? {
            Some(record) if record.is_entity(T::ENTITY) => Ok(Some(T::decode(&record)?)),
            _ => Ok(None),
        }
    }

    /// Returns every visible `T` matching `predicate`, ordered by `sort` then id.
    pub fn fetch<T, P>(&self, predicate: P, sort: &[SortDescriptor]) -> StoreResult<Vec<T>>
    where
        T: Persistable,
        P: Fn(&T) -> bool,
    {
        let mut records = self.visible_records(T::ENTITY)?;
        records.sort_by(|left, right| compare_records(left, right, sort));

        let mut matches = Vec::new();
        for record in &records {
            let value = T::decode(record)?;
            if predicate(&value) {
                matches.push(value);
            }
        }
        Ok(matches)
    }

    pub fn count<T, P>(&self, predicate: P) -> StoreResult<usize>
    where
        T: Persistable,
        P: Fn(&T) -> bool,
    {
        Ok(self.fetch::<T, P>(predicate, &[])?.len())
    }

    pub(crate) fn visible_record(&self, id: RecordId) -> StoreResult<Option<Record>> {
        self.store.visible_record(self.role, id)
    }

    pub(crate) fn visible_records(&self, entity: &str) -> StoreResult<Vec<Record>> {
        self.store.visible_records(self.role, entity)
    }
}

impl StoreInner {
    pub(crate) fn state(&self, role: ContextRole) -> &ContextState {
        match role {
            ContextRole::Writer => &self.writer,
            ContextRole::Reader => &self.reader,
        }
    }

    /// Record as seen by `role`, `None` when absent or deleted.
    ///
    /// The reader's pending map stays locked while the repository is read, so
    /// a concurrent reader commit is observed either fully or not at all.
    pub(crate) fn visible_record(
        &self,
        role: ContextRole,
        id: RecordId,
    ) -> StoreResult<Option<Record>> {
        match role {
            ContextRole::Writer => match self.writer.pending_change(id) {
                Some(change) => Ok(change.visible().cloned()),
                None => self.visible_record(ContextRole::Reader, id),
            },
            ContextRole::Reader => {
                let pending = self.reader.lock();
                if let Some(change) = pending.get(&id) {
                    return Ok(change.visible().cloned());
                }
                Ok(self.repo().load_record(id)?)
            }
        }
    }

    pub(crate) fn visible_records(
        &self,
        role: ContextRole,
        entity: &str,
    ) -> StoreResult<Vec<Record>> {
        let view = match role {
            ContextRole::Writer => {
                let base = self.visible_records(ContextRole::Reader, entity)?;
                overlay(base, &self.writer.lock(), entity)
            }
            ContextRole::Reader => {
                let pending = self.reader.lock();
                let base = self.repo().load_records(entity)?;
                overlay(base, &pending, entity)
            }
        };
        Ok(view)
    }
}

fn overlay(base: Vec<Record>, pending: &PendingMap, entity: &str) -> Vec<Record> {
    let mut view: BTreeMap<RecordId, Record> =
        base.into_iter().map(|record| (record.id, record)).collect();
    for change in pending.values() {
        if !change.record().is_entity(entity) {
            continue;
        }
        match change {
            PendingChange::Insert(record) | PendingChange::Update(record) => {
                view.insert(record.id, record.clone());
            }
            PendingChange::Delete(record) => {
                view.remove(&record.id);
            }
        }
    }
    view.into_values().collect()
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").field("role", &self.role).finish()
    }
}
