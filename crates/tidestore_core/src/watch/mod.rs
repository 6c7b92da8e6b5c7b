//! Reactive single-entity watcher.
//!
//! # Responsibility
//! - Track the one entity of type `T` selected by a predicate in a context.
//! - Reduce commit notifications into one classified callback per entity.
//!
//! # Invariants
//! - Only commits of the watched context's role are processed.
//! - Notification sets are processed in the order inserted, updated, deleted;
//!   the last classification per entity wins.
//! - After `dispose` (or drop) no callback fires.

use crate::model::change::ChangeSet;
use crate::model::record::{Persistable, Record, RecordId};
use crate::store::{ChangeNotification, Context, StoreError, StoreResult, Subscription};
use log::{debug, error, warn};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Classification delivered to watcher callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeType {
    FirstFetch,
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// `perform_fetch` has not run and nothing was observed yet.
    Uninitialized,
    /// An entity is tracked.
    Fetched,
    /// The predicate matched nothing, or the tracked entity was deleted.
    Empty,
}

type Predicate<T> = Box<dyn Fn(&T) -> bool + Send + Sync + 'static>;
type ChangeCallback<T> = Box<dyn Fn(&T, ChangeType) + Send + Sync + 'static>;

struct Tracked<T> {
    state: WatchState,
    entity: Option<T>,
}

struct WatchShared<T> {
    predicate: Predicate<T>,
    on_change: ChangeCallback<T>,
    context: Context,
    tracked: Mutex<Tracked<T>>,
    disposed: AtomicBool,
}

/// Live view of at most one entity of type `T`.
pub struct SingleEntityWatcher<T> {
    shared: Arc<WatchShared<T>>,
    subscription: Mutex<Option<Subscription>>,
}

impl<T> SingleEntityWatcher<T>
where
    T: Persistable + Clone + Send + Sync + 'static,
{
    /// Subscribes to commits of `context`. No fetch happens until
    /// [`Self::perform_fetch`].
    pub fn new<P, C>(predicate: P, context: Context, on_change: C) -> Self
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
        C: Fn(&T, ChangeType) + Send + Sync + 'static,
    {
        let center = Arc::clone(&context.store().notifications);
        let shared = Arc::new(WatchShared {
            predicate: Box::new(predicate),
            on_change: Box::new(on_change),
            context,
            tracked: Mutex::new(Tracked {
                state: WatchState::Uninitialized,
                entity: None,
            }),
            disposed: AtomicBool::new(false),
        });

        let weak: Weak<WatchShared<T>> = Arc::downgrade(&shared);
        let subscription = center.subscribe(Arc::new(move |notification: &ChangeNotification| {
            if let Some(shared) = weak.upgrade() {
                shared.process(notification);
            }
        }));

        Self {
            shared,
            subscription: Mutex::new(Some(subscription)),
        }
    }

    /// Runs the predicate against the watched context.
    ///
    /// Exactly one match becomes the tracked entity and fires `FirstFetch`;
    /// no match leaves the watcher `Empty` without a callback.
    ///
    /// # Errors
    /// - `AmbiguousMatch` when more than one entity matches.
    pub fn perform_fetch(&self) -> StoreResult<Option<T>> {
        let shared = &self.shared;
        let mut matches = shared
            .context
            .fetch::<T, _>(|value| (shared.predicate)(value), &[])?;
        if matches.len() > 1 {
            return Err(StoreError::AmbiguousMatch {
                entity: T::ENTITY,
                count: matches.len(),
            });
        }

        let Some(found) = matches.pop() else {
            shared.set_tracked(WatchState::Empty, None);
            debug!(
                "event=watch_fetch module=watch status=ok entity={} matched=0",
                T::ENTITY
            );
            return Ok(None);
        };

        shared.set_tracked(WatchState::Fetched, Some(found.clone()));
        debug!(
            "event=watch_fetch module=watch status=ok entity={} matched=1",
            T::ENTITY
        );
        shared.emit(&found, ChangeType::FirstFetch);
        Ok(Some(found))
    }

    /// Currently tracked entity.
    pub fn entity(&self) -> Option<T> {
        self.shared.lock().entity.clone()
    }

    pub fn state(&self) -> WatchState {
        self.shared.lock().state
    }

    pub fn context(&self) -> &Context {
        &self.shared.context
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::SeqCst)
    }

    /// Unsubscribes. Later commits produce no callbacks.
    pub fn dispose(&self) {
        self.shared.disposed.store(true, Ordering::SeqCst);
        let subscription = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(subscription);
    }
}

impl<T> Drop for SingleEntityWatcher<T> {
    fn drop(&mut self) {
        self.shared.disposed.store(true, Ordering::SeqCst);
    }
}

impl<T> WatchShared<T>
where
    T: Persistable + Clone + Send + Sync + 'static,
{
    fn lock(&self) -> MutexGuard<'_, Tracked<T>> {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_tracked(&self, state: WatchState, entity: Option<T>) {
        let mut tracked = self.lock();
        tracked.state = state;
        tracked.entity = entity;
    }

    fn emit(&self, value: &T, change: ChangeType) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        (self.on_change)(value, change);
    }

    fn process(&self, notification: &ChangeNotification) {
        if self.disposed.load(Ordering::SeqCst) || notification.context != self.context.role() {
            return;
        }

        let changes = &notification.changes;
        let mut reduced: BTreeMap<RecordId, (T, ChangeType)> = BTreeMap::new();
        for (records, change) in [
            (&changes.inserted, ChangeType::Insert),
            (&changes.updated, ChangeType::Update),
            (&changes.deleted, ChangeType::Delete),
        ] {
            if let Some(value) = self.single_match(records, change) {
                reduced.insert(value.id(), (value, change));
            }
        }
        if let Some(value) = self.replaced_tracked(changes) {
            reduced.insert(value.id(), (value, ChangeType::Delete));
        }
        if reduced.is_empty() {
            return;
        }

        {
            let mut tracked = self.lock();
            for (id, (value, change)) in &reduced {
                match change {
                    ChangeType::Delete => {
                        let is_tracked = tracked
                            .entity
                            .as_ref()
                            .is_some_and(|entity| entity.id() == *id);
                        if is_tracked {
                            tracked.entity = None;
                            tracked.state = WatchState::Empty;
                        }
                    }
                    _ => {
                        tracked.entity = Some(value.clone());
                        tracked.state = WatchState::Fetched;
                    }
                }
            }
        }

        for (value, change) in reduced.values() {
            self.emit(value, *change);
        }
    }

    /// Tracked entity whose id was rewritten as another entity.
    fn replaced_tracked(&self, changes: &ChangeSet) -> Option<T> {
        let tracked = self.lock().entity.clone()?;
        let replaced = changes
            .updated
            .get(&tracked.id())
            .is_some_and(|record| !record.is_entity(T::ENTITY));
        replaced.then_some(tracked)
    }

    /// Decodes and filters one notification set.
    ///
    /// The predicate selects at most one entity, so several matches in one
    /// set indicate a caller bug.
    fn single_match(&self, records: &BTreeMap<RecordId, Record>, change: ChangeType) -> Option<T> {
        let mut matches = records
            .values()
            .filter(|record| record.is_entity(T::ENTITY))
            .filter_map(|record| match T::decode(record) {
                Ok(value) => Some(value),
                Err(err) => {
                    warn!(
                        "event=watch_decode module=watch status=error entity={} error={}",
                        T::ENTITY,
                        err
                    );
                    None
                }
            })
            .filter(|value| (self.predicate)(value));

        let first = matches.next()?;
        let extra = matches.count();
        if extra > 0 {
            error!(
                "event=watch_notify module=watch status=error error_code=ambiguous_match entity={} change={:?} matched={}",
                T::ENTITY,
                change,
                extra + 1
            );
            debug_assert!(
                extra == 0,
                "watch predicate matched {} `{}` records in one notification",
                extra + 1,
                T::ENTITY
            );
        }
        Some(first)
    }
}
