//! Commit notifications and RAII subscriptions.

use super::ContextRole;
use crate::model::change::ChangeSet;
use log::debug;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

/// Published once per successful context commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotification {
    /// Context whose commit produced the changes.
    pub context: ContextRole,
    pub changes: ChangeSet,
}

pub(crate) type Listener = Arc<dyn Fn(&ChangeNotification) + Send + Sync + 'static>;

/// Per-store listener registry.
///
/// Listeners run synchronously on the committing thread.
#[derive(Default)]
pub(crate) struct NotificationCenter {
    next_id: AtomicU64,
    listeners: Mutex<BTreeMap<u64, Listener>>,
}

impl NotificationCenter {
    pub(crate) fn subscribe(self: &Arc<Self>, listener: Listener) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, listener);
        Subscription {
            center: Arc::downgrade(self),
            id,
        }
    }

    pub(crate) fn publish(&self, notification: &ChangeNotification) {
        // Snapshot so listeners may subscribe or unsubscribe while running.
        let listeners: Vec<Listener> = self.lock().values().cloned().collect();
        debug!(
            "event=notify module=store status=ok context={} changes={} listeners={}",
            notification.context.as_str(),
            notification.changes.len(),
            listeners.len()
        );
        for listener in listeners {
            listener(notification);
        }
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self) -> usize {
        self.lock().len()
    }

    fn unsubscribe(&self, id: u64) {
        self.lock().remove(&id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, Listener>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Active registration; unsubscribes when dropped.
#[must_use = "dropping a subscription unsubscribes immediately"]
pub struct Subscription {
    center: Weak<NotificationCenter>,
    id: u64,
}

impl Subscription {
    /// Unsubscribes now. Equivalent to dropping the value.
    pub fn cancel(self) {}

    pub fn is_active(&self) -> bool {
        self.center
            .upgrade()
            .is_some_and(|center| center.lock().contains_key(&self.id))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(center) = self.center.upgrade() {
            center.unsubscribe(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
