//! In-process "something was appended" signals.
//!
//! Listeners register explicitly and receive the namespace and type of
//! every published fact group. Delivery is best effort: listeners must
//! tolerate duplicated signals, and a signal with an unknown namespace
//! means "anything may have changed".

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Callback invoked with `(namespace, type)`; either may be unknown.
pub type InsertListener = Arc<dyn Fn(Option<&str>, Option<&str>) + Send + Sync>;

/// Handle returned by [`InsertNotifier::on_insert`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Typed registry of insert listeners.
#[derive(Default)]
pub struct InsertNotifier {
    next_id: AtomicU64,
    listeners: RwLock<HashMap<ListenerId, InsertListener>>,
}

impl InsertNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener.
    pub fn on_insert(&self, listener: InsertListener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, listener);
        id
    }

    /// Unregisters a listener. Returns `false` if it was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    /// Signals that facts of `ns`/`fact_type` were appended.
    pub fn notify(&self, ns: &str, fact_type: Option<&str>) {
        self.dispatch(Some(ns), fact_type);
    }

    /// Signals an append whose namespace is unknown.
    pub fn notify_unknown(&self) {
        self.dispatch(None, None);
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn dispatch(&self, ns: Option<&str>, fact_type: Option<&str>) {
        // Snapshot so listeners may (un)register from inside a callback.
        let listeners: Vec<InsertListener> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        tracing::trace!(
            ns = ns.unwrap_or("<unknown>"),
            fact_type = fact_type.unwrap_or("<none>"),
            listeners = listeners.len(),
            "dispatching insert signal"
        );
        for listener in listeners {
            listener(ns, fact_type);
        }
    }
}

impl std::fmt::Debug for InsertNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InsertNotifier")
            .field("listeners", &self.listener_count())
            .finish()
    }
}
