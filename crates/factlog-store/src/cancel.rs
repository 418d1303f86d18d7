//! Cooperative cancellation of in-flight statements.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use rusqlite::InterruptHandle;

use crate::error::StoreError;

/// Cancellation slot shared between a running scan and whoever may want to
/// stop it.
///
/// A scan arms the slot with its connection's interrupt handle for the
/// duration of the statement. Cancellation is sticky: once
/// [`cancel`](Self::cancel) has been called, any later attempt to arm the
/// slot fails with [`StoreError::Cancelled`].
#[derive(Default)]
pub struct StatementCancel {
    cancelled: AtomicBool,
    running: Mutex<Option<InterruptHandle>>,
}

impl StatementCancel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation and interrupts the statement currently armed,
    /// if any.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = running.as_ref() {
            tracing::trace!("interrupting in-flight statement");
            handle.interrupt();
        }
    }

    /// Returns `true` once [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Registers `handle` as the statement in flight until the returned
    /// guard is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Cancelled`] if cancellation was already
    /// requested.
    pub fn arm(&self, handle: InterruptHandle) -> Result<ArmedStatement<'_>, StoreError> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        *running = Some(handle);
        Ok(ArmedStatement { slot: self })
    }
}

impl std::fmt::Debug for StatementCancel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatementCancel")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Clears the armed interrupt handle when dropped.
pub struct ArmedStatement<'a> {
    slot: &'a StatementCancel,
}

impl Drop for ArmedStatement<'_> {
    fn drop(&mut self) {
        let mut running = self
            .slot
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *running = None;
    }
}
