//! Ordered namespace locking for writers and wildcard readers.
//!
//! Every namespace maps to a stable integer code, persisted in
//! `namespace_lock_code` and assigned once on first use. Code
//! [`WILDCARD_LOCK_CODE`] stands for `*`.
//!
//! Acquisition always follows one global order: the wildcard lock first,
//! then namespace locks ascending by code. Every participant honours that
//! order, which is what keeps concurrent writers with overlapping
//! namespace sets free of deadlock. A thread waiting for a lock is not
//! interruptible.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use factlog_types::is_wildcard;
use rusqlite::{params, Connection};

use crate::error::StoreError;

/// Lock code reserved for the wildcard namespace.
pub const WILDCARD_LOCK_CODE: i64 = 0;

/// How a lock is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Default)]
struct LockState {
    shared: usize,
    exclusive: bool,
    waiting_exclusive: usize,
}

/// A reader/writer lock with explicit acquire and release, so a set of
/// them can be held without borrowing from the table they live in.
/// Waiting exclusive requests block new shared holders.
#[derive(Debug, Default)]
struct NamespaceLock {
    state: Mutex<LockState>,
    released: Condvar,
}

impl NamespaceLock {
    fn state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, LockState>) -> MutexGuard<'a, LockState> {
        self.released
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire(&self, mode: LockMode) {
        let mut state = self.state();
        match mode {
            LockMode::Shared => {
                while state.exclusive || state.waiting_exclusive > 0 {
                    state = self.wait(state);
                }
                state.shared += 1;
            }
            LockMode::Exclusive => {
                state.waiting_exclusive += 1;
                while state.exclusive || state.shared > 0 {
                    state = self.wait(state);
                }
                state.waiting_exclusive -= 1;
                state.exclusive = true;
            }
        }
    }

    fn release(&self, mode: LockMode) {
        let mut state = self.state();
        match mode {
            LockMode::Shared => state.shared = state.shared.saturating_sub(1),
            LockMode::Exclusive => state.exclusive = false,
        }
        drop(state);
        self.released.notify_all();
    }
}

/// A set of held namespace locks, released in reverse acquisition order on
/// drop.
#[derive(Debug)]
pub struct NamespaceLocks {
    held: Vec<(i64, LockMode, Arc<NamespaceLock>)>,
}

impl NamespaceLocks {
    /// `(code, mode)` pairs in the order they were acquired.
    pub fn held(&self) -> Vec<(i64, LockMode)> {
        self.held.iter().map(|(code, mode, _)| (*code, *mode)).collect()
    }
}

impl Drop for NamespaceLocks {
    fn drop(&mut self) {
        while let Some((code, mode, lock)) = self.held.pop() {
            lock.release(mode);
            tracing::trace!(code, ?mode, "released namespace lock");
        }
    }
}

/// Orders lock requests for acquisition: one entry per code, exclusive
/// winning over shared, ascending by code, wildcard excluded.
pub fn plan_lock_order(requests: impl IntoIterator<Item = (i64, LockMode)>) -> Vec<(i64, LockMode)> {
    let mut plan: BTreeMap<i64, LockMode> = BTreeMap::new();
    for (code, mode) in requests {
        if code == WILDCARD_LOCK_CODE {
            continue;
        }
        plan.entry(code)
            .and_modify(|held| *held = (*held).max(mode))
            .or_insert(mode);
    }
    plan.into_iter().collect()
}

/// Maps namespaces to lock codes and hands out ordered lock sets.
#[derive(Debug, Default)]
pub struct NamespaceLockManager {
    codes: Mutex<HashMap<String, i64>>,
    locks: Mutex<HashMap<i64, Arc<NamespaceLock>>>,
}

impl NamespaceLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the lock code of `ns`, assigning the next free code on first
    /// use.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Database` if the code table cannot be read or
    /// written.
    pub fn code_for(&self, conn: &Connection, ns: &str) -> Result<i64, StoreError> {
        if is_wildcard(ns) {
            return Ok(WILDCARD_LOCK_CODE);
        }
        if let Some(code) = self.cached_code(ns) {
            return Ok(code);
        }

        // Assignment happens in one statement so two first uses of
        // different namespaces cannot observe the same MAX(code).
        conn.execute(
            "INSERT OR IGNORE INTO namespace_lock_code (ns, code)
             VALUES (?1, (SELECT COALESCE(MAX(code), 0) + 1 FROM namespace_lock_code))",
            params![ns],
        )?;
        let code: i64 = conn.query_row(
            "SELECT code FROM namespace_lock_code WHERE ns = ?1",
            params![ns],
            |row| row.get(0),
        )?;

        tracing::debug!(ns, code, "resolved namespace lock code");
        self.codes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ns.to_string(), code);
        Ok(code)
    }

    /// Locks for a plain publish: wildcard shared, then every written
    /// namespace exclusively.
    pub fn lock_for_publish(
        &self,
        conn: &Connection,
        written: &[&str],
    ) -> Result<NamespaceLocks, StoreError> {
        let mut requests = Vec::with_capacity(written.len());
        for ns in written {
            requests.push((self.code_for(conn, ns)?, LockMode::Exclusive));
        }
        Ok(self.acquire(LockMode::Shared, plan_lock_order(requests)))
    }

    /// Locks for a compare-and-swap publish: written namespaces exclusive,
    /// namespaces the token reads shared. The wildcard lock is taken
    /// exclusively when the token reads `*`.
    pub fn lock_for_conditional_publish(
        &self,
        conn: &Connection,
        written: &[&str],
        read: &[&str],
        reads_wildcard: bool,
    ) -> Result<NamespaceLocks, StoreError> {
        let mut requests = Vec::with_capacity(written.len() + read.len());
        for ns in written {
            requests.push((self.code_for(conn, ns)?, LockMode::Exclusive));
        }
        for ns in read {
            requests.push((self.code_for(conn, ns)?, LockMode::Shared));
        }
        let wildcard_mode = if reads_wildcard {
            LockMode::Exclusive
        } else {
            LockMode::Shared
        };
        Ok(self.acquire(wildcard_mode, plan_lock_order(requests)))
    }

    /// Locks out every publisher while a consistent view of `*` is taken.
    pub fn lock_wildcard_exclusive(&self) -> NamespaceLocks {
        self.acquire(LockMode::Exclusive, Vec::new())
    }

    fn acquire(&self, wildcard_mode: LockMode, plan: Vec<(i64, LockMode)>) -> NamespaceLocks {
        let mut held = Vec::with_capacity(plan.len() + 1);
        for (code, mode) in std::iter::once((WILDCARD_LOCK_CODE, wildcard_mode)).chain(plan) {
            let lock = self.lock_handle(code);
            lock.acquire(mode);
            tracing::trace!(code, ?mode, "acquired namespace lock");
            held.push((code, mode, lock));
        }
        NamespaceLocks { held }
    }

    fn cached_code(&self, ns: &str) -> Option<i64> {
        self.codes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(ns)
            .copied()
    }

    fn lock_handle(&self, code: i64) -> Arc<NamespaceLock> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(code).or_default())
    }
}
