//! Single-flight cursor-based query.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use factlog_store::{FactLog, FactMatcher, ScanFlow, ScanRequest, StatementCancel, StoreError};
use factlog_types::{Fact, FactSpec};
use uuid::Uuid;

use crate::error::SubscriptionError;
use crate::observer::SubscriptionObserver;
use crate::transform::{requested_versions, FactTransformer};

/// Position of a subscription in the log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryCursor {
    /// Everything up to and including this serial has been examined.
    pub serial: i64,
    /// Serial of the last fact handed to the observer.
    pub last_delivered: Option<i64>,
}

/// Counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub examined: usize,
    pub delivered: usize,
}

impl RunStats {
    fn absorb(&mut self, other: RunStats) {
        self.examined += other.examined;
        self.delivered += other.delivered;
    }
}

/// Everything a [`SynchronizedQuery`] reads from and delivers into.
pub struct QueryParts {
    pub subscription: Uuid,
    pub log: Arc<dyn FactLog>,
    pub matcher: Arc<dyn FactMatcher>,
    pub transformer: Arc<dyn FactTransformer>,
    pub observer: Arc<dyn SubscriptionObserver>,
    pub specs: Vec<FactSpec>,
    pub blocked: Arc<HashSet<Uuid>>,
    pub connected: Arc<AtomicBool>,
    pub cancel: Arc<StatementCancel>,
}

/// Delivers every fact after its cursor that matches the specs, at most one
/// run at a time.
///
/// The cursor lock is held for the whole run. [`run`](Self::run) queues
/// behind a run in progress; [`run_or_defer`](Self::run_or_defer) leaves a
/// rerun request for the current holder instead, which keeps a run
/// triggered from inside the observer (same thread, lock already held)
/// from blocking. Facts reach the observer in strictly increasing serial
/// order and never twice.
pub struct SynchronizedQuery {
    parts: QueryParts,
    skip_post_filter: bool,
    cursor: Mutex<QueryCursor>,
    rerun: AtomicBool,
}

impl SynchronizedQuery {
    pub fn new(parts: QueryParts) -> Self {
        let skip_post_filter = parts.matcher.can_skip(&parts.specs);
        Self {
            parts,
            skip_post_filter,
            cursor: Mutex::new(QueryCursor::default()),
            rerun: AtomicBool::new(false),
        }
    }

    pub fn cursor(&self) -> QueryCursor {
        *self.lock_cursor()
    }

    /// Moves the cursor forward to `serial`; never moves it back.
    pub fn advance_to(&self, serial: i64) {
        let mut cursor = self.lock_cursor();
        cursor.serial = cursor.serial.max(serial);
    }

    pub fn specs(&self) -> &[FactSpec] {
        &self.parts.specs
    }

    fn lock_cursor(&self) -> MutexGuard<'_, QueryCursor> {
        self.cursor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_lock_cursor(&self) -> Option<MutexGuard<'_, QueryCursor>> {
        match self.cursor.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    fn is_connected(&self) -> bool {
        self.parts.connected.load(Ordering::SeqCst)
    }

    /// Delivers everything past the cursor.
    ///
    /// The log head is read before scanning; after a complete scan the
    /// cursor is at least that head, even when nothing matched.
    ///
    /// # Errors
    ///
    /// Store, match, transformation and observer failures. Failures after
    /// the subscription disconnected (typically the interrupted statement)
    /// are logged at trace level and reported as success.
    pub fn run(&self, use_index: bool) -> Result<RunStats, SubscriptionError> {
        let mut stats = self.run_locked(self.lock_cursor(), use_index)?;
        if self.rerun.swap(false, Ordering::SeqCst) {
            stats.absorb(self.run_or_defer(use_index)?);
        }
        Ok(stats)
    }

    /// Runs now if no run is in progress. Otherwise records a rerun request
    /// that the running caller serves after releasing the cursor, and
    /// returns at once with empty stats.
    ///
    /// # Errors
    ///
    /// As for [`run`](Self::run).
    pub fn run_or_defer(&self, use_index: bool) -> Result<RunStats, SubscriptionError> {
        let mut total = RunStats::default();
        loop {
            let cursor = match self.try_lock_cursor() {
                Some(cursor) => cursor,
                None => {
                    self.rerun.store(true, Ordering::SeqCst);
                    // The holder may have released before seeing the request.
                    match self.try_lock_cursor() {
                        Some(cursor) => cursor,
                        None => {
                            tracing::trace!(subscription = %self.parts.subscription, "run in progress, rerun requested");
                            return Ok(total);
                        }
                    }
                }
            };
            self.rerun.store(false, Ordering::SeqCst);
            total.absorb(self.run_locked(cursor, use_index)?);
            if !self.rerun.swap(false, Ordering::SeqCst) {
                return Ok(total);
            }
        }
    }

    fn run_locked(
        &self,
        mut cursor: MutexGuard<'_, QueryCursor>,
        use_index: bool,
    ) -> Result<RunStats, SubscriptionError> {
        let mut stats = RunStats::default();
        if !self.is_connected() {
            return Ok(stats);
        }

        let latest = match self.parts.log.highest_serial() {
            Ok(serial) => serial,
            Err(e) => return self.classify(e, stats),
        };

        let mut failure: Option<SubscriptionError> = None;
        let request = ScanRequest {
            specs: &self.parts.specs,
            after_serial: cursor.serial,
            limit: None,
            use_index,
        };
        let scanned = self.parts.log.scan(request, &self.parts.cancel, &mut |fact| {
            if !self.is_connected() {
                return ScanFlow::Stop;
            }
            match self.handle_row(fact, &mut cursor, &mut stats) {
                Ok(()) => ScanFlow::Continue,
                Err(e) => {
                    failure = Some(e);
                    ScanFlow::Stop
                }
            }
        });

        if let Err(e) = scanned {
            return self.classify(e, stats);
        }
        if let Some(e) = failure {
            if !self.is_connected() {
                tracing::trace!(subscription = %self.parts.subscription, error = %e, "row failed after disconnect");
                return Ok(stats);
            }
            return Err(e);
        }
        if self.is_connected() {
            cursor.serial = cursor.serial.max(latest);
        }

        tracing::trace!(
            subscription = %self.parts.subscription,
            use_index,
            examined = stats.examined,
            delivered = stats.delivered,
            cursor = cursor.serial,
            "query run finished"
        );
        Ok(stats)
    }

    fn handle_row(
        &self,
        fact: Fact,
        cursor: &mut QueryCursor,
        stats: &mut RunStats,
    ) -> Result<(), SubscriptionError> {
        let serial = fact.serial.unwrap_or(cursor.serial);
        stats.examined += 1;

        if self.parts.blocked.contains(&fact.id) {
            tracing::debug!(subscription = %self.parts.subscription, fact_id = %fact.id, "skipping blocked fact");
            cursor.serial = cursor.serial.max(serial);
            return Ok(());
        }
        if !self.skip_post_filter && !self.parts.matcher.matches_any(&fact, &self.parts.specs)? {
            cursor.serial = cursor.serial.max(serial);
            return Ok(());
        }

        let requested = requested_versions(&self.parts.specs, &fact);
        let fact = self.parts.transformer.transform(fact, &requested)?;
        if !self.is_connected() {
            return Ok(());
        }
        self.parts
            .observer
            .on_next(fact)
            .map_err(SubscriptionError::Observer)?;

        cursor.serial = cursor.serial.max(serial);
        cursor.last_delivered = Some(serial);
        stats.delivered += 1;
        Ok(())
    }

    fn classify(&self, error: StoreError, stats: RunStats) -> Result<RunStats, SubscriptionError> {
        if !self.is_connected() {
            tracing::trace!(
                subscription = %self.parts.subscription,
                error = %error,
                cancellation = error.is_cancellation(),
                "statement ended after disconnect"
            );
            return Ok(stats);
        }
        Err(SubscriptionError::Store(error))
    }
}

impl std::fmt::Debug for SynchronizedQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynchronizedQuery")
            .field("subscription", &self.parts.subscription)
            .field("specs", &self.parts.specs)
            .field("cursor", &self.cursor())
            .finish()
    }
}
