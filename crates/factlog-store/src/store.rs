//! The SQLite-backed fact store and its publish protocol.

use std::collections::BTreeSet;
use std::sync::Arc;

use factlog_db::{create_pool, run_migrations, DbPool, DbRuntimeSettings};
use factlog_types::{Fact, FactSpec, StateToken};
use rusqlite::TransactionBehavior;
use uuid::Uuid;

use crate::cancel::StatementCancel;
use crate::error::StoreError;
use crate::fact_log::{FactLog, HighWater, ScanFlow, ScanRequest};
use crate::facts;
use crate::locks::NamespaceLockManager;
use crate::matcher::{FactMatcher, SpecMatcher};
use crate::notify::InsertNotifier;
use crate::tokens::StateTokenStore;

/// Append-only fact log on SQLite with namespace-locked publishing,
/// compare-and-swap against state tokens, and insert notifications.
pub struct FactStore {
    pool: DbPool,
    matcher: Arc<dyn FactMatcher>,
    locks: NamespaceLockManager,
    tokens: StateTokenStore,
    notifier: Arc<InsertNotifier>,
}

impl FactStore {
    /// Wraps an already migrated pool, evaluating specs with [`SpecMatcher`].
    pub fn new(pool: DbPool) -> Self {
        Self::with_matcher(pool, Arc::new(SpecMatcher))
    }

    /// Wraps an already migrated pool with a custom predicate evaluator.
    pub fn with_matcher(pool: DbPool, matcher: Arc<dyn FactMatcher>) -> Self {
        Self {
            tokens: StateTokenStore::new(pool.clone()),
            pool,
            matcher,
            locks: NamespaceLockManager::new(),
            notifier: Arc::new(InsertNotifier::new()),
        }
    }

    /// Opens the database at `path`, applies pending migrations and wraps it.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::PoolInit` or `StoreError::Migration` when the
    /// database cannot be prepared.
    pub fn open(path: &str, settings: DbRuntimeSettings) -> Result<Self, StoreError> {
        let pool = create_pool(path, settings)?;
        {
            let conn = pool.get()?;
            let applied = run_migrations(&conn)?;
            if applied > 0 {
                tracing::info!(count = applied, path, "applied database migrations");
            }
        }
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// The notification source subscribers register with.
    pub fn notifier(&self) -> Arc<InsertNotifier> {
        Arc::clone(&self.notifier)
    }

    /// The predicate evaluator used for post-query filtering.
    pub fn matcher(&self) -> Arc<dyn FactMatcher> {
        Arc::clone(&self.matcher)
    }

    /// Publishes `facts` atomically.
    ///
    /// Takes the wildcard lock shared and every written namespace
    /// exclusively, in code order, for the duration of the append.
    ///
    /// # Errors
    ///
    /// - `StoreError::InvalidFact` for a fact without a usable namespace
    /// - `StoreError::DuplicateFact` if any id already exists
    pub fn publish(&self, facts: Vec<Fact>) -> Result<Vec<Fact>, StoreError> {
        if facts.is_empty() {
            return Ok(facts);
        }
        facts::validate_facts(&facts)?;

        let mut conn = self.pool.get()?;
        let written = distinct_namespaces(&facts);
        let published = {
            let _locks = self.locks.lock_for_publish(&conn, &written)?;
            append_atomically(&mut conn, facts)?
        };
        drop(conn);

        self.announce(&published);
        Ok(published)
    }

    /// Publishes `facts` only if nothing matching the token's specs was
    /// appended since the token was issued.
    ///
    /// Returns `false`, appending nothing, on conflict or when the token is
    /// unknown (invalidated or compacted). Without a token this is a plain
    /// [`publish`](Self::publish). Tokens are single use: the token is
    /// invalidated after the attempt.
    pub fn publish_if_unchanged(
        &self,
        facts: Vec<Fact>,
        token: Option<Uuid>,
    ) -> Result<bool, StoreError> {
        let Some(token) = token else {
            self.publish(facts)?;
            return Ok(true);
        };

        let outcome = self.publish_against(facts, token);
        if let Err(e) = self.tokens.invalidate(token) {
            tracing::warn!(%token, error = %e, "failed to invalidate used state token");
        }
        outcome
    }

    fn publish_against(&self, facts: Vec<Fact>, token: Uuid) -> Result<bool, StoreError> {
        facts::validate_facts(&facts)?;

        let Some(state) = self.tokens.resolve(token)? else {
            tracing::debug!(%token, "unknown state token, rejecting conditional publish");
            return Ok(false);
        };

        let mut conn = self.pool.get()?;
        let written = distinct_namespaces(&facts);
        let read = state.namespaces();

        let published = {
            let _locks = self.locks.lock_for_conditional_publish(
                &conn,
                &written,
                &read,
                state.reads_wildcard(),
            )?;

            let current =
                facts::serial_of_last_matching(&conn, self.matcher.as_ref(), &state.specs)?;
            if current != state.serial_of_last_matching_fact {
                tracing::debug!(
                    %token,
                    expected = state.serial_of_last_matching_fact,
                    current,
                    "state changed, rejecting conditional publish"
                );
                return Ok(false);
            }

            if facts.is_empty() {
                Vec::new()
            } else {
                append_atomically(&mut conn, facts)?
            }
        };
        drop(conn);

        self.announce(&published);
        Ok(true)
    }

    /// Captures the current state of `specs` as a token usable with
    /// [`publish_if_unchanged`](Self::publish_if_unchanged).
    ///
    /// A snapshot that reads `*` holds the wildcard lock exclusively while
    /// it is taken.
    pub fn state_for(&self, specs: Vec<FactSpec>) -> Result<StateToken, StoreError> {
        let conn = self.pool.get()?;
        let serial = if specs.iter().any(FactSpec::is_wildcard) {
            let _snapshot = self.locks.lock_wildcard_exclusive();
            facts::serial_of_last_matching(&conn, self.matcher.as_ref(), &specs)?
        } else {
            facts::serial_of_last_matching(&conn, self.matcher.as_ref(), &specs)?
        };
        drop(conn);
        self.tokens.create(specs, serial)
    }

    /// Serial of the newest fact matching any of `specs`, `0` if none.
    pub fn serial_of_last_matching(&self, specs: &[FactSpec]) -> Result<i64, StoreError> {
        let conn = self.pool.get()?;
        facts::serial_of_last_matching(&conn, self.matcher.as_ref(), specs)
    }

    /// Drops a token. Returns `false` if it did not exist.
    pub fn invalidate(&self, token: Uuid) -> Result<bool, StoreError> {
        self.tokens.invalidate(token)
    }

    /// Deletes tokens older than `retention`.
    pub fn compact_state_tokens(&self, retention: chrono::Duration) -> Result<usize, StoreError> {
        self.tokens.compact(retention)
    }

    pub fn state_tokens(&self) -> &StateTokenStore {
        &self.tokens
    }

    pub fn lock_manager(&self) -> &NamespaceLockManager {
        &self.locks
    }

    /// Emits one insert signal per distinct namespace/type pair.
    fn announce(&self, published: &[Fact]) {
        let signals: BTreeSet<(&str, Option<&str>)> = published
            .iter()
            .map(|fact| (fact.ns.as_str(), fact.fact_type.as_deref()))
            .collect();
        for (ns, fact_type) in signals {
            self.notifier.notify(ns, fact_type);
        }
    }
}

impl FactLog for FactStore {
    /// Same as [`FactStore::publish`], namespace locks included.
    fn append(&self, facts: Vec<Fact>) -> Result<Vec<Fact>, StoreError> {
        self.publish(facts)
    }

    fn scan(
        &self,
        request: ScanRequest<'_>,
        cancel: &StatementCancel,
        on_row: &mut dyn FnMut(Fact) -> ScanFlow,
    ) -> Result<(), StoreError> {
        let mut conn = self.pool.get()?;
        let _armed = cancel.arm(conn.get_interrupt_handle())?;
        let tx = conn.transaction()?;
        facts::scan_facts(&tx, request, on_row)?;
        tx.commit()?;
        Ok(())
    }

    fn highest_serial(&self) -> Result<i64, StoreError> {
        let conn = self.pool.get()?;
        facts::highest_serial(&conn)
    }

    fn serial_of(&self, id: Uuid) -> Result<Option<i64>, StoreError> {
        let conn = self.pool.get()?;
        facts::serial_of(&conn, id)
    }

    fn latest_fact(&self) -> Result<Option<HighWater>, StoreError> {
        let conn = self.pool.get()?;
        facts::latest_fact(&conn)
    }
}

impl std::fmt::Debug for FactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactStore")
            .field("notifier", &self.notifier)
            .finish_non_exhaustive()
    }
}

fn append_atomically(
    conn: &mut rusqlite::Connection,
    facts: Vec<Fact>,
) -> Result<Vec<Fact>, StoreError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let published = facts::insert_facts(&tx, facts)?;
    tx.commit()?;
    if let (Some(first), Some(last)) = (published.first(), published.last()) {
        tracing::debug!(
            count = published.len(),
            first_serial = ?first.serial,
            last_serial = ?last.serial,
            "appended facts"
        );
    }
    Ok(published)
}

fn distinct_namespaces(facts: &[Fact]) -> Vec<&str> {
    let namespaces: BTreeSet<&str> = facts.iter().map(|fact| fact.ns.as_str()).collect();
    namespaces.into_iter().collect()
}
