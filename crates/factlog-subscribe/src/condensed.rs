//! Debounced execution of follow queries.
//!
//! Insert signals arrive once per committed batch and namespace. A follow
//! subscription does not need one query per signal: every signal that lands
//! while a run is pending is absorbed into that run.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use factlog_types::{FactSpec, WILDCARD_NS};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// The query a [`CondensedQueryExecutor`] runs.
pub type TargetQuery = Arc<dyn Fn() + Send + Sync>;

/// Reports whether the owning subscription still wants results.
pub type ConnectedCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Below this delay triggers run the query synchronously.
const MIN_DELAY: Duration = Duration::from_millis(1);

/// Namespaces and `ns:type` pairs a subscription reads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterestSet {
    keys: HashSet<String>,
}

impl InterestSet {
    pub fn from_specs(specs: &[FactSpec]) -> Self {
        let keys = specs
            .iter()
            .map(|spec| {
                if spec.is_wildcard() {
                    WILDCARD_NS.to_string()
                } else {
                    match &spec.fact_type {
                        Some(ty) => format!("{}:{ty}", spec.ns),
                        None => spec.ns.clone(),
                    }
                }
            })
            .collect();
        Self { keys }
    }

    /// Returns `true` if a signal for `ns`/`fact_type` may concern this set.
    /// A signal without a namespace is always relevant.
    pub fn might_match(&self, ns: Option<&str>, fact_type: Option<&str>) -> bool {
        let Some(ns) = ns else {
            return true;
        };
        if self.keys.contains(WILDCARD_NS) || self.keys.contains(ns) {
            return true;
        }
        match fact_type {
            Some(ty) => self.keys.contains(&format!("{ns}:{ty}")),
            None => false,
        }
    }
}

/// Runs a target query at most once per `max_delay` window.
pub struct CondensedQueryExecutor {
    max_delay: Duration,
    target: TargetQuery,
    is_connected: ConnectedCheck,
    interest: InterestSet,
    scheduled: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    timer: Mutex<Option<JoinHandle<()>>>,
    runtime: Handle,
}

impl CondensedQueryExecutor {
    pub fn new(
        max_delay: Duration,
        target: TargetQuery,
        is_connected: ConnectedCheck,
        interest: InterestSet,
        runtime: Handle,
    ) -> Self {
        Self {
            max_delay,
            target,
            is_connected,
            interest,
            scheduled: Arc::new(AtomicBool::new(false)),
            cancelled: Arc::new(AtomicBool::new(false)),
            timer: Mutex::new(None),
            runtime,
        }
    }

    /// Requests a run.
    ///
    /// With a delay under one millisecond the query runs on the calling
    /// thread, which may already be inside a run of the same query; the
    /// target has to tolerate that. Otherwise the first trigger of a window
    /// arms a timer and later triggers are absorbed until it fires.
    pub fn trigger(&self) {
        if self.cancelled.load(Ordering::SeqCst) || !(self.is_connected)() {
            return;
        }
        if self.max_delay < MIN_DELAY {
            (self.target)();
            return;
        }
        if self
            .scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::trace!("follow query already scheduled, trigger absorbed");
            return;
        }

        let delay = self.max_delay;
        let target = Arc::clone(&self.target);
        let scheduled = Arc::clone(&self.scheduled);
        let cancelled = Arc::clone(&self.cancelled);
        let timer = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if cancelled.load(Ordering::SeqCst) {
                return;
            }
            // Triggers from here on open a new window.
            scheduled.store(false, Ordering::SeqCst);
            if let Err(e) = tokio::task::spawn_blocking(move || target()).await {
                tracing::error!(error = %e, "follow query task failed");
            }
        });
        *self.timer.lock().unwrap_or_else(PoisonError::into_inner) = Some(timer);
    }

    /// Filters an insert signal through the interest set and triggers on a
    /// possible match.
    pub fn on_insert(&self, ns: Option<&str>, fact_type: Option<&str>) {
        if self.interest.might_match(ns, fact_type) {
            self.trigger();
        }
    }

    /// Stops the pending timer. Later triggers are ignored.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(timer) = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            timer.abort();
        }
        self.scheduled.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn interest(&self) -> &InterestSet {
        &self.interest
    }
}

impl std::fmt::Debug for CondensedQueryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CondensedQueryExecutor")
            .field("max_delay", &self.max_delay)
            .field("interest", &self.interest)
            .field("scheduled", &self.scheduled.load(Ordering::SeqCst))
            .field("cancelled", &self.cancelled.load(Ordering::SeqCst))
            .finish()
    }
}
