//! Wiring of subscriptions: catch-up, fast-forward and follow.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use factlog_store::{FactLog, FactMatcher, FactStore, InsertNotifier, SpecMatcher};
use factlog_types::{StartingPoint, SubscriptionRequest};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::condensed::{CondensedQueryExecutor, ConnectedCheck, InterestSet, TargetQuery};
use crate::error::SubscriptionError;
use crate::fast_forward::{FastForwardTarget, DEFAULT_FAST_FORWARD_MAX_AGE};
use crate::handle::{SubscriptionHandle, SubscriptionShared, SubscriptionState};
use crate::observer::SubscriptionObserver;
use crate::query::{QueryParts, SynchronizedQuery};
use crate::transform::{FactTransformer, IdentityTransformer};

/// Tunables for a [`SubscriptionCoordinator`].
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Debounce window for requests that do not set their own.
    pub default_max_follow_delay: Duration,
    /// Upper bound on subscriptions connecting at the same time.
    pub max_concurrent_catchups: usize,
    /// Facts never delivered to any subscriber.
    pub blocked_fact_ids: HashSet<Uuid>,
    /// Oldest head reading a connecting subscription trusts before reading
    /// the log itself.
    pub fast_forward_max_age: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            default_max_follow_delay: Duration::from_millis(100),
            max_concurrent_catchups: 8,
            blocked_fact_ids: HashSet::new(),
            fast_forward_max_age: DEFAULT_FAST_FORWARD_MAX_AGE,
        }
    }
}

/// Creates subscriptions and drives them through their lifecycle.
///
/// Connecting (catch-up, fast-forward check, follow registration) runs on
/// the blocking pool of `runtime`, bounded by
/// [`CoordinatorSettings::max_concurrent_catchups`]. Follow runs are
/// scheduled by each subscription's [`CondensedQueryExecutor`].
pub struct SubscriptionCoordinator {
    log: Arc<dyn FactLog>,
    notifier: Arc<InsertNotifier>,
    matcher: Arc<dyn FactMatcher>,
    transformer: Arc<dyn FactTransformer>,
    fast_forward: Arc<FastForwardTarget>,
    catchup_permits: Arc<Semaphore>,
    blocked: Arc<HashSet<Uuid>>,
    default_max_follow_delay: Duration,
    runtime: Handle,
}

impl SubscriptionCoordinator {
    pub fn new(
        log: Arc<dyn FactLog>,
        notifier: Arc<InsertNotifier>,
        settings: CoordinatorSettings,
        runtime: Handle,
    ) -> Self {
        Self {
            log,
            notifier,
            matcher: Arc::new(SpecMatcher),
            transformer: Arc::new(IdentityTransformer),
            fast_forward: Arc::new(FastForwardTarget::with_max_age(settings.fast_forward_max_age)),
            catchup_permits: Arc::new(Semaphore::new(settings.max_concurrent_catchups.max(1))),
            blocked: Arc::new(settings.blocked_fact_ids),
            default_max_follow_delay: settings.default_max_follow_delay,
            runtime,
        }
    }

    /// Coordinator over a [`FactStore`], sharing its notifier and matcher.
    pub fn for_store(store: Arc<FactStore>, settings: CoordinatorSettings, runtime: Handle) -> Self {
        let notifier = store.notifier();
        let matcher = store.matcher();
        Self::new(store, notifier, settings, runtime).with_matcher(matcher)
    }

    pub fn with_matcher(mut self, matcher: Arc<dyn FactMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn with_transformer(mut self, transformer: Arc<dyn FactTransformer>) -> Self {
        self.transformer = transformer;
        self
    }

    /// The shared head tracker.
    ///
    /// Connecting subscriptions read the log themselves once the cached
    /// head is older than [`CoordinatorSettings::fast_forward_max_age`].
    /// Between those reads the head only moves if something calls
    /// [`FastForwardTarget::refresh`], typically a periodic task.
    pub fn fast_forward_target(&self) -> Arc<FastForwardTarget> {
        Arc::clone(&self.fast_forward)
    }

    pub fn log(&self) -> Arc<dyn FactLog> {
        Arc::clone(&self.log)
    }

    /// Starts a subscription and returns immediately.
    ///
    /// Everything the subscription produces, including a failure to
    /// connect, reaches `observer`.
    pub fn subscribe(
        &self,
        request: SubscriptionRequest,
        observer: Arc<dyn SubscriptionObserver>,
    ) -> SubscriptionHandle {
        let id = Uuid::new_v4();
        let shared = Arc::new(SubscriptionShared::new(id, Arc::clone(&self.notifier)));
        let query = SynchronizedQuery::new(QueryParts {
            subscription: id,
            log: Arc::clone(&self.log),
            matcher: Arc::clone(&self.matcher),
            transformer: Arc::clone(&self.transformer),
            observer: Arc::clone(&observer),
            specs: request.specs.clone(),
            blocked: Arc::clone(&self.blocked),
            connected: Arc::clone(&shared.connected),
            cancel: Arc::clone(&shared.cancel),
        });
        let max_follow_delay = request
            .max_follow_delay
            .unwrap_or(self.default_max_follow_delay);

        tracing::info!(
            subscription = %id,
            specs = request.specs.len(),
            continuous = request.continuous,
            ephemeral = request.ephemeral,
            debug_info = request.debug_info.as_deref().unwrap_or(""),
            "subscription requested"
        );

        let task = Arc::new(SubscriptionTask {
            shared: Arc::clone(&shared),
            request,
            query,
            observer,
            log: Arc::clone(&self.log),
            notifier: Arc::clone(&self.notifier),
            fast_forward: Arc::clone(&self.fast_forward),
            max_follow_delay,
            runtime: self.runtime.clone(),
        });

        let permits = Arc::clone(&self.catchup_permits);
        self.runtime.spawn(async move {
            let permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    task.fail(SubscriptionError::Closed);
                    return;
                }
            };
            let worker = Arc::clone(&task);
            let connected = tokio::task::spawn_blocking(move || worker.connect()).await;
            drop(permit);
            if let Err(e) = connected {
                task.fail(SubscriptionError::Failed(format!("connect task failed: {e}")));
            }
        });

        SubscriptionHandle::new(shared)
    }
}

impl std::fmt::Debug for SubscriptionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionCoordinator")
            .field("default_max_follow_delay", &self.default_max_follow_delay)
            .field("available_catchups", &self.catchup_permits.available_permits())
            .field("blocked", &self.blocked.len())
            .finish()
    }
}

/// One subscription's worker side.
///
/// While following, the executor's target holds a strong reference to the
/// task; closing or failing drops the registration and with it the cycle.
struct SubscriptionTask {
    shared: Arc<SubscriptionShared>,
    request: SubscriptionRequest,
    query: SynchronizedQuery,
    observer: Arc<dyn SubscriptionObserver>,
    log: Arc<dyn FactLog>,
    notifier: Arc<InsertNotifier>,
    fast_forward: Arc<FastForwardTarget>,
    max_follow_delay: Duration,
    runtime: Handle,
}

impl SubscriptionTask {
    fn connect(self: &Arc<Self>) {
        if let Err(e) = self.run_connect() {
            self.fail(e);
        }
    }

    fn run_connect(self: &Arc<Self>) -> Result<(), SubscriptionError> {
        if !self.shared.is_connected() {
            return Ok(());
        }
        let mut start = self.resolve_start()?;
        self.query.advance_to(start);

        if self.request.ephemeral {
            start = start.max(self.log.highest_serial()?);
            self.query.advance_to(start);
        } else {
            self.shared.transition(SubscriptionState::Catchup);
            // The second pass picks up what was committed during the first.
            let first = self.query.run(true)?;
            let second = self.query.run(true)?;
            tracing::debug!(
                subscription = %self.shared.id,
                delivered = first.delivered + second.delivered,
                cursor = self.query.cursor().serial,
                "catch-up finished"
            );
        }
        if !self.shared.is_connected() {
            return Ok(());
        }

        self.shared.transition(SubscriptionState::FastForwardCheck);
        self.check_fast_forward(start)?;
        if !self.shared.is_connected() {
            return Ok(());
        }
        self.observer.on_catchup();
        self.shared.mark_caught_up();

        if self.request.continuous {
            self.follow();
        } else {
            self.observer.on_complete();
            self.shared.mark_completed();
            tracing::debug!(subscription = %self.shared.id, "subscription completed");
        }
        Ok(())
    }

    fn resolve_start(&self) -> Result<i64, SubscriptionError> {
        match self.request.starting_after {
            None => Ok(0),
            Some(StartingPoint::Serial(serial)) => Ok(serial.max(0)),
            Some(StartingPoint::FactId(id)) => self
                .log
                .serial_of(id)?
                .ok_or(SubscriptionError::UnknownStartingFact(id)),
        }
    }

    /// Tells the observer the log has moved past its position when nothing
    /// delivered gets it there.
    fn check_fast_forward(&self, start: i64) -> Result<(), SubscriptionError> {
        let Some(target) = self.fast_forward.current(&*self.log)? else {
            return Ok(());
        };
        let position = self
            .query
            .cursor()
            .last_delivered
            .map_or(start, |delivered| delivered.max(start));
        if target.serial > position {
            tracing::debug!(
                subscription = %self.shared.id,
                fact_id = %target.fact_id,
                serial = target.serial,
                "fast-forwarding"
            );
            self.observer.on_fast_forward(target.fact_id);
        }
        Ok(())
    }

    fn follow(self: &Arc<Self>) {
        let task = Arc::clone(self);
        let target: TargetQuery = Arc::new(move || task.follow_once());
        let connected = Arc::clone(&self.shared.connected);
        let is_connected: ConnectedCheck =
            Arc::new(move || connected.load(std::sync::atomic::Ordering::SeqCst));
        let executor = Arc::new(CondensedQueryExecutor::new(
            self.max_follow_delay,
            target,
            is_connected,
            InterestSet::from_specs(&self.request.specs),
            self.runtime.clone(),
        ));

        let listening = Arc::clone(&executor);
        let listener = self
            .notifier
            .on_insert(Arc::new(move |ns, fact_type| listening.on_insert(ns, fact_type)));
        if !self.shared.register_follow(listener, executor) {
            return;
        }
        self.shared.transition(SubscriptionState::Following);
        tracing::debug!(
            subscription = %self.shared.id,
            max_follow_delay_ms = self.max_follow_delay.as_millis() as u64,
            "following"
        );

        // Covers commits that landed between catch-up and registration.
        self.follow_once();
    }

    fn follow_once(&self) {
        match self.query.run_or_defer(false) {
            Ok(stats) if stats.delivered > 0 => {
                tracing::trace!(subscription = %self.shared.id, delivered = stats.delivered, "follow run delivered");
            }
            Ok(_) => {}
            Err(e) => self.fail(e),
        }
    }

    fn fail(&self, error: SubscriptionError) {
        if !self.shared.is_connected() {
            tracing::trace!(subscription = %self.shared.id, error = %error, "error after disconnect ignored");
            return;
        }
        if !self.shared.begin_failure() {
            return;
        }
        tracing::error!(subscription = %self.shared.id, error = %error, "subscription failed");
        let message = error.to_string();
        self.shared.fail(message);
        self.observer.on_error(&error);
    }
}
