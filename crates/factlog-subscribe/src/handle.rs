//! The caller-facing side of a subscription.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use factlog_store::{InsertNotifier, ListenerId, StatementCancel};
use tokio::sync::watch;
use uuid::Uuid;

use crate::condensed::CondensedQueryExecutor;
use crate::error::SubscriptionError;

/// Lifecycle of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Connecting,
    Catchup,
    FastForwardCheck,
    Following,
    Completed,
    Failed,
    Closed,
}

impl SubscriptionState {
    /// No further transitions happen except to `Closed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Closed)
    }
}

/// Snapshot published to waiters on every change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionProgress {
    pub state: SubscriptionState,
    pub caught_up: bool,
    pub completed: bool,
    pub error: Option<String>,
}

type CloseHook = Box<dyn FnOnce() + Send>;

struct FollowRegistration {
    listener: ListenerId,
    executor: Arc<CondensedQueryExecutor>,
}

/// State shared by the handle and the task that feeds the observer.
pub(crate) struct SubscriptionShared {
    pub(crate) id: Uuid,
    pub(crate) connected: Arc<AtomicBool>,
    pub(crate) cancel: Arc<StatementCancel>,
    close_requested: AtomicBool,
    failed: AtomicBool,
    progress: watch::Sender<SubscriptionProgress>,
    close_hooks: Mutex<Vec<CloseHook>>,
    follow: Mutex<Option<FollowRegistration>>,
    notifier: Arc<InsertNotifier>,
}

impl SubscriptionShared {
    pub(crate) fn new(id: Uuid, notifier: Arc<InsertNotifier>) -> Self {
        let (progress, _) = watch::channel(SubscriptionProgress {
            state: SubscriptionState::Connecting,
            caught_up: false,
            completed: false,
            error: None,
        });
        Self {
            id,
            connected: Arc::new(AtomicBool::new(true)),
            cancel: Arc::new(StatementCancel::new()),
            close_requested: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            progress,
            close_hooks: Mutex::new(Vec::new()),
            follow: Mutex::new(None),
            notifier,
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn transition(&self, state: SubscriptionState) {
        self.progress.send_modify(|progress| {
            let allowed = match progress.state {
                SubscriptionState::Closed => false,
                SubscriptionState::Failed | SubscriptionState::Completed => {
                    state == SubscriptionState::Closed
                }
                _ => true,
            };
            if allowed {
                progress.state = state;
            }
        });
        tracing::debug!(subscription = %self.id, ?state, "subscription state changed");
    }

    pub(crate) fn mark_caught_up(&self) {
        self.progress.send_modify(|progress| progress.caught_up = true);
    }

    pub(crate) fn mark_completed(&self) {
        self.progress.send_modify(|progress| progress.completed = true);
        self.transition(SubscriptionState::Completed);
    }

    /// Attaches the follow listener. Returns `false` and undoes the
    /// registration if the subscription disconnected meanwhile.
    pub(crate) fn register_follow(
        &self,
        listener: ListenerId,
        executor: Arc<CondensedQueryExecutor>,
    ) -> bool {
        let mut follow = self.follow.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.is_connected() {
            self.notifier.remove(listener);
            executor.cancel();
            return false;
        }
        *follow = Some(FollowRegistration { listener, executor });
        true
    }

    /// Stops every source of further work: the flag, the running statement
    /// and the follow listener.
    fn teardown(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        let registration = self
            .follow
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(registration) = registration {
            self.notifier.remove(registration.listener);
            registration.executor.cancel();
        }
    }

    /// Claims the right to report a failure. Only the first caller wins.
    pub(crate) fn begin_failure(&self) -> bool {
        !self.failed.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn fail(&self, message: String) {
        self.teardown();
        self.progress.send_modify(|progress| {
            if progress.error.is_none() {
                progress.error = Some(message);
            }
        });
        self.transition(SubscriptionState::Failed);
    }

    pub(crate) fn close(&self) {
        if self.close_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        self.teardown();
        self.transition(SubscriptionState::Closed);
        tracing::info!(subscription = %self.id, "subscription closed");

        let hooks = std::mem::take(
            &mut *self
                .close_hooks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for hook in hooks {
            hook();
        }
    }

    fn on_close(&self, hook: CloseHook) {
        let mut hooks = self
            .close_hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.close_requested.load(Ordering::SeqCst) {
            drop(hooks);
            hook();
            return;
        }
        hooks.push(hook);
    }
}

/// Handle to a running subscription.
///
/// Dropping the handle does not close the subscription; call
/// [`close`](Self::close).
#[derive(Clone)]
pub struct SubscriptionHandle {
    shared: Arc<SubscriptionShared>,
}

impl SubscriptionHandle {
    pub(crate) fn new(shared: Arc<SubscriptionShared>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn state(&self) -> SubscriptionState {
        self.shared.progress.borrow().state
    }

    pub fn progress(&self) -> SubscriptionProgress {
        self.shared.progress.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Stops delivery, interrupts the running statement, detaches from
    /// insert signals and runs the close hooks. Idempotent.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Registers a hook run on [`close`](Self::close), or immediately if
    /// the subscription is already closed.
    pub fn on_close(&self, hook: impl FnOnce() + Send + 'static) {
        self.shared.on_close(Box::new(hook));
    }

    /// Waits until catch-up has been signalled.
    ///
    /// # Errors
    ///
    /// [`SubscriptionError::Timeout`] when `timeout` elapses first,
    /// [`SubscriptionError::Failed`] or [`SubscriptionError::Closed`] when
    /// the subscription ends before catching up.
    pub async fn await_catchup(&self, timeout: Option<Duration>) -> Result<(), SubscriptionError> {
        self.wait_until(timeout, "catch-up", |p| p.caught_up).await
    }

    /// Waits until a non-continuous subscription has completed. Errors as
    /// for [`await_catchup`](Self::await_catchup).
    pub async fn await_complete(&self, timeout: Option<Duration>) -> Result<(), SubscriptionError> {
        self.wait_until(timeout, "completion", |p| p.completed).await
    }

    async fn wait_until(
        &self,
        timeout: Option<Duration>,
        what: &'static str,
        reached: fn(&SubscriptionProgress) -> bool,
    ) -> Result<(), SubscriptionError> {
        let mut rx = self.shared.progress.subscribe();
        let wait = async move {
            let progress = rx
                .wait_for(|p| reached(p) || matches!(p.state, SubscriptionState::Failed | SubscriptionState::Closed))
                .await
                .map_err(|_| SubscriptionError::Closed)?
                .clone();
            if reached(&progress) {
                return Ok(());
            }
            match progress.error {
                Some(message) => Err(SubscriptionError::Failed(message)),
                None => Err(SubscriptionError::Closed),
            }
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| SubscriptionError::Timeout(what))?,
            None => wait.await,
        }
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}
