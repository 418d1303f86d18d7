//! Catch-up and follow subscriptions over a fact log.
//!
//! A subscription first delivers the history matching its specs
//! (catch-up), optionally tells the observer the log has moved past it
//! (fast-forward), and then, if continuous, keeps delivering new facts as
//! insert signals arrive (follow).
//!
//! - [`SubscriptionCoordinator`]: creates subscriptions and drives their
//!   lifecycle.
//! - [`SynchronizedQuery`]: the single-flight cursor both phases read
//!   through.
//! - [`CondensedQueryExecutor`]: debounces insert signals into follow runs.
//! - [`SubscriptionHandle`]: close, close hooks and progress waits.
//!
//! # Usage
//!
//! ```rust,ignore
//! let coordinator = SubscriptionCoordinator::for_store(store, Default::default(), Handle::current());
//! let (observer, mut events) = ChannelObserver::channel();
//! let handle = coordinator.subscribe(
//!     SubscriptionRequest::follow(vec![FactSpec::ns("orders")]),
//!     Arc::new(observer),
//! );
//! handle.await_catchup(Some(Duration::from_secs(5))).await?;
//! ```

mod condensed;
mod coordinator;
mod error;
mod fast_forward;
mod handle;
mod observer;
mod query;
mod transform;

#[cfg(test)]
mod testing;

pub use condensed::{CondensedQueryExecutor, ConnectedCheck, InterestSet, TargetQuery};
pub use coordinator::{CoordinatorSettings, SubscriptionCoordinator};
pub use error::{BoxError, SubscriptionError, TransformError};
pub use fast_forward::{FastForwardTarget, DEFAULT_FAST_FORWARD_MAX_AGE};
pub use handle::{SubscriptionHandle, SubscriptionProgress, SubscriptionState};
pub use observer::{ChannelObserver, SubscriptionEvent, SubscriptionObserver};
pub use query::{QueryCursor, QueryParts, RunStats, SynchronizedQuery};
pub use transform::{FactTransformer, IdentityTransformer};
