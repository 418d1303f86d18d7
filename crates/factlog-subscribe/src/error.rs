//! Error types for subscriptions.

use factlog_store::{MatchError, StoreError};
use uuid::Uuid;

/// Boxed error returned by observers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that end a subscription or a wait on it.
#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    /// Reading the fact log failed.
    #[error("subscription store error: {0}")]
    Store(#[from] StoreError),

    /// Evaluating a spec against a fact failed.
    #[error("subscription predicate error: {0}")]
    Match(#[from] MatchError),

    /// A fact could not be brought to the requested version.
    #[error("subscription transformation error: {0}")]
    Transformation(#[from] TransformError),

    /// The observer rejected a fact.
    #[error("subscription observer failed: {0}")]
    Observer(BoxError),

    /// The fact named as starting point does not exist.
    #[error("unknown starting fact: {0}")]
    UnknownStartingFact(Uuid),

    /// A wait on the handle ran out of time.
    #[error("timed out waiting for subscription {0}")]
    Timeout(&'static str),

    /// The subscription was closed before the awaited point was reached.
    #[error("subscription closed")]
    Closed,

    /// The subscription failed; carries the original error's message.
    #[error("subscription failed: {0}")]
    Failed(String),
}

/// Errors raised by a [`FactTransformer`](crate::FactTransformer).
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransformError {
    /// No transformation path leads to any requested version.
    #[error("no transformation of fact {fact_id} ({ns}) from version {from} to {requested:?}")]
    Unavailable {
        /// The fact that could not be transformed.
        fact_id: Uuid,
        /// Its namespace.
        ns: String,
        /// The version it was published with.
        from: i32,
        /// Versions the subscription asked for.
        requested: Vec<i32>,
    },

    /// The transformation itself failed.
    #[error("transformation failed: {0}")]
    Failed(String),
}
