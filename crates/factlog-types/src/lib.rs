//! Shared value types for the factlog workspace.
//!
//! This crate holds the records every other crate exchanges: the immutable
//! [`Fact`], the read predicate [`FactSpec`], the compare-and-swap basis
//! [`StateToken`], and the [`SubscriptionRequest`] callers hand to the
//! subscription coordinator. It performs no I/O.
//!
//! Serials are plain `i64` values assigned by the fact log at append time.
//! They are strictly increasing in append order and never reused; `0` is
//! the position "before the first fact".

mod fact;
mod spec;
mod state;
mod subscription;

pub use fact::Fact;
pub use spec::{AggregateIdProperty, FactSpec};
pub use state::StateToken;
pub use subscription::{StartingPoint, SubscriptionRequest};

/// The wildcard namespace. A spec on `*` matches facts of every namespace.
pub const WILDCARD_NS: &str = "*";

/// Returns `true` if `ns` is the wildcard namespace.
pub fn is_wildcard(ns: &str) -> bool {
    ns == WILDCARD_NS
}
