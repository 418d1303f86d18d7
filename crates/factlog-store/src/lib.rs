//! Append-only fact log on SQLite.
//!
//! This crate owns everything that touches the `fact` table:
//!
//! - [`FactLog`]: the narrow storage seam the subscription engine reads
//!   through (append, ordered scan, highest serial).
//! - [`FactStore`]: the SQLite implementation plus the publish API, plain
//!   and compare-and-swap.
//! - [`NamespaceLockManager`]: stable per-namespace lock codes and ordered,
//!   deadlock-free lock acquisition.
//! - [`StateTokenStore`]: issue, resolve and compact state tokens.
//! - [`InsertNotifier`]: typed "something was appended" signals.
//! - [`FactMatcher`]: post-query predicate evaluation.
//!
//! # Usage
//!
//! ```rust,ignore
//! use factlog_store::FactStore;
//! use factlog_types::{Fact, FactSpec};
//!
//! let store = FactStore::open("facts.db", Default::default())?;
//! let token = store.state_for(vec![FactSpec::ns("orders")])?;
//! let applied = store.publish_if_unchanged(
//!     vec![Fact::new("orders", "placed")],
//!     Some(token.token),
//! )?;
//! ```

mod cancel;
mod error;
mod fact_log;
mod facts;
mod locks;
mod matcher;
mod notify;
mod store;
mod tokens;

pub use cancel::{ArmedStatement, StatementCancel};
pub use error::StoreError;
pub use fact_log::{FactLog, HighWater, ScanFlow, ScanRequest};
pub use locks::{plan_lock_order, LockMode, NamespaceLockManager, NamespaceLocks, WILDCARD_LOCK_CODE};
pub use matcher::{FactMatcher, MatchError, SpecMatcher};
pub use notify::{InsertListener, InsertNotifier, ListenerId};
pub use store::FactStore;
pub use tokens::StateTokenStore;

#[cfg(test)]
mod tests;
