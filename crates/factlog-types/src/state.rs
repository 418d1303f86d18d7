//! Compare-and-swap basis captured by a reader.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::FactSpec;

/// A snapshot of "what the log looked like" for a set of specs.
///
/// Tokens are values: once issued they never change. A token that has been
/// invalidated or compacted away simply fails any compare-and-swap that
/// names it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateToken {
    /// Opaque token id handed back to the caller.
    pub token: Uuid,
    /// Specs the snapshot was taken for.
    pub specs: Vec<FactSpec>,
    /// Serial of the newest fact matching `specs` at snapshot time, `0` if
    /// none matched.
    pub serial_of_last_matching_fact: i64,
    /// When the token was issued.
    pub created_at: DateTime<Utc>,
}

impl StateToken {
    /// Returns `true` if any of the token's specs reads every namespace.
    pub fn reads_wildcard(&self) -> bool {
        self.specs.iter().any(FactSpec::is_wildcard)
    }

    /// Distinct namespaces referenced by the token's specs, wildcard
    /// excluded.
    pub fn namespaces(&self) -> Vec<&str> {
        let mut namespaces: Vec<&str> = self
            .specs
            .iter()
            .filter(|spec| !spec.is_wildcard())
            .map(|spec| spec.ns.as_str())
            .collect();
        namespaces.sort_unstable();
        namespaces.dedup();
        namespaces
    }
}
