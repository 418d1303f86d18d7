//! Subscription requests.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::FactSpec;

/// Where a subscription starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartingPoint {
    /// Deliver facts with a serial greater than this one.
    Serial(i64),
    /// Deliver facts appended after the fact with this id.
    FactId(Uuid),
}

/// Everything the coordinator needs to open a subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    /// Predicates; a fact is delivered if any of them matches.
    pub specs: Vec<FactSpec>,
    /// Resume position. `None` reads the log from the beginning.
    pub starting_after: Option<StartingPoint>,
    /// Keep following the log after catch-up.
    pub continuous: bool,
    /// Skip history entirely and only see facts appended after connect.
    pub ephemeral: bool,
    /// Debounce window for follow-mode re-queries. `None` uses the
    /// coordinator default; zero re-queries on every signal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_follow_delay: Option<Duration>,
    /// Free-form label used in logs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_info: Option<String>,
}

impl SubscriptionRequest {
    /// A non-continuous request that reads history and completes.
    pub fn catchup(specs: Vec<FactSpec>) -> Self {
        Self {
            specs,
            starting_after: None,
            continuous: false,
            ephemeral: false,
            max_follow_delay: None,
            debug_info: None,
        }
    }

    /// A request that reads history and then follows the log.
    pub fn follow(specs: Vec<FactSpec>) -> Self {
        Self {
            continuous: true,
            ..Self::catchup(specs)
        }
    }

    /// A request that only sees facts appended after connecting.
    pub fn ephemeral(specs: Vec<FactSpec>) -> Self {
        Self {
            continuous: true,
            ephemeral: true,
            ..Self::catchup(specs)
        }
    }

    pub fn starting_after(mut self, start: StartingPoint) -> Self {
        self.starting_after = Some(start);
        self
    }

    pub fn max_follow_delay(mut self, delay: Duration) -> Self {
        self.max_follow_delay = Some(delay);
        self
    }

    pub fn debug_info(mut self, info: impl Into<String>) -> Self {
        self.debug_info = Some(info.into());
        self
    }
}
