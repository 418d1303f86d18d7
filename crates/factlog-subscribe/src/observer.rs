//! Receivers of subscription output.

use factlog_types::Fact;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{BoxError, SubscriptionError};

/// Callbacks a subscription delivers into, always from one thread at a
/// time and in serial order.
pub trait SubscriptionObserver: Send + Sync {
    /// A matching fact. Returning an error fails the subscription.
    fn on_next(&self, fact: Fact) -> Result<(), BoxError>;

    /// History up to the connect-time head has been delivered.
    fn on_catchup(&self) {}

    /// The log has advanced past the subscriber's position without
    /// anything matching; `fact_id` is the newest fact.
    fn on_fast_forward(&self, _fact_id: Uuid) {}

    /// A non-continuous subscription has delivered everything.
    fn on_complete(&self) {}

    /// The subscription failed. Called at most once.
    fn on_error(&self, _error: &SubscriptionError) {}
}

/// Everything a [`ChannelObserver`] forwards.
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    Fact(Fact),
    Catchup,
    FastForward(Uuid),
    Complete,
    Error(String),
}

/// Observer that forwards every callback into an unbounded channel.
#[derive(Debug)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<SubscriptionEvent>,
}

impl ChannelObserver {
    /// Creates an observer and the receiving end of its channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SubscriptionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl SubscriptionObserver for ChannelObserver {
    fn on_next(&self, fact: Fact) -> Result<(), BoxError> {
        self.tx
            .send(SubscriptionEvent::Fact(fact))
            .map_err(|_| "subscription receiver dropped".into())
    }

    fn on_catchup(&self) {
        let _ = self.tx.send(SubscriptionEvent::Catchup);
    }

    fn on_fast_forward(&self, fact_id: Uuid) {
        let _ = self.tx.send(SubscriptionEvent::FastForward(fact_id));
    }

    fn on_complete(&self) {
        let _ = self.tx.send(SubscriptionEvent::Complete);
    }

    fn on_error(&self, error: &SubscriptionError) {
        let _ = self.tx.send(SubscriptionEvent::Error(error.to_string()));
    }
}
