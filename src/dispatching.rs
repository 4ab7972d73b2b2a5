//! Subscription that feeds every event through a [`Dispatcher`] and
//! resolves it for acknowledgment when the handler's settlement completes.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::dispatcher::Dispatcher;
use crate::error::{SettlementError, SubscriptionError};
use crate::settlement::{Settlement, panic_message};
use crate::subscription::{Subscription, SubscriptionState};

/// A [`Subscription`] with a background task dispatching its events.
///
/// Each event is resolved once its handler settlement completes, whether
/// it succeeded or not, so one failing handler never stalls
/// acknowledgment. Failures are reported on the error stream
/// ([`next_error`](Self::next_error)) as
/// [`SubscriptionError::Handler`].
pub struct DispatchingSubscription {
    subscription: Arc<Subscription>,
    task: Option<JoinHandle<()>>,
}

impl DispatchingSubscription {
    /// Start dispatching events read from `subscription`.
    pub(crate) fn start(subscription: Subscription, dispatcher: Arc<dyn Dispatcher>) -> Self {
        let subscription = Arc::new(subscription);
        let task = tokio::spawn(run_dispatch_loop(Arc::clone(&subscription), dispatcher));
        Self {
            subscription,
            task: Some(task),
        }
    }

    /// Returns the underlying subscription.
    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    /// Returns the subscription id.
    pub fn id(&self) -> Uuid {
        self.subscription.id()
    }

    /// Returns the subscription's lifecycle state.
    pub fn state(&self) -> SubscriptionState {
        self.subscription.state()
    }

    /// Returns `true` while events are being received.
    pub fn is_active(&self) -> bool {
        self.subscription.is_active()
    }

    /// Wait for the next error (bad frame, transport, handler, or ack).
    pub async fn next_error(&self) -> Option<SubscriptionError> {
        self.subscription.next_error().await
    }

    /// Number of received events not yet acknowledged.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::Closed`] after unsubscribing.
    pub async fn fetch_pending_count(&self) -> Result<usize, SubscriptionError> {
        self.subscription.fetch_pending_count().await
    }

    /// Stop receiving and cancel the subscription at the broker.
    ///
    /// Events already read are still dispatched and handlers already
    /// running are not interrupted; their completions are not acknowledged.
    /// See [`Subscription::unsubscribe`].
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::Transport`] if the broker rejects the
    /// unsubscribe.
    pub async fn unsubscribe(&self) -> Result<(), SubscriptionError> {
        self.subscription.unsubscribe().await
    }
}

impl Drop for DispatchingSubscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl fmt::Debug for DispatchingSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchingSubscription")
            .field("subscription", &self.subscription)
            .finish_non_exhaustive()
    }
}

async fn run_dispatch_loop(subscription: Arc<Subscription>, dispatcher: Arc<dyn Dispatcher>) {
    let resolver = subscription.resolver();

    while let Ok(event) = subscription.read_event().await {
        let event_id = event.id().clone();
        let settlement = match AssertUnwindSafe(dispatcher.dispatch(event))
            .catch_unwind()
            .await
        {
            Ok(settlement) => settlement,
            Err(panic) => Settlement::failure(SettlementError::Panicked(panic_message(
                panic.as_ref(),
            ))),
        };

        let resolver = resolver.clone();
        settlement.then(move |outcome| {
            resolver.complete(event_id, &outcome);
            Ok::<_, SettlementError>(())
        });
    }

    tracing::debug!(subscription_id = %subscription.id(), "dispatch loop stopped");
}
