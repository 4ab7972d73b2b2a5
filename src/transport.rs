//! Broker transport boundary.
//!
//! A [`Transport`] opens a push stream of [`Frame`]s for a
//! [`SubscriptionRequest`], acknowledges delivered messages by their ack
//! token, and cancels subscriptions. Connection setup, handshake, and
//! framing live behind this trait.
//!
//! [`InMemoryTransport`] is an in-process broker for tests and demos.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, mpsc};
use tokio_stream::Stream;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use crate::config::SubscriberOptions;
use crate::error::TransportError;
use crate::event::WireEvent;

/// One frame pushed by the broker on a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// An event message.
    Message {
        /// Delivery token to acknowledge this message with.
        ack_token: String,
        /// JSON body, a [`WireEvent`].
        body: Vec<u8>,
    },
    /// Any other frame (receipt, error, heartbeat, ...).
    Other {
        /// Frame command name.
        command: String,
    },
}

impl Frame {
    /// Build a message frame carrying `event`.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if `event` cannot be serialized.
    pub fn message(ack_token: impl Into<String>, event: &WireEvent) -> serde_json::Result<Self> {
        Ok(Self::Message {
            ack_token: ack_token.into(),
            body: serde_json::to_vec(event)?,
        })
    }
}

/// Stream of frames for one subscription.
///
/// An `Err` item or the end of the stream means the connection is gone.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, TransportError>> + Send>>;

/// Subscription descriptor sent to the broker.
///
/// Serializes to the broker's camelCase destination document. The
/// subscription id and options travel outside the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    /// Client-side identity of this subscription.
    #[serde(skip)]
    pub subscription_id: Uuid,
    /// Entity type to subscribed event types.
    pub entity_types_and_events: BTreeMap<String, Vec<String>>,
    /// Durable subscriber name.
    pub subscriber_id: String,
    /// Space the subscription is scoped to.
    pub space: String,
    /// Broker-side subscriber options.
    #[serde(skip)]
    pub options: SubscriberOptions,
}

impl SubscriptionRequest {
    /// Create a request with a fresh subscription id.
    pub fn new(
        subscriber_id: impl Into<String>,
        entity_types_and_events: BTreeMap<String, Vec<String>>,
        space: impl Into<String>,
        options: SubscriberOptions,
    ) -> Self {
        Self {
            subscription_id: Uuid::new_v4(),
            entity_types_and_events,
            subscriber_id: subscriber_id.into(),
            space: space.into(),
            options,
        }
    }
}

/// Message-queue transport consumed by subscriptions.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a subscription and return its frame stream.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the broker refuses the subscription
    /// or cannot be reached.
    async fn subscribe(&self, request: &SubscriptionRequest) -> Result<FrameStream, TransportError>;

    /// Acknowledge the message delivered with `ack_token`.
    async fn ack(&self, ack_token: &str) -> Result<(), TransportError>;

    /// Cancel the subscription opened with `request`.
    async fn unsubscribe(&self, request: &SubscriptionRequest) -> Result<(), TransportError>;
}

type FrameResult = Result<Frame, TransportError>;

#[derive(Default)]
struct BrokerState {
    feed: Option<mpsc::UnboundedSender<FrameResult>>,
    backlog: Vec<FrameResult>,
    next_ack: u64,
    requests: Vec<SubscriptionRequest>,
    acked: Vec<String>,
    rejected_acks: HashSet<String>,
    fail_unsubscribe: bool,
    unsubscribed: Vec<Uuid>,
}

#[derive(Default)]
struct Broker {
    state: Mutex<BrokerState>,
    acked: Notify,
}

/// In-process broker.
///
/// Feeds one subscription at a time: frames pushed before `subscribe` are
/// held back and delivered once it opens, and a new `subscribe` replaces
/// the previous feed. Successful acks are recorded in order.
///
/// `Clone` is cheap; clones share the broker.
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    broker: Arc<Broker>,
}

impl InMemoryTransport {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Push `event` as a message frame and return its ack token.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if `event` cannot be serialized.
    pub fn publish(&self, event: &WireEvent) -> serde_json::Result<String> {
        let mut state = self.state();
        let ack_token = format!("ack-{}", state.next_ack);
        state.next_ack += 1;
        let frame = Frame::message(ack_token.clone(), event)?;
        push(&mut state, Ok(frame));
        Ok(ack_token)
    }

    /// Push an arbitrary frame.
    pub fn push_frame(&self, frame: Frame) {
        push(&mut self.state(), Ok(frame));
    }

    /// Fail the open feed with a connection error and close it.
    pub fn sever(&self, reason: &str) {
        let mut state = self.state();
        if let Some(feed) = state.feed.take() {
            let _ = feed.send(Err(TransportError::ConnectionLost(reason.to_string())));
        }
    }

    /// Make acks for `ack_token` fail with [`TransportError::Rejected`].
    pub fn reject_ack(&self, ack_token: &str) {
        self.state().rejected_acks.insert(ack_token.to_string());
    }

    /// Make every following `unsubscribe` fail (or succeed again).
    pub fn fail_unsubscribe(&self, fail: bool) {
        self.state().fail_unsubscribe = fail;
    }

    /// Requests received by `subscribe`, oldest first.
    pub fn requests(&self) -> Vec<SubscriptionRequest> {
        self.state().requests.clone()
    }

    /// Ack tokens acknowledged so far, in acknowledgment order.
    pub fn acked_tokens(&self) -> Vec<String> {
        self.state().acked.clone()
    }

    /// Subscription ids successfully unsubscribed.
    pub fn unsubscribed(&self) -> Vec<Uuid> {
        self.state().unsubscribed.clone()
    }

    /// Wait until at least `count` acks have been recorded and return them.
    pub async fn wait_for_acks(&self, count: usize) -> Vec<String> {
        loop {
            let notified = self.broker.acked.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.state();
                if state.acked.len() >= count {
                    return state.acked.clone();
                }
            }
            notified.await;
        }
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.broker
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn push(state: &mut BrokerState, frame: FrameResult) {
    match &state.feed {
        Some(feed) => {
            if let Err(returned) = feed.send(frame) {
                // Subscriber is gone; hold the frame for the next one.
                state.feed = None;
                state.backlog.push(returned.0);
            }
        }
        None => state.backlog.push(frame),
    }
}

impl fmt::Debug for InMemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("InMemoryTransport")
            .field("subscribed", &state.feed.is_some())
            .field("backlog", &state.backlog.len())
            .field("acked", &state.acked.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn subscribe(&self, request: &SubscriptionRequest) -> Result<FrameStream, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state();
        for frame in state.backlog.drain(..) {
            // The receiver is alive in this scope.
            let _ = tx.send(frame);
        }
        state.feed = Some(tx);
        state.requests.push(request.clone());
        tracing::debug!(
            subscription_id = %request.subscription_id,
            subscriber_id = %request.subscriber_id,
            "in-memory broker: subscribed"
        );
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn ack(&self, ack_token: &str) -> Result<(), TransportError> {
        {
            let mut state = self.state();
            if state.rejected_acks.contains(ack_token) {
                return Err(TransportError::Rejected(format!("unknown ack token {ack_token}")));
            }
            state.acked.push(ack_token.to_string());
        }
        self.broker.acked.notify_waiters();
        Ok(())
    }

    async fn unsubscribe(&self, request: &SubscriptionRequest) -> Result<(), TransportError> {
        let mut state = self.state();
        if state.fail_unsubscribe {
            return Err(TransportError::Rejected(format!(
                "cannot unsubscribe {}",
                request.subscription_id
            )));
        }
        state.feed = None;
        state.unsubscribed.push(request.subscription_id);
        Ok(())
    }
}
