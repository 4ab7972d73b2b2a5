//! Crate-level error types for settlement outcomes, subscriptions, the
//! transport boundary, and client configuration.

use std::sync::Arc;

use crate::event::EventId;

/// Error carried in the error slot of a [`Settlement`](crate::Settlement).
///
/// Every reader of a settlement observes the same outcome, so this type is
/// `Clone`. Arbitrary handler errors are shared behind an [`Arc`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum SettlementError {
    /// No handler is registered for the event's `(entity type, event type)`.
    #[error("event handler for entity type/event type {entity_type} / {event_type} is not registered")]
    NotRegistered {
        /// Entity type of the undeliverable event.
        entity_type: String,
        /// Event type of the undeliverable event.
        event_type: String,
    },

    /// The event payload could not be decoded for the handler.
    #[error("cannot decode payload of {event_type} event: {reason}")]
    Decode {
        /// Event type whose payload failed to decode.
        event_type: String,
        /// Decoder message.
        reason: String,
    },

    /// The handler (or a continuation) reported a failure.
    #[error(transparent)]
    Handler(Arc<dyn std::error::Error + Send + Sync>),

    /// The handler (or a continuation) panicked.
    ///
    /// Carries the panic message when the payload was a string.
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// One or more inputs of [`when_all`](crate::settlement::when_all) failed.
    ///
    /// `failures` lists every failing input with its position in the
    /// original input order.
    #[error("{} of {total} settlements failed: {}", .failures.len(), describe_failures(.failures))]
    Joined {
        /// Number of joined settlements.
        total: usize,
        /// `(input index, error)` for each failed input.
        failures: Vec<(usize, SettlementError)>,
    },

    /// The swimlane worker that accepted the event stopped before running it.
    #[error("swimlane worker for {entity_type}/{swimlane} is no longer running")]
    LaneClosed {
        /// Entity type of the lane.
        entity_type: String,
        /// Swimlane number of the lane.
        swimlane: u32,
    },
}

impl SettlementError {
    /// Wrap an arbitrary error (or message) as a handler failure.
    ///
    /// # Examples
    ///
    /// ```
    /// use eventuate_client::SettlementError;
    ///
    /// let err = SettlementError::handler("inventory service unavailable");
    /// assert_eq!(err.to_string(), "inventory service unavailable");
    /// ```
    pub fn handler(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Handler(Arc::from(err.into()))
    }
}

fn describe_failures(failures: &[(usize, SettlementError)]) -> String {
    failures
        .iter()
        .map(|(index, err)| format!("#{index}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Error surfaced on a subscription's error stream or returned by its
/// control methods.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SubscriptionError {
    /// The broker pushed a frame that is not an event message.
    ///
    /// Recoverable: the receive loop skips the frame and continues.
    #[error("bad frame: {command}")]
    BadFrame {
        /// Frame command as reported by the transport.
        command: String,
    },

    /// An event message body could not be parsed.
    ///
    /// Recoverable: the receive loop skips the frame and continues.
    #[error("cannot decode event body: {0}")]
    Malformed(String),

    /// Connection-level failure. Fatal to the subscription instance.
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    /// A handler failed (or panicked) for the given event.
    ///
    /// The event is still resolved and acknowledged.
    #[error("handler failed for event {event_id}: {source}")]
    Handler {
        /// Identifier of the event whose handler failed.
        event_id: EventId,
        /// The settlement error produced by the handler.
        #[source]
        source: SettlementError,
    },

    /// The broker rejected an acknowledgment. The entry is not retried.
    #[error("acknowledgment {ack_token} rejected: {source}")]
    Ack {
        /// Broker delivery token that failed to acknowledge.
        ack_token: String,
        /// Transport error returned by the broker.
        #[source]
        source: TransportError,
    },

    /// The subscription has been closed.
    #[error("cannot read from a closed subscription")]
    Closed,
}

/// Error reported by a [`Transport`](crate::Transport) implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The connection to the broker is gone.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The broker refused the request.
    #[error("broker rejected request: {0}")]
    Rejected(String),
}

/// Error returned while assembling a [`Client`](crate::Client).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Required credential parameters were empty.
    #[error("credentials missing: {}", .0.join(", "))]
    MissingCredentials(Vec<&'static str>),

    /// [`ClientBuilder::build`](crate::ClientBuilder::build) was called
    /// without a transport.
    #[error("no transport configured")]
    MissingTransport,
}
