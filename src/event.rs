//! Inbound event records and the wire schema of broker-pushed event frames.
//!
//! The broker pushes one JSON object per event message. This module turns
//! that body into an immutable [`InboundEvent`] that the dispatch path
//! consumes exactly once. No network I/O happens here.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque, broker-assigned event identifier.
///
/// The hosted backend renders its 128-bit identifiers as strings such as
/// `"000001588bce5f44-0242ac1101020002"`; the client never interprets them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EventId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Event metadata handed to handlers alongside the decoded payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique event identifier.
    pub id: EventId,
    /// Identifier of the entity that emitted the event.
    pub entity_id: String,
    /// Short entity type name (last `/`-separated segment of the wire type).
    pub entity_type: String,
    /// Event type name.
    pub event_type: String,
    /// Partition key. Events sharing `(entity_type, swimlane)` are handled
    /// in arrival order by the swimlane dispatcher.
    pub swimlane: u32,
    /// Broker offset of the event within its partition.
    pub offset: u64,
    /// Broker event token. Passed back as the triggering event when a
    /// handler issues follow-up commands.
    pub event_token: String,
}

/// Immutable snapshot of one broker-pushed event message.
///
/// Created by the subscription's receive loop when a frame is parsed and
/// read-only afterward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    /// Event metadata.
    pub metadata: EventMetadata,
    /// Serialized (JSON) event payload, exactly as received.
    pub payload: String,
    /// Broker delivery token used to acknowledge this message.
    pub ack_token: String,
    /// Zero-based arrival position within its subscription.
    pub sequence: u64,
}

impl InboundEvent {
    /// Returns the event identifier.
    pub fn id(&self) -> &EventId {
        &self.metadata.id
    }
}

/// JSON body of an event message as pushed by the broker.
///
/// Field names follow the broker's camelCase wire schema. `event_data` is
/// itself a JSON document serialized into a string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEvent {
    /// Unique event identifier.
    pub id: EventId,
    /// Event type name.
    pub event_type: String,
    /// Serialized event payload.
    #[serde(default)]
    pub event_data: String,
    /// Identifier of the emitting entity.
    pub entity_id: String,
    /// Fully-qualified entity type (e.g. `net.example.accounts/Account`).
    pub entity_type: String,
    /// Broker event token.
    #[serde(default)]
    pub event_token: String,
    /// Partition key.
    #[serde(default)]
    pub swimlane: u32,
    /// Partition offset.
    #[serde(default)]
    pub offset: u64,
}

/// Strip any `/`-separated namespace from a wire entity type.
///
/// # Examples
///
/// ```
/// use eventuate_client::event::short_entity_type;
///
/// assert_eq!(short_entity_type("net.example.accounts/Account"), "Account");
/// assert_eq!(short_entity_type("Account"), "Account");
/// ```
pub fn short_entity_type(entity_type: &str) -> &str {
    entity_type.rsplit('/').next().unwrap_or(entity_type)
}

impl WireEvent {
    /// Convert the wire body into an [`InboundEvent`] at the given arrival
    /// position, tagged with the frame's broker delivery token.
    pub fn into_inbound(self, ack_token: String, sequence: u64) -> InboundEvent {
        let entity_type = short_entity_type(&self.entity_type).to_string();
        InboundEvent {
            metadata: EventMetadata {
                id: self.id,
                entity_id: self.entity_id,
                entity_type,
                event_type: self.event_type,
                swimlane: self.swimlane,
                offset: self.offset,
                event_token: self.event_token,
            },
            payload: self.event_data,
            ack_token,
            sequence,
        }
    }
}

/// Parse an event message body into an [`InboundEvent`].
///
/// # Errors
///
/// Returns `serde_json::Error` if the body is not a valid [`WireEvent`].
pub(crate) fn decode_frame_body(
    body: &[u8],
    ack_token: String,
    sequence: u64,
) -> serde_json::Result<InboundEvent> {
    let wire: WireEvent = serde_json::from_slice(body)?;
    Ok(wire.into_inbound(ack_token, sequence))
}
