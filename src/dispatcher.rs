//! Event dispatch: one inbound event in, one handler settlement out.
//!
//! [`DirectDispatcher`] runs the handler in the caller's flow.
//! [`SwimlaneDispatcher`](crate::SwimlaneDispatcher) serializes handlers per
//! `(entity type, swimlane)` on top of it.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::SettlementError;
use crate::event::InboundEvent;
use crate::registry::HandlerRegistry;
use crate::settlement::{Settlement, panic_message};

/// Strategy that turns one inbound event into exactly one handler
/// invocation.
///
/// `dispatch` is async so a strategy may apply backpressure to the caller
/// (the swimlane strategy waits for queue space). The returned settlement
/// represents the handler's eventual outcome.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Dispatch `event` and return its outcome cell.
    async fn dispatch(&self, event: InboundEvent) -> Settlement<Value>;
}

/// Invokes the registered handler immediately in the calling flow.
#[derive(Debug, Clone)]
pub struct DirectDispatcher {
    registry: Arc<HandlerRegistry>,
}

impl DirectDispatcher {
    /// Create a dispatcher over `registry`.
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }

    /// Returns the registry this dispatcher reads from.
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Look up and invoke the handler for `event` without awaiting it.
    ///
    /// # Returns
    ///
    /// Whatever settlement the handler produced, or a pre-settled failure:
    /// * [`SettlementError::NotRegistered`] if no handler matches (nothing
    ///   is invoked).
    /// * [`SettlementError::Decode`] if the payload is not valid JSON.
    /// * [`SettlementError::Panicked`] if the handler panicked.
    pub fn dispatch_now(&self, event: InboundEvent) -> Settlement<Value> {
        let InboundEvent {
            metadata, payload, ..
        } = event;

        let Some(handler) = self
            .registry
            .lookup(&metadata.entity_type, &metadata.event_type)
        else {
            tracing::warn!(
                entity_type = %metadata.entity_type,
                event_type = %metadata.event_type,
                event_id = %metadata.id,
                "no handler registered"
            );
            return Settlement::failure(SettlementError::NotRegistered {
                entity_type: metadata.entity_type,
                event_type: metadata.event_type,
            });
        };

        let decoded = if payload.trim().is_empty() {
            Value::Null
        } else {
            match serde_json::from_str::<Value>(&payload) {
                Ok(value) => value,
                Err(e) => {
                    return Settlement::failure(SettlementError::Decode {
                        event_type: metadata.event_type,
                        reason: e.to_string(),
                    });
                }
            }
        };

        tracing::trace!(
            event_id = %metadata.id,
            entity_type = %metadata.entity_type,
            event_type = %metadata.event_type,
            "invoking handler"
        );
        match std::panic::catch_unwind(AssertUnwindSafe(|| handler(decoded, metadata))) {
            Ok(settlement) => settlement,
            Err(panic) => Settlement::failure(SettlementError::Panicked(panic_message(
                panic.as_ref(),
            ))),
        }
    }
}

#[async_trait]
impl Dispatcher for DirectDispatcher {
    async fn dispatch(&self, event: InboundEvent) -> Settlement<Value> {
        self.dispatch_now(event)
    }
}
