//! Handler registry keyed by `(entity type, event type)`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::SettlementError;
use crate::event::EventMetadata;
use crate::settlement::Settlement;

/// A registered event handler.
///
/// Receives the decoded JSON payload and the event metadata, and returns a
/// settlement that completes when the handler's work is done. Handlers may
/// return an already-settled cell or one that settles later.
pub type EventHandler = Arc<dyn Fn(Value, EventMetadata) -> Settlement<Value> + Send + Sync>;

/// Two-level map from entity type, then event type, to a handler.
///
/// Registering the same pair twice replaces the earlier handler. The
/// registry is populated before dispatch starts and treated as read-only
/// afterward; share it behind an [`Arc`].
///
/// # Examples
///
/// ```
/// use eventuate_client::{HandlerRegistry, Settlement};
///
/// let registry = HandlerRegistry::new()
///     .with_handler("Account", "AccountOpened", |_payload, _meta| {
///         Settlement::success(serde_json::Value::Null)
///     });
/// assert!(registry.contains("Account", "AccountOpened"));
/// ```
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, HashMap<String, EventHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `(entity_type, event_type)`, replacing any
    /// existing handler for the pair.
    pub fn register<F>(&mut self, entity_type: &str, event_type: &str, handler: F)
    where
        F: Fn(Value, EventMetadata) -> Settlement<Value> + Send + Sync + 'static,
    {
        self.handlers
            .entry(entity_type.to_string())
            .or_default()
            .insert(event_type.to_string(), Arc::new(handler));
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_handler<F>(mut self, entity_type: &str, event_type: &str, handler: F) -> Self
    where
        F: Fn(Value, EventMetadata) -> Settlement<Value> + Send + Sync + 'static,
    {
        self.register(entity_type, event_type, handler);
        self
    }

    /// Register a handler that receives a strongly-typed payload.
    ///
    /// The JSON payload is deserialized into `E` before the handler runs.
    /// A payload that does not fit `E` fails the event with
    /// [`SettlementError::Decode`] and the handler is not called.
    pub fn register_typed<E, F>(&mut self, entity_type: &str, event_type: &str, handler: F)
    where
        E: DeserializeOwned + 'static,
        F: Fn(E, EventMetadata) -> Settlement<Value> + Send + Sync + 'static,
    {
        self.register(entity_type, event_type, move |payload, metadata| {
            match serde_json::from_value::<E>(payload) {
                Ok(event) => handler(event, metadata),
                Err(e) => Settlement::failure(SettlementError::Decode {
                    event_type: metadata.event_type,
                    reason: e.to_string(),
                }),
            }
        });
    }

    /// Look up the handler for `(entity_type, event_type)`.
    pub fn lookup(&self, entity_type: &str, event_type: &str) -> Option<EventHandler> {
        self.handlers
            .get(entity_type)
            .and_then(|by_event| by_event.get(event_type))
            .cloned()
    }

    /// Returns `true` if a handler is registered for the pair.
    pub fn contains(&self, entity_type: &str, event_type: &str) -> bool {
        self.handlers
            .get(entity_type)
            .is_some_and(|by_event| by_event.contains_key(event_type))
    }

    /// Group registered event types by entity type, for subscribe requests.
    ///
    /// Both levels come back sorted so the request body is deterministic.
    pub fn entity_event_groups(&self) -> BTreeMap<String, Vec<String>> {
        self.handlers
            .iter()
            .map(|(entity_type, by_event)| {
                let mut event_types: Vec<String> = by_event.keys().cloned().collect();
                event_types.sort();
                (entity_type.clone(), event_types)
            })
            .collect()
    }

    /// Total number of registered `(entity type, event type)` pairs.
    pub fn len(&self) -> usize {
        self.handlers.values().map(HashMap::len).sum()
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.entity_event_groups())
            .finish()
    }
}
