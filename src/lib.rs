//! Event-sourcing client core: ordered, swimlane-aware dispatch of
//! broker-pushed events with cumulative, in-order acknowledgment.

mod client;
pub use client::{Client, ClientBuilder};
mod config;
mod dispatcher;
mod dispatching;
mod error;
pub mod event;
mod registry;
pub mod settlement;
mod subscription;
mod swimlane;
pub mod transport;

pub use config::{
    Credentials, DispatchStrategy, Durability, InitialPosition, SubscriberOptions,
    SubscriptionConfig,
};
pub use dispatcher::{DirectDispatcher, Dispatcher};
pub use dispatching::DispatchingSubscription;
pub use error::{ConfigError, SettlementError, SubscriptionError, TransportError};
pub use event::{EventId, EventMetadata, InboundEvent, WireEvent};
pub use registry::{EventHandler, HandlerRegistry};
pub use settlement::{Next, Outcome, Settlement, when_all};
pub use subscription::{Subscription, SubscriptionState};
pub use swimlane::SwimlaneDispatcher;
pub use transport::{Frame, FrameStream, InMemoryTransport, SubscriptionRequest, Transport};
