//! Client entry point: opens subscriptions against a broker transport.
//!
//! [`Client::subscribe`] derives the subscription filter from a
//! [`HandlerRegistry`], opens the subscription, and starts dispatching with
//! the chosen [`DispatchStrategy`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::config::{Credentials, DispatchStrategy, SubscriberOptions, SubscriptionConfig};
use crate::dispatcher::{DirectDispatcher, Dispatcher};
use crate::dispatching::DispatchingSubscription;
use crate::error::{ConfigError, SubscriptionError};
use crate::registry::HandlerRegistry;
use crate::subscription::Subscription;
use crate::swimlane::SwimlaneDispatcher;
use crate::transport::{SubscriptionRequest, Transport};

/// Handle for opening subscriptions.
///
/// `Clone` is cheap: the transport is shared behind an [`Arc`].
///
/// # Examples
///
/// ```
/// use eventuate_client::{Client, Credentials, InMemoryTransport};
///
/// let client = Client::builder()
///     .transport(InMemoryTransport::new())
///     .credentials(Credentials::new("key-id", "key-secret", "").unwrap())
///     .build()
///     .unwrap();
/// assert_eq!(client.credentials().space(), "default");
/// ```
#[derive(Clone)]
pub struct Client {
    transport: Arc<dyn Transport>,
    credentials: Credentials,
    config: SubscriptionConfig,
}

impl Client {
    /// Start building a client.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Returns the credentials this client was built with.
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Returns the subscription pipeline configuration.
    pub fn subscription_config(&self) -> &SubscriptionConfig {
        &self.config
    }

    /// Subscribe to every `(entity type, event type)` registered in
    /// `registry` and dispatch the events to its handlers.
    ///
    /// # Arguments
    ///
    /// * `subscriber_id` - Durable subscriber name.
    /// * `registry` - Handlers; also determines the subscription filter.
    /// * `options` - Broker-side subscriber options.
    /// * `strategy` - Run handlers directly, or serialized per swimlane.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::Transport`] if the broker subscribe
    /// call fails.
    pub async fn subscribe(
        &self,
        subscriber_id: &str,
        registry: impl Into<Arc<HandlerRegistry>>,
        options: SubscriberOptions,
        strategy: DispatchStrategy,
    ) -> Result<DispatchingSubscription, SubscriptionError> {
        let registry = registry.into();
        let subscription = self
            .subscribe_raw(subscriber_id, registry.entity_event_groups(), options)
            .await?;

        let dispatcher: Arc<dyn Dispatcher> = match strategy {
            DispatchStrategy::Direct => Arc::new(DirectDispatcher::new(registry)),
            DispatchStrategy::Swimlane => Arc::new(SwimlaneDispatcher::with_capacity(
                registry,
                self.config.lane_capacity,
            )),
        };
        tracing::debug!(
            subscription_id = %subscription.id(),
            strategy = ?strategy,
            "starting dispatch"
        );
        Ok(DispatchingSubscription::start(subscription, dispatcher))
    }

    /// Subscribe without dispatching; read events with
    /// [`Subscription::read_event`] and confirm them with
    /// [`Subscription::acknowledge_event`].
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::Transport`] if the broker subscribe
    /// call fails.
    pub async fn subscribe_raw(
        &self,
        subscriber_id: &str,
        entity_types_and_events: BTreeMap<String, Vec<String>>,
        options: SubscriberOptions,
    ) -> Result<Subscription, SubscriptionError> {
        let request = SubscriptionRequest::new(
            subscriber_id,
            entity_types_and_events,
            self.credentials.space(),
            options,
        );
        Subscription::open(Arc::clone(&self.transport), request, &self.config).await
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("credentials", &self.credentials)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Builder for a [`Client`].
///
/// A transport is required. Credentials default to
/// [`Credentials::from_env`].
#[derive(Default)]
pub struct ClientBuilder {
    transport: Option<Arc<dyn Transport>>,
    credentials: Option<Credentials>,
    space: Option<String>,
    config: SubscriptionConfig,
}

impl ClientBuilder {
    /// Create a builder with no transport and default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the broker transport.
    pub fn transport(mut self, transport: impl Transport) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Set explicit credentials instead of reading the environment.
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Override the space of the credentials.
    pub fn space(mut self, space: impl Into<String>) -> Self {
        self.space = Some(space.into());
        self
    }

    /// Set the subscription pipeline configuration.
    pub fn subscription_config(mut self, config: SubscriptionConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the client.
    ///
    /// # Errors
    ///
    /// * [`ConfigError::MissingTransport`] if no transport was set.
    /// * [`ConfigError::MissingCredentials`] if no credentials were set and
    ///   the environment does not provide them.
    pub fn build(self) -> Result<Client, ConfigError> {
        let transport = self.transport.ok_or(ConfigError::MissingTransport)?;
        let mut credentials = match self.credentials {
            Some(credentials) => credentials,
            None => Credentials::from_env()?,
        };
        if let Some(space) = self.space {
            credentials = Credentials::new(
                credentials.api_key_id(),
                credentials.api_key_secret(),
                space,
            )?;
        }

        Ok(Client {
            transport,
            credentials,
            config: self.config,
        })
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("has_transport", &self.transport.is_some())
            .field("credentials", &self.credentials)
            .field("space", &self.space)
            .field("config", &self.config)
            .finish()
    }
}
