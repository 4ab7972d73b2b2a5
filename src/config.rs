//! Client configuration: API credentials, subscriber options, and the
//! buffer sizes of the subscription pipeline.

use std::fmt;

use crate::error::ConfigError;
use crate::swimlane::DEFAULT_LANE_CAPACITY;

/// Environment variable holding the API key id.
pub const API_KEY_ID_ENV: &str = "EVENTUATE_API_KEY_ID";

/// Environment variable holding the API key secret.
pub const API_KEY_SECRET_ENV: &str = "EVENTUATE_API_KEY_SECRET";

/// Space used when none is given.
pub const DEFAULT_SPACE: &str = "default";

/// API credentials and the space subscriptions are scoped to.
///
/// The secret is redacted from the `Debug` output.
///
/// # Examples
///
/// ```
/// use eventuate_client::Credentials;
///
/// let credentials = Credentials::new("key-id", "key-secret", "").unwrap();
/// assert_eq!(credentials.space(), "default");
/// assert!(!format!("{credentials:?}").contains("key-secret"));
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    api_key_id: String,
    api_key_secret: String,
    space: String,
}

impl Credentials {
    /// Build credentials from explicit values.
    ///
    /// An empty `space` falls back to [`DEFAULT_SPACE`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingCredentials`] naming every empty key
    /// parameter.
    pub fn new(
        api_key_id: impl Into<String>,
        api_key_secret: impl Into<String>,
        space: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let api_key_id = api_key_id.into();
        let api_key_secret = api_key_secret.into();
        let mut space = space.into();

        let mut missing = Vec::new();
        if api_key_id.is_empty() {
            missing.push("api_key_id");
        }
        if api_key_secret.is_empty() {
            missing.push("api_key_secret");
        }
        if !missing.is_empty() {
            return Err(ConfigError::MissingCredentials(missing));
        }
        if space.is_empty() {
            space = DEFAULT_SPACE.to_string();
        }

        Ok(Self {
            api_key_id,
            api_key_secret,
            space,
        })
    }

    /// Read the key pair from [`API_KEY_ID_ENV`] and [`API_KEY_SECRET_ENV`],
    /// using the default space.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingCredentials`] if either variable is
    /// unset or empty.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with_space(DEFAULT_SPACE)
    }

    /// Read the key pair from the environment, scoped to `space`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingCredentials`] if either variable is
    /// unset or empty.
    pub fn from_env_with_space(space: &str) -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok(), space)
    }

    /// Read the key pair through `lookup`, which maps a variable name to
    /// its value.
    pub(crate) fn from_lookup<F>(lookup: F, space: &str) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::new(
            lookup(API_KEY_ID_ENV).unwrap_or_default(),
            lookup(API_KEY_SECRET_ENV).unwrap_or_default(),
            space,
        )
    }

    /// Returns the API key id.
    pub fn api_key_id(&self) -> &str {
        &self.api_key_id
    }

    /// Returns the API key secret.
    pub fn api_key_secret(&self) -> &str {
        &self.api_key_secret
    }

    /// Returns the space.
    pub fn space(&self) -> &str {
        &self.space
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key_id", &self.api_key_id)
            .field("api_key_secret", &"<redacted>")
            .field("space", &self.space)
            .finish()
    }
}

/// Whether the broker keeps a subscriber's position while it is offline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Durability {
    /// Position survives disconnects.
    #[default]
    Durable,
    /// Position is dropped on disconnect.
    Transient,
}

/// Where a new subscriber starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InitialPosition {
    /// From the oldest retained event.
    #[default]
    Beginning,
    /// From events published after subscribing.
    End,
}

/// Broker-side subscriber options, passed through to the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriberOptions {
    /// Default: [`Durability::Durable`].
    pub durability: Durability,
    /// Default: [`InitialPosition::Beginning`].
    pub read_from: InitialPosition,
    /// Ask the broker for progress notifications. Default: `false`.
    pub progress_notifications: bool,
}

/// How a dispatching subscription runs handlers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DispatchStrategy {
    /// Invoke each handler as soon as its event is read.
    #[default]
    Direct,
    /// Serialize handlers per `(entity type, swimlane)`.
    Swimlane,
}

/// Buffer sizes of the subscription pipeline.
///
/// # Examples
///
/// ```
/// use eventuate_client::SubscriptionConfig;
///
/// let config = SubscriptionConfig {
///     lane_capacity: 4,
///     ..SubscriptionConfig::default()
/// };
/// assert_eq!(config.incoming_capacity, 1);
/// ```
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// Capacity of the channel between the receive loop and the reader.
    ///
    /// While it is full the receive loop stops pulling frames, which in
    /// turn holds back the broker. Zero is raised to one.
    ///
    /// Default: 1.
    pub incoming_capacity: usize,

    /// Capacity of each swimlane queue. A full lane stalls dispatch of
    /// further events for that lane only.
    ///
    /// Default: 16.
    pub lane_capacity: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            incoming_capacity: 1,
            lane_capacity: DEFAULT_LANE_CAPACITY,
        }
    }
}
