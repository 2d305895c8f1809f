//! Client configuration and builder.

use std::time::Duration;

use uuid::Uuid;

use crate::core::{CHALLENGE_FALLBACK, GatewayError};
use crate::frame::ClientInfo;
use crate::session::{BackoffPolicy, HandshakeConfig, SessionConfig};

/// Default gateway endpoint.
pub const DEFAULT_GATEWAY_URL: &str = "ws://127.0.0.1:18789";

/// Gateway client configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayClientConfig {
    /// Gateway WebSocket URL (`ws://` or `wss://`).
    pub url: String,

    /// Identity, credentials, and protocol range sent on connect.
    pub handshake: HandshakeConfig,

    /// How long to wait for a challenge before connecting without a nonce.
    pub challenge_timeout: Duration,

    /// Reconnect policy.
    pub backoff: BackoffPolicy,
}

impl Default for GatewayClientConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_GATEWAY_URL.into(),
            handshake: HandshakeConfig::new(default_client_info()),
            challenge_timeout: CHALLENGE_FALLBACK,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl GatewayClientConfig {
    /// Check the configuration for values the gateway would refuse.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(GatewayError::Config(format!(
                "gateway url must use ws:// or wss://, got {:?}",
                self.url
            )));
        }
        if self.handshake.client.id.trim().is_empty() {
            return Err(GatewayError::Config("client id must not be empty".into()));
        }
        if self.handshake.role.trim().is_empty() {
            return Err(GatewayError::Config("role must not be empty".into()));
        }
        if self.handshake.min_protocol > self.handshake.max_protocol {
            return Err(GatewayError::Config(format!(
                "min protocol {} exceeds max protocol {}",
                self.handshake.min_protocol, self.handshake.max_protocol
            )));
        }
        if self.backoff.floor_ms == 0 || self.backoff.ceiling_ms < self.backoff.floor_ms {
            return Err(GatewayError::Config(
                "backoff floor must be non-zero and not exceed the ceiling".into(),
            ));
        }
        Ok(())
    }

    /// Session-layer view of this configuration.
    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            handshake: self.handshake.clone(),
            backoff: self.backoff,
            challenge_timeout: self.challenge_timeout,
        }
    }
}

fn default_client_info() -> ClientInfo {
    ClientInfo {
        id: env!("CARGO_PKG_NAME").into(),
        display_name: None,
        version: env!("CARGO_PKG_VERSION").into(),
        platform: std::env::consts::OS.into(),
        mode: "cli".into(),
        instance_id: Some(Uuid::new_v4().to_string()),
    }
}

/// Builder for [`GatewayClientConfig`].
#[derive(Debug, Default)]
pub struct GatewayClientBuilder {
    config: GatewayClientConfig,
}

impl GatewayClientBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder seeded from `GATEWAY_*` environment variables.
    ///
    /// Reads `GATEWAY_URL`, `GATEWAY_TOKEN`, `GATEWAY_PASSWORD`,
    /// `GATEWAY_ROLE`, `GATEWAY_SCOPES` (comma-separated),
    /// `GATEWAY_CLIENT_ID`, and `GATEWAY_LOCALE`. Unset or empty variables
    /// keep their defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`GatewayClientBuilder::from_env`], with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let mut builder = Self::new();
        if let Some(url) = get("GATEWAY_URL") {
            builder = builder.url(url);
        }
        if let Some(token) = get("GATEWAY_TOKEN") {
            builder = builder.token(token);
        }
        if let Some(password) = get("GATEWAY_PASSWORD") {
            builder = builder.password(password);
        }
        if let Some(role) = get("GATEWAY_ROLE") {
            builder = builder.role(role);
        }
        if let Some(scopes) = get("GATEWAY_SCOPES") {
            builder = builder.scopes(
                scopes
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_owned),
            );
        }
        if let Some(id) = get("GATEWAY_CLIENT_ID") {
            builder = builder.client_id(id);
        }
        if let Some(locale) = get("GATEWAY_LOCALE") {
            builder = builder.locale(locale);
        }
        builder
    }

    /// Set the gateway URL.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.config.url = url.into();
        self
    }

    /// Set the client identifier.
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.config.handshake.client.id = id.into();
        self
    }

    /// Set the client version.
    pub fn client_version(mut self, version: impl Into<String>) -> Self {
        self.config.handshake.client.version = version.into();
        self
    }

    /// Set the client display name.
    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.config.handshake.client.display_name = Some(name.into());
        self
    }

    /// Set the host platform.
    pub fn platform(mut self, platform: impl Into<String>) -> Self {
        self.config.handshake.client.platform = platform.into();
        self
    }

    /// Set the client mode.
    pub fn mode(mut self, mode: impl Into<String>) -> Self {
        self.config.handshake.client.mode = mode.into();
        self
    }

    /// Set the per-process instance id.
    pub fn instance_id(mut self, id: impl Into<String>) -> Self {
        self.config.handshake.client.instance_id = Some(id.into());
        self
    }

    /// Set the requested role.
    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.config.handshake.role = role.into();
        self
    }

    /// Replace the requested scopes.
    pub fn scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.handshake.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Set the shared bearer token.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.config.handshake.token = Some(token.into());
        self
    }

    /// Set the shared password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.handshake.password = Some(password.into());
        self
    }

    /// Set the user agent.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.handshake.user_agent = user_agent.into();
        self
    }

    /// Set the preferred locale.
    pub fn locale(mut self, locale: impl Into<String>) -> Self {
        self.config.handshake.locale = locale.into();
        self
    }

    /// Set the acceptable protocol range.
    pub fn protocol_range(mut self, min: u32, max: u32) -> Self {
        self.config.handshake.min_protocol = min;
        self.config.handshake.max_protocol = max;
        self
    }

    /// Set the challenge fallback window.
    pub fn challenge_timeout(mut self, timeout: Duration) -> Self {
        self.config.challenge_timeout = timeout;
        self
    }

    /// Set the reconnect policy.
    pub fn backoff(mut self, policy: BackoffPolicy) -> Self {
        self.config.backoff = policy;
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> Result<GatewayClientConfig, GatewayError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
