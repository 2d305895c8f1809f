//! Connect handshake assembly and per-attempt auth state.

use std::fmt;

use tracing::{debug, info, warn};

use crate::core::{
    DEFAULT_ROLE, DEFAULT_SCOPE, MAX_PROTOCOL_VERSION, MIN_PROTOCOL_VERSION, TokenStore, now_ms,
};
use crate::frame::{ClientInfo, ConnectAuth, ConnectParams, HelloOk};
use crate::identity::{DeviceAuthPayload, DeviceToken, SigningCapability};

/// Static inputs to every connect request.
#[derive(Clone, PartialEq, Eq)]
pub struct HandshakeConfig {
    /// Client software identification.
    pub client: ClientInfo,
    /// Requested role.
    pub role: String,
    /// Requested scopes.
    pub scopes: Vec<String>,
    /// Shared bearer token.
    pub token: Option<String>,
    /// Shared password.
    pub password: Option<String>,
    /// User agent sent with the connect request.
    pub user_agent: String,
    /// Preferred locale.
    pub locale: String,
    /// Lowest acceptable protocol version.
    pub min_protocol: u32,
    /// Highest acceptable protocol version.
    pub max_protocol: u32,
}

impl HandshakeConfig {
    /// Defaults for a client identified by `client`.
    pub fn new(client: ClientInfo) -> Self {
        let user_agent = format!("{}/{}", client.id, client.version);
        Self {
            client,
            role: DEFAULT_ROLE.into(),
            scopes: vec![DEFAULT_SCOPE.into()],
            token: None,
            password: None,
            user_agent,
            locale: "en".into(),
            min_protocol: MIN_PROTOCOL_VERSION,
            max_protocol: MAX_PROTOCOL_VERSION,
        }
    }
}

impl fmt::Debug for HandshakeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeConfig")
            .field("client", &self.client)
            .field("role", &self.role)
            .field("scopes", &self.scopes)
            .field("token", &self.token.as_ref().map(|_| "[redacted]"))
            .field("password", &self.password.as_ref().map(|_| "[redacted]"))
            .field("user_agent", &self.user_agent)
            .field("locale", &self.locale)
            .field("min_protocol", &self.min_protocol)
            .field("max_protocol", &self.max_protocol)
            .finish()
    }
}

/// Auth state for one connect attempt.
///
/// Created when the attempt begins and consumed when it succeeds or fails.
#[derive(Default, Clone, PartialEq, Eq)]
pub struct AuthSession {
    device_token: Option<String>,
    can_fallback_to_shared: bool,
    nonce: Option<String>,
}

impl AuthSession {
    /// Look up the stored device token for this attempt.
    pub fn begin(
        config: &HandshakeConfig,
        signing: &SigningCapability,
        tokens: &dyn TokenStore,
    ) -> Self {
        let device_token = signing
            .device_id()
            .and_then(|device_id| tokens.load(device_id, &config.role))
            .map(|stored| stored.token);
        let can_fallback_to_shared = device_token.is_some() && config.token.is_some();
        Self {
            device_token,
            can_fallback_to_shared,
            nonce: None,
        }
    }

    /// Stored device token used by this attempt.
    pub fn device_token(&self) -> Option<&str> {
        self.device_token.as_deref()
    }

    /// Whether a shared token can take over if the device token is refused.
    pub fn can_fallback_to_shared(&self) -> bool {
        self.can_fallback_to_shared
    }

    /// Challenge nonce, once received.
    pub fn nonce(&self) -> Option<&str> {
        self.nonce.as_deref()
    }

    /// Record the challenge nonce.
    pub fn set_nonce(&mut self, nonce: impl Into<String>) {
        self.nonce = Some(nonce.into());
    }

    /// Assemble the connect parameters, signing them when possible.
    pub fn connect_params(
        &self,
        config: &HandshakeConfig,
        signing: &SigningCapability,
        signed_at_ms: u64,
    ) -> ConnectParams {
        let token = self.device_token.clone().or_else(|| config.token.clone());

        let device = signing.device_id().and_then(|device_id| {
            signing.prove(&DeviceAuthPayload {
                device_id,
                client_id: &config.client.id,
                client_mode: &config.client.mode,
                role: &config.role,
                scopes: &config.scopes,
                signed_at_ms,
                token: token.as_deref(),
                nonce: self.nonce.as_deref(),
            })
        });

        let auth = match (&token, &config.password) {
            (None, None) => None,
            _ => Some(ConnectAuth {
                token,
                password: config.password.clone(),
            }),
        };

        ConnectParams {
            min_protocol: config.min_protocol,
            max_protocol: config.max_protocol,
            client: config.client.clone(),
            role: config.role.clone(),
            scopes: config.scopes.clone(),
            device,
            auth,
            user_agent: config.user_agent.clone(),
            locale: config.locale.clone(),
        }
    }

    /// Persist a device token issued in `hello`.
    ///
    /// Failures are logged and swallowed; they never hold up the session.
    pub fn persist_issued(
        &self,
        hello: &HelloOk,
        config: &HandshakeConfig,
        signing: &SigningCapability,
        tokens: &dyn TokenStore,
    ) {
        let Some(device_id) = signing.device_id() else {
            return;
        };
        let Some(issued) = hello.auth.as_ref() else {
            return;
        };
        let Some(token) = issued.device_token.clone() else {
            return;
        };

        let role = issued.role.clone().unwrap_or_else(|| config.role.clone());
        let record = DeviceToken {
            token,
            role,
            scopes: issued.scopes.clone().unwrap_or_default(),
            updated_at_ms: issued.issued_at_ms.unwrap_or_else(now_ms),
        };
        let role = record.role.clone();
        match tokens.store(device_id, record) {
            Ok(()) => debug!(%role, "stored device token"),
            Err(e) => warn!(%role, error = %e, "failed to persist device token"),
        }
    }

    /// Drop the stored device token after the gateway refused it, so the
    /// next attempt authenticates with the shared credential.
    ///
    /// Returns `true` if a token was cleared.
    pub fn invalidate_device_token(
        &self,
        config: &HandshakeConfig,
        signing: &SigningCapability,
        tokens: &dyn TokenStore,
    ) -> bool {
        if !self.can_fallback_to_shared {
            return false;
        }
        let Some(device_id) = signing.device_id() else {
            return false;
        };
        match tokens.clear(device_id, &config.role) {
            Ok(()) => {
                info!(role = %config.role, "cleared rejected device token");
                true
            }
            Err(e) => {
                warn!(role = %config.role, error = %e, "failed to clear device token");
                false
            }
        }
    }
}

impl fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSession")
            .field("device_token", &self.device_token.as_ref().map(|_| "[redacted]"))
            .field("can_fallback_to_shared", &self.can_fallback_to_shared)
            .field("nonce", &self.nonce)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::IdentityError;
    use crate::frame::HelloAuth;
    use crate::identity::{DeviceIdentity, MemoryTokenStore};

    fn config() -> HandshakeConfig {
        HandshakeConfig::new(ClientInfo {
            id: "control-ui".into(),
            display_name: None,
            version: "1.0.0".into(),
            platform: "linux".into(),
            mode: "webchat".into(),
            instance_id: Some("inst-1".into()),
        })
    }

    fn signing() -> SigningCapability {
        SigningCapability::Available(Arc::new(DeviceIdentity::generate()))
    }

    fn device_token(token: &str) -> DeviceToken {
        DeviceToken {
            token: token.into(),
            role: DEFAULT_ROLE.into(),
            scopes: vec![],
            updated_at_ms: 0,
        }
    }

    struct FailingStore;

    impl TokenStore for FailingStore {
        fn load(&self, _: &str, _: &str) -> Option<DeviceToken> {
            None
        }
        fn store(&self, _: &str, _: DeviceToken) -> Result<(), IdentityError> {
            Err(IdentityError::Io(std::io::Error::other("disk full")))
        }
        fn clear(&self, _: &str, _: &str) -> Result<(), IdentityError> {
            Err(IdentityError::Io(std::io::Error::other("disk full")))
        }
    }

    #[test]
    fn test_no_credentials_omits_auth() {
        let signing = signing();
        let auth = AuthSession::begin(&config(), &signing, &MemoryTokenStore::new());
        let params = auth.connect_params(&config(), &signing, 1);

        assert!(params.auth.is_none());
        let device = params.device.unwrap();
        assert_eq!(Some(device.id.as_str()), signing.device_id());
        assert!(device.nonce.is_none());
    }

    #[test]
    fn test_device_token_preferred_over_shared() {
        let signing = signing();
        let store = MemoryTokenStore::new();
        store
            .store(signing.device_id().unwrap(), device_token("dev-tok"))
            .unwrap();
        let mut config = config();
        config.token = Some("shared".into());
        config.password = Some("pw".into());

        let auth = AuthSession::begin(&config, &signing, &store);
        assert!(auth.can_fallback_to_shared());
        let params = auth.connect_params(&config, &signing, 1);
        let sent = params.auth.unwrap();
        assert_eq!(sent.token.as_deref(), Some("dev-tok"));
        assert_eq!(sent.password.as_deref(), Some("pw"));
    }

    #[test]
    fn test_unavailable_signing_uses_shared_only() {
        let store = MemoryTokenStore::new();
        let mut config = config();
        config.token = Some("shared".into());

        let auth = AuthSession::begin(&config, &SigningCapability::Unavailable, &store);
        assert!(!auth.can_fallback_to_shared());
        let params = auth.connect_params(&config, &SigningCapability::Unavailable, 1);
        assert!(params.device.is_none());
        assert_eq!(params.auth.unwrap().token.as_deref(), Some("shared"));
    }

    #[test]
    fn test_nonce_is_signed() {
        let signing = signing();
        let mut auth = AuthSession::begin(&config(), &signing, &MemoryTokenStore::new());
        auth.set_nonce("n-42");
        let params = auth.connect_params(&config(), &signing, 9);
        let device = params.device.unwrap();
        assert_eq!(device.nonce.as_deref(), Some("n-42"));
        assert_eq!(device.signed_at, 9);
    }

    #[test]
    fn test_persist_issued_token() {
        let signing = signing();
        let store = MemoryTokenStore::new();
        let mut hello = HelloOk::new(3);
        hello.auth = Some(HelloAuth {
            device_token: Some("issued".into()),
            role: Some("node".into()),
            scopes: Some(vec!["node.exec".into()]),
            issued_at_ms: Some(55),
        });

        let auth = AuthSession::begin(&config(), &signing, &store);
        auth.persist_issued(&hello, &config(), &signing, &store);

        let stored = store.load(signing.device_id().unwrap(), "node").unwrap();
        assert_eq!(stored.token, "issued");
        assert_eq!(stored.scopes, vec!["node.exec".to_string()]);
        assert_eq!(stored.updated_at_ms, 55);
    }

    #[test]
    fn test_persist_failure_is_swallowed() {
        let signing = signing();
        let mut hello = HelloOk::new(3);
        hello.auth = Some(HelloAuth {
            device_token: Some("issued".into()),
            ..HelloAuth::default()
        });
        let auth = AuthSession::default();
        auth.persist_issued(&hello, &config(), &signing, &FailingStore);
    }

    #[test]
    fn test_invalidate_only_with_fallback() {
        let signing = signing();
        let device_id = signing.device_id().unwrap().to_owned();
        let store = MemoryTokenStore::new();
        store.store(&device_id, device_token("dev-tok")).unwrap();

        // No shared token configured: keep the device token.
        let auth = AuthSession::begin(&config(), &signing, &store);
        assert!(!auth.invalidate_device_token(&config(), &signing, &store));
        assert!(store.load(&device_id, DEFAULT_ROLE).is_some());

        let mut config = config();
        config.token = Some("shared".into());
        let auth = AuthSession::begin(&config, &signing, &store);
        assert!(auth.invalidate_device_token(&config, &signing, &store));
        assert!(store.load(&device_id, DEFAULT_ROLE).is_none());
    }

    #[test]
    fn test_debug_redacts_token() {
        let signing = signing();
        let store = MemoryTokenStore::new();
        store
            .store(signing.device_id().unwrap(), device_token("dev-secret"))
            .unwrap();
        let auth = AuthSession::begin(&config(), &signing, &store);
        assert!(!format!("{auth:?}").contains("dev-secret"));

        let mut config = config();
        config.password = Some("hunter2".into());
        assert!(!format!("{config:?}").contains("hunter2"));
    }
}
