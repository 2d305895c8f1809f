//! High-level gateway client API.
//!
//! [`GatewayClient`] is a cheap handle onto a background driver task. Control
//! methods enqueue a command and return immediately; [`GatewayClient::request`]
//! resolves once the matching response (or a teardown) arrives.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};

use super::config::GatewayClientConfig;
use super::driver::{Driver, Outputs};
use crate::core::{
    AlwaysVisible, DeviceIdentityProvider, NOTIFICATION_CAPACITY, RequestError, TokenStore,
    Visibility,
};
use crate::frame::HelloOk;
use crate::identity::{EphemeralIdentity, MemoryTokenStore, SigningCapability};
use crate::session::{Connection, ConnectionState, Input, NotificationReceiver};
use crate::transport::Connector;

/// External collaborators a client is built from.
pub struct Collaborators {
    /// Opens transports.
    pub connector: Arc<dyn Connector>,
    /// Supplies the device keypair.
    pub identity: Arc<dyn DeviceIdentityProvider>,
    /// Persists device tokens.
    pub tokens: Arc<dyn TokenStore>,
    /// Reports whether the host is hidden.
    pub visibility: Arc<dyn Visibility>,
}

impl Collaborators {
    /// In-memory collaborators around `connector`: a throwaway identity, a
    /// process-local token store, and an always-visible host.
    pub fn new(connector: impl Connector) -> Self {
        Self {
            connector: Arc::new(connector),
            identity: Arc::new(EphemeralIdentity),
            tokens: Arc::new(MemoryTokenStore::new()),
            visibility: Arc::new(AlwaysVisible),
        }
    }

    /// Collaborators persisting identity and tokens under `dir`
    /// (`device.json` and `device-auth.json`).
    #[cfg(feature = "file-store")]
    #[cfg_attr(docsrs, doc(cfg(feature = "file-store")))]
    pub fn persistent(connector: impl Connector, dir: impl AsRef<std::path::Path>) -> Self {
        let dir = dir.as_ref();
        Self::new(connector)
            .identity(crate::identity::FileIdentityStore::new(dir.join("device.json")))
            .tokens(Arc::new(crate::identity::FileTokenStore::new(
                dir.join("device-auth.json"),
            )))
    }

    /// Replace the identity provider.
    pub fn identity(mut self, provider: impl DeviceIdentityProvider + 'static) -> Self {
        self.identity = Arc::new(provider);
        self
    }

    /// Replace the token store.
    pub fn tokens(mut self, store: Arc<dyn TokenStore>) -> Self {
        self.tokens = store;
        self
    }

    /// Replace the visibility oracle.
    pub fn visibility(mut self, visibility: Arc<dyn Visibility>) -> Self {
        self.visibility = visibility;
        self
    }
}

#[cfg(feature = "websocket")]
impl Default for Collaborators {
    fn default() -> Self {
        Self::new(crate::transport::WebSocketConnector::new())
    }
}

/// A gateway session client.
///
/// # Example
///
/// ```ignore
/// use gateway_session::prelude::*;
///
/// let config = GatewayClientBuilder::from_env().client_id("control-ui").build()?;
/// let (client, mut notifications) = GatewayClient::new(config, Collaborators::default());
/// client.start();
///
/// while let Some(notification) = notifications.recv().await {
///     if let GatewayNotification::Hello(_) = notification {
///         let health = client.request("health", None).await?;
///         println!("{health}");
///     }
/// }
/// ```
pub struct GatewayClient {
    commands: mpsc::UnboundedSender<Input>,
    state: watch::Receiver<ConnectionState>,
    hello: watch::Receiver<Option<Arc<HelloOk>>>,
    device_id: Option<String>,
}

impl GatewayClient {
    /// Build a client and spawn its driver task. The client starts idle;
    /// call [`GatewayClient::start`] to connect.
    ///
    /// Returns the client handle and the notification stream.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn new(config: GatewayClientConfig, collaborators: Collaborators) -> (Self, NotificationReceiver) {
        let signing = SigningCapability::detect(collaborators.identity.as_ref());
        let device_id = signing.device_id().map(str::to_owned);
        let machine = Connection::new(
            config.session(),
            signing,
            collaborators.tokens,
            collaborators.visibility,
        );

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (notifications_tx, notifications_rx) = mpsc::channel(NOTIFICATION_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (hello_tx, hello_rx) = watch::channel(None);

        let driver = Driver::new(
            config.url,
            machine,
            collaborators.connector,
            commands_rx,
            Outputs {
                notifications: notifications_tx,
                state: state_tx,
                hello: hello_tx,
            },
        );
        tokio::spawn(driver.run());

        let client = Self {
            commands: commands_tx,
            state: state_rx,
            hello: hello_rx,
            device_id,
        };
        (client, notifications_rx)
    }

    fn send(&self, input: Input) {
        // A closed channel means the driver is gone; there is nothing left to control.
        let _ = self.commands.send(input);
    }

    /// Begin connecting. Leaves the stopped state and re-enables reconnects.
    pub fn start(&self) {
        self.send(Input::Start);
    }

    /// Stop: close the transport, cancel reconnects, and reject every pending
    /// request with [`RequestError::Stopped`]. Idempotent.
    pub fn stop(&self) {
        self.send(Input::Stop);
    }

    /// Allow or forbid automatic reconnects after a close.
    pub fn set_reconnect_enabled(&self, enabled: bool) {
        self.send(Input::SetReconnectEnabled(enabled));
    }

    /// Drop the current transport and connect immediately, optionally
    /// restoring the backoff floor. Ignored once stopped.
    pub fn reconnect_now(&self, reset_backoff: bool) {
        self.send(Input::ReconnectNow { reset_backoff });
    }

    /// Call `method` on the gateway.
    ///
    /// Fails immediately with [`RequestError::NotConnected`] unless the
    /// session is open. There is no timeout and no retry.
    pub async fn request(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Result<Value, RequestError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Input::Request {
                method: method.into(),
                params,
                reply,
            })
            .map_err(|_| RequestError::Dropped)?;
        response.await.map_err(|_| RequestError::Dropped)?
    }

    /// Whether the session is open.
    pub fn connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Subscribe to connection state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// The most recent successful handshake result.
    pub fn hello(&self) -> Option<Arc<HelloOk>> {
        self.hello.borrow().clone()
    }

    /// Device id presented to the gateway, when signing is available.
    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }
}

impl Drop for GatewayClient {
    fn drop(&mut self) {
        self.send(Input::Stop);
    }
}
