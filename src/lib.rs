//! # Gateway Session
//!
//! Client for the gateway session protocol: one persistent WebSocket to a
//! remote gateway carrying a signed challenge handshake, concurrent
//! request/response pairs, and a sequenced push-event stream. It provides:
//!
//! - **Authentication**: Ed25519 device identity signing a server-issued
//!   nonce, with device-scoped tokens that fall back to a shared credential
//! - **Multiplexing**: requests correlated by id, answered in any order
//! - **Integrity**: gaps in the event sequence are detected and reported
//! - **Recovery**: jittered exponential reconnect that backs off harder while
//!   the host is hidden
//!
//! ## Feature Flags
//!
//! - `websocket` (default): tokio-tungstenite transport
//! - `file-store` (default): JSON-file identity and token stores
//!
//! ## Modules
//!
//! - [`core`]: constants, error types, and collaborator traits
//! - [`frame`]: wire frames and their JSON codec
//! - [`identity`]: device keypair, signing capability, token stores
//! - [`session`]: the sans-IO connection state machine and its parts
//! - [`transport`]: the connector seam and the WebSocket connector
//! - [`client`]: the async client handle and its driver task
//!
//! ## Example Usage
//!
//! ```ignore
//! use gateway_session::prelude::*;
//!
//! let config = GatewayClientBuilder::new()
//!     .url("wss://gateway.example/ws")
//!     .client_id("control-ui")
//!     .token("shared-secret")
//!     .build()?;
//!
//! let (client, mut notifications) =
//!     GatewayClient::new(config, Collaborators::persistent(WebSocketConnector, "./.gateway"));
//! client.start();
//!
//! while let Some(notification) = notifications.recv().await {
//!     match notification {
//!         GatewayNotification::Hello(hello) => println!("protocol {}", hello.protocol),
//!         GatewayNotification::Event(event) => println!("{}", event.event),
//!         GatewayNotification::Gap(gap) => eprintln!("missed {} events", gap.missed()),
//!         _ => {}
//!     }
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

pub mod frame;
pub mod identity;
pub mod session;
pub mod transport;

pub mod client;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::client::{Collaborators, GatewayClient, GatewayClientBuilder, GatewayClientConfig};
    pub use crate::core::*;
    pub use crate::frame::{ErrorShape, EventFrame, HelloOk};
    pub use crate::identity::{DeviceIdentity, DeviceToken, MemoryTokenStore, SigningCapability};
    pub use crate::session::{ConnectionState, GatewayNotification, NotificationReceiver};
    pub use crate::transport::Connector;

    #[cfg(feature = "file-store")]
    pub use crate::identity::{FileIdentityStore, FileTokenStore};

    #[cfg(feature = "websocket")]
    pub use crate::transport::WebSocketConnector;
}

// Re-export commonly used items at crate root
pub use client::{Collaborators, GatewayClient, GatewayClientBuilder, GatewayClientConfig};
pub use crate::core::{GatewayError, RequestError};
pub use session::{ConnectionState, GatewayNotification};
