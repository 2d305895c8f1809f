//! Transport layer.
//!
//! Moves text frames between the session driver and the gateway. The
//! session layer never sees a socket; it talks to whatever [`Connector`] the
//! client was built with.
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            Client / driver              │
//! ├─────────────────────────────────────────┤
//! │            Session layer                │
//! ├─────────────────────────────────────────┤
//! │          Transport layer                │  ← This module
//! │   Connector, TransportSink/Handle       │
//! ├─────────────────────────────────────────┤
//! │        WebSocket (TLS optional)         │
//! └─────────────────────────────────────────┘
//! ```

mod connector;
#[cfg(feature = "websocket")]
mod websocket;

pub use connector::*;
#[cfg(feature = "websocket")]
#[cfg_attr(docsrs, doc(cfg(feature = "websocket")))]
pub use websocket::WebSocketConnector;
