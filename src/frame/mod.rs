//! Frame codec for the gateway wire protocol.
//!
//! All communication is JSON text frames:
//!
//! - [`RequestFrame`]: client to gateway call (`type: "req"`)
//! - [`ResponseFrame`]: gateway to client result (`type: "res"`)
//! - [`EventFrame`]: gateway to client push (`type: "event"`)
//!
//! The handshake rides on these: the gateway pushes a `connect.challenge`
//! event, the client answers with a `connect` request carrying
//! [`ConnectParams`], and the response payload is a [`HelloOk`].

mod codec;
mod types;

pub use codec::*;
pub use types::*;
