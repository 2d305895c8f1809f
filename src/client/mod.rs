//! Gateway client.
//!
//! The public handle, its configuration, and the driver task that connects
//! the session state machine to a transport and to the clock.

#[allow(clippy::module_inception)]
mod client;
mod config;
mod driver;

pub use client::*;
pub use config::*;
