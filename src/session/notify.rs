//! Observer notifications.

use std::sync::Arc;

use tokio::sync::mpsc;

use super::backoff::ScheduledReconnect;
use super::machine::ConnectionState;
use super::sequencer::SequenceGap;
use crate::frame::{EventFrame, HelloOk};

/// Something observers of a gateway session may want to react to.
#[derive(Debug, Clone)]
pub enum GatewayNotification {
    /// Handshake completed; the session is open.
    Hello(Arc<HelloOk>),
    /// A pushed event (never the handshake challenge).
    Event(EventFrame),
    /// The transport closed.
    Closed {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
    /// Events were skipped on the current transport.
    Gap(SequenceGap),
    /// A reconnect was scheduled. Carries no close reason.
    ReconnectScheduled(ScheduledReconnect),
    /// The connection moved to a new state.
    StateChanged(ConnectionState),
}

impl GatewayNotification {
    /// Short name of the variant, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello(_) => "hello",
            Self::Event(_) => "event",
            Self::Closed { .. } => "closed",
            Self::Gap(_) => "gap",
            Self::ReconnectScheduled(_) => "reconnect-scheduled",
            Self::StateChanged(_) => "state-changed",
        }
    }
}

/// Receiving end of a client's notification stream.
///
/// Holds at most [`NOTIFICATION_CAPACITY`](crate::core::NOTIFICATION_CAPACITY)
/// undelivered notifications; while it is full, newer notifications are
/// dropped. Connection state and the last hello stay available through
/// [`GatewayClient::state`](crate::client::GatewayClient::state) and
/// [`GatewayClient::hello`](crate::client::GatewayClient::hello).
pub type NotificationReceiver = mpsc::Receiver<GatewayNotification>;
