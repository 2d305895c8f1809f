//! Transport seam between the session driver and a concrete socket.
//!
//! A [`Connector`] opens one transport per connect attempt. The transport
//! runs in its own task: it reports what happens through a
//! [`TransportSink`] and takes outbound frames from a [`TransportHandle`].
//! Every sink is stamped with the generation of the attempt that created
//! it, so the driver can ignore a transport it has already discarded.

use tokio::sync::mpsc;

/// Something a transport observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection is established.
    Opened,
    /// A text message arrived.
    Message(String),
    /// The connection closed, or could not be established.
    Closed {
        /// Close code (1006 when no close frame was received).
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// Channel carrying `(generation, event)` pairs to the driver.
pub type TransportEvents = mpsc::UnboundedReceiver<(u64, TransportEvent)>;

/// Reporting side handed to a transport task.
#[derive(Debug, Clone)]
pub struct TransportSink {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
}

impl TransportSink {
    /// Create a sink for `generation` together with its receiving end.
    pub fn channel(generation: u64) -> (Self, TransportEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { generation, tx }, rx)
    }

    /// Sink reporting on an existing channel under a new generation.
    pub fn with_generation(&self, generation: u64) -> Self {
        Self {
            generation,
            tx: self.tx.clone(),
        }
    }

    /// Generation this sink reports under.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Report an event. Returns `false` once the driver is gone.
    pub fn report(&self, event: TransportEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }

    /// Report that the connection is established.
    pub fn opened(&self) -> bool {
        self.report(TransportEvent::Opened)
    }

    /// Report an inbound text message.
    pub fn message(&self, text: impl Into<String>) -> bool {
        self.report(TransportEvent::Message(text.into()))
    }

    /// Report that the connection closed.
    pub fn closed(&self, code: u16, reason: impl Into<String>) -> bool {
        self.report(TransportEvent::Closed {
            code,
            reason: reason.into(),
        })
    }
}

/// Frames queued for a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Send a text message.
    Text(String),
    /// Send a close frame and shut down.
    Close {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// Sending side of one transport.
///
/// Dropping the handle without calling [`TransportHandle::close`] lets the
/// transport shut down on its own.
#[derive(Debug)]
pub struct TransportHandle {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl TransportHandle {
    /// Create a handle and the receiver the transport task drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a text frame. Returns `false` if the transport is gone.
    pub fn send_text(&self, text: String) -> bool {
        self.tx.send(Outbound::Text(text)).is_ok()
    }

    /// Ask the transport to close with `code` and `reason`.
    pub fn close(self, code: u16, reason: impl Into<String>) {
        let _ = self.tx.send(Outbound::Close {
            code,
            reason: reason.into(),
        });
    }
}

/// Opens transports to a gateway.
pub trait Connector: Send + Sync + 'static {
    /// Start connecting to `url`.
    ///
    /// Must not block: the connection is established in the background and
    /// reported through `sink`, ending with exactly one
    /// [`TransportEvent::Closed`].
    fn open(&self, url: &str, sink: TransportSink) -> TransportHandle;
}
