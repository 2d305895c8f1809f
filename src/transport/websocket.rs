//! WebSocket transport over tokio-tungstenite.

use std::borrow::Cow;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message, frame::coding::CloseCode};
use tracing::{debug, info, warn};

use super::connector::{Connector, Outbound, TransportHandle, TransportSink};
use crate::core::CLOSE_ABNORMAL;

/// Close code reported when the peer closed without a status.
const CLOSE_NO_STATUS: u16 = 1005;

/// Opens one WebSocket per connect attempt, each driven by its own task.
///
/// Must be used from within a tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    /// Create a connector.
    pub fn new() -> Self {
        Self
    }
}

impl Connector for WebSocketConnector {
    fn open(&self, url: &str, sink: TransportSink) -> TransportHandle {
        let (handle, outbound) = TransportHandle::channel();
        tokio::spawn(run_socket(url.to_owned(), sink, outbound));
        handle
    }
}

async fn run_socket(url: String, sink: TransportSink, mut outbound: mpsc::UnboundedReceiver<Outbound>) {
    let generation = sink.generation();
    let ws = match connect_async(url.as_str()).await {
        Ok((ws, _response)) => ws,
        Err(e) => {
            warn!(generation, error = %e, "gateway websocket connect failed");
            sink.closed(CLOSE_ABNORMAL, e.to_string());
            return;
        }
    };
    info!(generation, url = %url, "gateway websocket connected");
    sink.opened();

    let (mut write, mut read) = ws.split();
    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = write.send(Message::Text(text)).await {
                        sink.closed(CLOSE_ABNORMAL, e.to_string());
                        return;
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: Cow::Owned(reason.clone()),
                    };
                    if let Err(e) = write.send(Message::Close(Some(frame))).await {
                        debug!(generation, error = %e, "close frame not sent");
                    }
                    sink.closed(code, reason);
                    return;
                }
                None => {
                    // Handle dropped without an explicit close.
                    let _ = write.send(Message::Close(None)).await;
                    return;
                }
            },
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    sink.message(text);
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = write.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.into_owned()))
                        .unwrap_or((CLOSE_NO_STATUS, String::new()));
                    debug!(generation, code, "gateway closed websocket");
                    sink.closed(code, reason);
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    sink.closed(CLOSE_ABNORMAL, e.to_string());
                    return;
                }
                None => {
                    sink.closed(CLOSE_ABNORMAL, "connection reset");
                    return;
                }
            },
        }
    }
}
