//! Scripted in-process gateway used by the integration tests.
#![allow(dead_code)]

use gateway_session::prelude::*;
use gateway_session::transport::{Outbound, TransportHandle, TransportSink};
use serde_json::{Value, json};
use tokio::sync::mpsc;

/// Connector that hands every transport it opens to the test.
pub struct MockConnector {
    opened: mpsc::UnboundedSender<MockSocket>,
}

impl MockConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MockSocket>) {
        let (opened, sockets) = mpsc::unbounded_channel();
        (Self { opened }, sockets)
    }
}

impl Connector for MockConnector {
    fn open(&self, url: &str, sink: TransportSink) -> TransportHandle {
        let (handle, outbound) = TransportHandle::channel();
        let _ = self.opened.send(MockSocket {
            url: url.to_owned(),
            sink,
            outbound,
        });
        handle
    }
}

/// The gateway's end of one transport.
pub struct MockSocket {
    pub url: String,
    sink: TransportSink,
    outbound: mpsc::UnboundedReceiver<Outbound>,
}

impl MockSocket {
    pub fn open(&self) {
        self.sink.opened();
    }

    pub fn send(&self, frame: Value) {
        self.sink.message(frame.to_string());
    }

    pub fn challenge(&self, nonce: &str) {
        self.send(json!({"type": "event", "event": "connect.challenge", "payload": {"nonce": nonce}}));
    }

    pub fn event(&self, name: &str, seq: u64) {
        self.send(json!({"type": "event", "event": name, "payload": {"n": seq}, "seq": seq}));
    }

    pub fn reply_ok(&self, id: &str, payload: Value) {
        self.send(json!({"type": "res", "id": id, "ok": true, "payload": payload}));
    }

    pub fn reply_err(&self, id: &str, code: &str, message: &str) {
        self.send(json!({"type": "res", "id": id, "ok": false,
                         "error": {"code": code, "message": message}}));
    }

    pub fn hello(&self, connect_id: &str, extra: Value) {
        let mut hello = json!({"type": "hello-ok", "protocol": 3});
        if let (Some(hello), Some(extra)) = (hello.as_object_mut(), extra.as_object()) {
            hello.extend(extra.clone());
        }
        self.reply_ok(connect_id, hello);
    }

    pub fn close(&self, code: u16, reason: &str) {
        self.sink.closed(code, reason);
    }

    /// Next outbound item, or `None` once the client dropped the transport.
    pub async fn next_outbound(&mut self) -> Option<Outbound> {
        self.outbound.recv().await
    }

    /// Next text frame the client sent, parsed as JSON.
    pub async fn next_frame(&mut self) -> Value {
        match self.outbound.recv().await {
            Some(Outbound::Text(text)) => serde_json::from_str(&text).expect("client sent JSON"),
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    /// Open the transport, answer the challenge with `hello`, and return the
    /// connect frame the client sent.
    pub async fn handshake(&mut self, nonce: &str, hello: Value) -> Value {
        self.open();
        self.challenge(nonce);
        let connect = self.next_frame().await;
        assert_eq!(connect["method"], "connect");
        self.hello(frame_id(&connect), hello);
        connect
    }
}

pub fn frame_id(frame: &Value) -> &str {
    frame["id"].as_str().expect("frame id")
}

pub async fn accept(sockets: &mut mpsc::UnboundedReceiver<MockSocket>) -> MockSocket {
    sockets.recv().await.expect("client opened a transport")
}

pub fn config() -> GatewayClientConfig {
    GatewayClientBuilder::new()
        .url("ws://gateway.test/ws")
        .client_id("control-ui")
        .client_version("1.2.3")
        .mode("webchat")
        .build()
        .expect("valid config")
}

/// Wait for the first notification matching `pred`, skipping others.
pub async fn next_matching(
    notifications: &mut NotificationReceiver,
    pred: impl Fn(&GatewayNotification) -> bool,
) -> GatewayNotification {
    loop {
        let notification = notifications.recv().await.expect("notification stream open");
        if pred(&notification) {
            return notification;
        }
    }
}

pub async fn wait_for_state(client: &GatewayClient, state: ConnectionState) {
    client
        .watch_state()
        .wait_for(|current| *current == state)
        .await
        .expect("driver alive");
}
