//! Connection state machine.
//!
//! [`Connection`] is sans-IO: every stimulus (caller command, transport
//! event, timer firing) is fed to [`Connection::step`] as an [`Input`], and
//! the machine answers with the [`Action`]s the driver must perform. It never
//! touches a socket or a clock-driven timer itself, so every transition can
//! be exercised synchronously.
//!
//! Lifecycle:
//!
//! ```text
//! Idle → Connecting → AwaitingChallenge → Handshaking → Open
//!                                                        │ close
//!                 ┌──────────── ReconnectScheduled ◄─────┤
//!                 └→ Connecting                  Idle ◄──┘ (reconnect disabled)
//!
//! stop() from anywhere → Stopped
//! ```
//!
//! Every state change is accompanied by [`Action::CancelTimers`], so a timer
//! armed in one state can never fire into another.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::backoff::{Backoff, BackoffPolicy};
use super::correlator::{Reply, RequestCorrelator};
use super::handshake::{AuthSession, HandshakeConfig};
use super::notify::GatewayNotification;
use super::sequencer::EventSequencer;
use crate::core::{
    CHALLENGE_FALLBACK, CLOSE_CONNECT_FAILED, CLOSE_NORMAL, CLOSE_TICK_TIMEOUT, CodecError,
    METHOD_CONNECT, RequestError, TICK_MISS_FACTOR, TokenStore, Visibility, now_ms,
};
use crate::frame::{
    EventFrame, HelloOk, InboundFrame, RequestFrame, ResponseFrame, decode_hello, decode_inbound,
    encode_request,
};
use crate::identity::SigningCapability;

/// Reason attached to the close frame sent by `stop()`.
const REASON_STOPPED: &str = "client stopped";
/// Reason attached when a transport is discarded by `reconnect_now()`.
const REASON_RECONNECT: &str = "reconnect requested";
/// Reason attached when the handshake was refused.
const REASON_CONNECT_FAILED: &str = "connect failed";
/// Reason attached when the gateway stopped ticking.
const REASON_TICK_TIMEOUT: &str = "tick timeout";

/// Tunables of one session, independent of the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Connect request inputs.
    pub handshake: HandshakeConfig,
    /// Reconnect policy.
    pub backoff: BackoffPolicy,
    /// How long to wait for a challenge before connecting without a nonce.
    pub challenge_timeout: Duration,
}

impl SessionConfig {
    /// Default timing around `handshake`.
    pub fn new(handshake: HandshakeConfig) -> Self {
        Self {
            handshake,
            backoff: BackoffPolicy::default(),
            challenge_timeout: CHALLENGE_FALLBACK,
        }
    }
}

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not started, or closed with reconnection disabled.
    Idle,
    /// Transport being opened.
    Connecting,
    /// Transport open, waiting for the gateway's challenge.
    AwaitingChallenge,
    /// Connect request sent, waiting for `hello-ok`.
    Handshaking,
    /// Session established; requests may be sent.
    Open,
    /// Waiting out the backoff delay before the next attempt.
    ReconnectScheduled,
    /// Stopped by the caller.
    Stopped,
}

impl ConnectionState {
    /// Whether a transport exists in this state.
    pub fn has_transport(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::AwaitingChallenge | Self::Handshaking | Self::Open
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::AwaitingChallenge => "awaiting-challenge",
            Self::Handshaking => "handshaking",
            Self::Open => "open",
            Self::ReconnectScheduled => "reconnect-scheduled",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// A stimulus for the state machine.
#[derive(Debug)]
pub enum Input {
    /// Begin connecting (also leaves `Stopped`).
    Start,
    /// Stop for good, rejecting pending requests.
    Stop,
    /// Allow or forbid automatic reconnects.
    SetReconnectEnabled(bool),
    /// Drop the current transport and connect immediately.
    ReconnectNow {
        /// Restore the backoff floor first.
        reset_backoff: bool,
    },
    /// Send a request once the session is open.
    Request {
        /// Method name.
        method: String,
        /// Opaque parameters.
        params: Option<Value>,
        /// Completion.
        reply: Reply,
    },
    /// The transport finished opening.
    TransportOpened,
    /// A text message arrived on the transport.
    TransportMessage(String),
    /// The transport closed or failed to open.
    TransportClosed {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
    /// The challenge fallback timer fired.
    ChallengeTimeout,
    /// The reconnect timer fired.
    ReconnectTimeout,
    /// The tick watchdog fired.
    TickTimeout,
}

/// Work the driver must carry out, in order.
#[derive(Debug)]
pub enum Action {
    /// Open a new transport, replacing any previous one.
    OpenTransport,
    /// Send a text frame on the current transport.
    Send(String),
    /// Close the current transport and ignore anything it reports afterwards.
    CloseTransport {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
    /// Cancel every armed timer.
    CancelTimers,
    /// Arm the challenge fallback timer.
    ArmChallengeTimer(Duration),
    /// Arm the reconnect timer.
    ArmReconnectTimer(Duration),
    /// Arm the tick watchdog.
    ArmTickTimer(Duration),
    /// Deliver a notification to observers.
    Notify(GatewayNotification),
}

/// Per-state data.
#[derive(Debug)]
enum Phase {
    Idle,
    Connecting { auth: AuthSession },
    AwaitingChallenge { auth: AuthSession },
    Handshaking { auth: AuthSession, connect_id: String },
    Open { tick: Option<Duration> },
    ReconnectScheduled,
    Stopped,
}

impl Phase {
    fn state(&self) -> ConnectionState {
        match self {
            Self::Idle => ConnectionState::Idle,
            Self::Connecting { .. } => ConnectionState::Connecting,
            Self::AwaitingChallenge { .. } => ConnectionState::AwaitingChallenge,
            Self::Handshaking { .. } => ConnectionState::Handshaking,
            Self::Open { .. } => ConnectionState::Open,
            Self::ReconnectScheduled => ConnectionState::ReconnectScheduled,
            Self::Stopped => ConnectionState::Stopped,
        }
    }
}

/// The single logical session to a gateway.
pub struct Connection {
    config: SessionConfig,
    phase: Phase,
    reconnect_enabled: bool,
    backoff: Backoff,
    sequencer: EventSequencer,
    pending: RequestCorrelator,
    hello: Option<Arc<HelloOk>>,
    last_frame_at: Instant,
    signing: SigningCapability,
    tokens: Arc<dyn TokenStore>,
    visibility: Arc<dyn Visibility>,
    rng: StdRng,
}

impl Connection {
    /// Create an idle connection.
    pub fn new(
        config: SessionConfig,
        signing: SigningCapability,
        tokens: Arc<dyn TokenStore>,
        visibility: Arc<dyn Visibility>,
    ) -> Self {
        Self {
            backoff: Backoff::new(config.backoff),
            config,
            phase: Phase::Idle,
            reconnect_enabled: true,
            sequencer: EventSequencer::new(),
            pending: RequestCorrelator::new(),
            hello: None,
            last_frame_at: Instant::now(),
            signing,
            tokens,
            visibility,
            rng: StdRng::from_entropy(),
        }
    }

    /// Use a seeded jitter source, for reproducible delays.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.phase.state()
    }

    /// Whether the session is open.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Whether automatic reconnects are enabled.
    pub fn reconnect_enabled(&self) -> bool {
        self.reconnect_enabled
    }

    /// Backoff state.
    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Number of requests awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Last event sequence number seen on the current transport.
    pub fn last_seq(&self) -> Option<u64> {
        self.sequencer.last_seq()
    }

    /// Last successful handshake result.
    pub fn hello(&self) -> Option<&Arc<HelloOk>> {
        self.hello.as_ref()
    }

    /// Signing capability in use.
    pub fn signing(&self) -> &SigningCapability {
        &self.signing
    }

    /// Apply one input and return the resulting actions.
    pub fn step(&mut self, input: Input) -> Vec<Action> {
        let mut out = Vec::new();
        match input {
            Input::Start => self.on_start(&mut out),
            Input::Stop => self.on_stop(&mut out),
            Input::SetReconnectEnabled(enabled) => self.on_set_reconnect(enabled, &mut out),
            Input::ReconnectNow { reset_backoff } => self.on_reconnect_now(reset_backoff, &mut out),
            Input::Request {
                method,
                params,
                reply,
            } => self.on_request(method, params, reply, &mut out),
            Input::TransportOpened => self.on_transport_opened(&mut out),
            Input::TransportMessage(text) => self.on_message(&text, &mut out),
            Input::TransportClosed { code, reason } => {
                if self.state().has_transport() {
                    self.on_closed(code, reason, &mut out);
                } else {
                    debug!(code, "ignoring close without a transport");
                }
            }
            Input::ChallengeTimeout => {
                if self.state() == ConnectionState::AwaitingChallenge {
                    debug!("no challenge received; connecting without nonce");
                    self.send_connect(&mut out);
                }
            }
            Input::ReconnectTimeout => {
                if self.state() == ConnectionState::ReconnectScheduled {
                    self.begin_connect(&mut out);
                }
            }
            Input::TickTimeout => self.on_tick(&mut out),
        }
        out
    }

    // ===== Transitions =====

    fn enter(&mut self, phase: Phase, out: &mut Vec<Action>) {
        let from = self.phase.state();
        self.phase = phase;
        let to = self.phase.state();
        out.push(Action::CancelTimers);
        if from != to {
            debug!(%from, %to, "connection state");
            out.push(Action::Notify(GatewayNotification::StateChanged(to)));
        }
    }

    fn begin_connect(&mut self, out: &mut Vec<Action>) {
        let auth = AuthSession::begin(&self.config.handshake, &self.signing, self.tokens.as_ref());
        self.sequencer.reset();
        self.enter(Phase::Connecting { auth }, out);
        out.push(Action::OpenTransport);
    }

    fn on_start(&mut self, out: &mut Vec<Action>) {
        self.reconnect_enabled = true;
        match self.state() {
            ConnectionState::Idle | ConnectionState::Stopped => {
                info!("gateway client starting");
                self.begin_connect(out);
            }
            ConnectionState::ReconnectScheduled => {
                debug!("start skips pending reconnect delay");
                self.begin_connect(out);
            }
            state => debug!(%state, "start ignored; already running"),
        }
    }

    fn on_stop(&mut self, out: &mut Vec<Action>) {
        if self.state() == ConnectionState::Stopped {
            return;
        }
        let had_transport = self.state().has_transport();
        self.enter(Phase::Stopped, out);
        if had_transport {
            self.discard_transport(CLOSE_NORMAL, REASON_STOPPED, out);
        }
        let rejected = self.pending.reject_all(RequestError::Stopped);
        self.sequencer.reset();
        info!(rejected, "gateway client stopped");
    }

    fn on_set_reconnect(&mut self, enabled: bool, out: &mut Vec<Action>) {
        self.reconnect_enabled = enabled;
        if !enabled && self.state() == ConnectionState::ReconnectScheduled {
            self.enter(Phase::Idle, out);
        }
    }

    fn on_reconnect_now(&mut self, reset_backoff: bool, out: &mut Vec<Action>) {
        if self.state() == ConnectionState::Stopped {
            debug!("reconnect ignored; client stopped");
            return;
        }
        if reset_backoff {
            self.backoff.reset();
        }
        if self.state().has_transport() {
            self.discard_transport(CLOSE_NORMAL, REASON_RECONNECT, out);
            self.pending.reject_all(RequestError::Closed {
                code: CLOSE_NORMAL,
                reason: REASON_RECONNECT.into(),
            });
        }
        self.begin_connect(out);
    }

    fn on_request(
        &mut self,
        method: String,
        params: Option<Value>,
        reply: Reply,
        out: &mut Vec<Action>,
    ) {
        if !self.is_connected() {
            let _ = reply.send(Err(RequestError::NotConnected));
            return;
        }
        let id = Uuid::new_v4().to_string();
        let text = match encode_request(&RequestFrame::new(id.clone(), method, params)) {
            Ok(text) => text,
            Err(e) => {
                let _ = reply.send(Err(RequestError::Encode(e.to_string())));
                return;
            }
        };
        if let Err(reply) = self.pending.register(id, reply) {
            let _ = reply.send(Err(RequestError::Encode("duplicate request id".into())));
            return;
        }
        out.push(Action::Send(text));
    }

    fn on_transport_opened(&mut self, out: &mut Vec<Action>) {
        let Phase::Connecting { auth } = &mut self.phase else {
            debug!("ignoring unexpected transport open");
            return;
        };
        let auth = std::mem::take(auth);
        info!("gateway transport open; awaiting challenge");
        self.last_frame_at = Instant::now();
        self.enter(Phase::AwaitingChallenge { auth }, out);
        out.push(Action::ArmChallengeTimer(self.config.challenge_timeout));
    }

    fn on_message(&mut self, text: &str, out: &mut Vec<Action>) {
        if !self.state().has_transport() {
            return;
        }
        self.last_frame_at = Instant::now();
        trace!(bytes = text.len(), "inbound frame");
        match decode_inbound(text) {
            Ok(InboundFrame::Event(event)) => self.on_event(event, out),
            Ok(InboundFrame::Response(response)) => self.on_response(response, out),
            Err(e) => debug!(error = %e, "dropping inbound frame"),
        }
    }

    fn on_event(&mut self, event: EventFrame, out: &mut Vec<Action>) {
        if event.is_challenge() {
            let state = self.state();
            match event.challenge_nonce() {
                Some(nonce) if state == ConnectionState::AwaitingChallenge => {
                    if let Phase::AwaitingChallenge { auth } = &mut self.phase {
                        auth.set_nonce(nonce);
                    }
                    self.send_connect(out);
                }
                _ => debug!(%state, "ignoring connect challenge"),
            }
            return;
        }

        if let Some(gap) = self.sequencer.observe(event.seq) {
            warn!(expected = gap.expected, received = gap.received, "event sequence gap");
            out.push(Action::Notify(GatewayNotification::Gap(gap)));
        }
        out.push(Action::Notify(GatewayNotification::Event(event)));
    }

    fn send_connect(&mut self, out: &mut Vec<Action>) {
        let Phase::AwaitingChallenge { auth } = &mut self.phase else {
            return;
        };
        let auth = std::mem::take(auth);
        let params = auth.connect_params(&self.config.handshake, &self.signing, now_ms());
        let connect_id = Uuid::new_v4().to_string();

        let encoded = serde_json::to_value(&params)
            .map_err(CodecError::from)
            .and_then(|params| {
                encode_request(&RequestFrame::new(
                    connect_id.clone(),
                    METHOD_CONNECT,
                    Some(params),
                ))
            });
        let text = match encoded {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "failed to encode connect request");
                self.close_transport(CLOSE_CONNECT_FAILED, REASON_CONNECT_FAILED, out);
                return;
            }
        };

        debug!(
            signed = params.device.is_some(),
            nonce = auth.nonce().is_some(),
            "sending connect"
        );
        self.enter(Phase::Handshaking { auth, connect_id }, out);
        out.push(Action::Send(text));
    }

    fn on_response(&mut self, response: ResponseFrame, out: &mut Vec<Action>) {
        let is_connect = matches!(
            &self.phase,
            Phase::Handshaking { connect_id, .. } if *connect_id == response.id
        );
        if is_connect {
            self.on_handshake_result(response, out);
        } else {
            self.pending.resolve(response);
        }
    }

    fn on_handshake_result(&mut self, response: ResponseFrame, out: &mut Vec<Action>) {
        let Phase::Handshaking { auth, .. } = &mut self.phase else {
            return;
        };
        let auth = std::mem::take(auth);

        let hello = match response.into_result() {
            Ok(payload) => decode_hello(payload).map_err(|e| e.to_string()),
            Err(shape) => Err(format!("{}: {}", shape.code, shape.message)),
        };
        match hello {
            Ok(hello) => self.on_hello(auth, hello, out),
            Err(error) => {
                warn!(%error, "gateway rejected connect");
                auth.invalidate_device_token(
                    &self.config.handshake,
                    &self.signing,
                    self.tokens.as_ref(),
                );
                self.close_transport(CLOSE_CONNECT_FAILED, REASON_CONNECT_FAILED, out);
            }
        }
    }

    fn on_hello(&mut self, auth: AuthSession, hello: HelloOk, out: &mut Vec<Action>) {
        auth.persist_issued(
            &hello,
            &self.config.handshake,
            &self.signing,
            self.tokens.as_ref(),
        );
        self.backoff.reset();
        self.last_frame_at = Instant::now();

        let tick = hello.tick_interval_ms().map(Duration::from_millis);
        let hello = Arc::new(hello);
        self.hello = Some(Arc::clone(&hello));
        info!(protocol = hello.protocol, "gateway session open");

        self.enter(Phase::Open { tick }, out);
        out.push(Action::Notify(GatewayNotification::Hello(hello)));
        if let Some(interval) = tick {
            out.push(Action::ArmTickTimer(interval));
        }
    }

    fn on_tick(&mut self, out: &mut Vec<Action>) {
        let Phase::Open {
            tick: Some(interval),
        } = self.phase
        else {
            return;
        };
        if self.last_frame_at.elapsed() > interval * TICK_MISS_FACTOR {
            warn!(interval_ms = interval.as_millis() as u64, "gateway tick missed");
            self.close_transport(CLOSE_TICK_TIMEOUT, REASON_TICK_TIMEOUT, out);
        } else {
            out.push(Action::ArmTickTimer(interval));
        }
    }

    // ===== Teardown =====

    /// Close the transport locally without running the reconnect path.
    fn discard_transport(&mut self, code: u16, reason: &str, out: &mut Vec<Action>) {
        out.push(Action::CloseTransport {
            code,
            reason: reason.into(),
        });
        out.push(Action::Notify(GatewayNotification::Closed {
            code,
            reason: reason.into(),
        }));
    }

    /// Close the transport locally and treat it like any other close.
    fn close_transport(&mut self, code: u16, reason: &str, out: &mut Vec<Action>) {
        out.push(Action::CloseTransport {
            code,
            reason: reason.into(),
        });
        self.on_closed(code, reason.into(), out);
    }

    fn on_closed(&mut self, code: u16, reason: String, out: &mut Vec<Action>) {
        info!(code, "gateway transport closed");
        out.push(Action::Notify(GatewayNotification::Closed {
            code,
            reason: reason.clone(),
        }));
        let rejected = self.pending.reject_all(RequestError::Closed { code, reason });
        if rejected > 0 {
            debug!(rejected, "rejected pending requests");
        }
        self.sequencer.reset();

        if !self.reconnect_enabled {
            self.enter(Phase::Idle, out);
            return;
        }

        let hidden = self.visibility.is_hidden();
        let retry = self.backoff.schedule(hidden, &mut self.rng);
        info!(
            attempt = retry.attempt,
            delay_ms = retry.delay.as_millis() as u64,
            hidden,
            "gateway reconnect scheduled"
        );
        self.enter(Phase::ReconnectScheduled, out);
        out.push(Action::ArmReconnectTimer(retry.delay));
        out.push(Action::Notify(GatewayNotification::ReconnectScheduled(retry)));
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("reconnect_enabled", &self.reconnect_enabled)
            .field("backoff", &self.backoff)
            .field("pending", &self.pending.len())
            .field("last_seq", &self.sequencer.last_seq())
            .field("signing", &self.signing.is_available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DEFAULT_ROLE, IdentityError, VisibilityFlag};
    use crate::frame::ClientInfo;
    use crate::identity::{DeviceIdentity, DeviceToken, MemoryTokenStore};
    use serde_json::json;
    use tokio::sync::oneshot;

    struct Harness {
        conn: Connection,
        tokens: Arc<MemoryTokenStore>,
        visibility: VisibilityFlag,
    }

    fn client_info() -> ClientInfo {
        ClientInfo {
            id: "control-ui".into(),
            display_name: None,
            version: "1.0.0".into(),
            platform: "test".into(),
            mode: "webchat".into(),
            instance_id: None,
        }
    }

    fn harness_with(config: SessionConfig, signing: SigningCapability) -> Harness {
        let tokens = Arc::new(MemoryTokenStore::new());
        let visibility = VisibilityFlag::new();
        let conn = Connection::new(
            config,
            signing,
            tokens.clone(),
            Arc::new(visibility.clone()),
        )
        .with_seed(3);
        Harness {
            conn,
            tokens,
            visibility,
        }
    }

    fn harness() -> Harness {
        harness_with(
            SessionConfig::new(HandshakeConfig::new(client_info())),
            SigningCapability::Available(Arc::new(DeviceIdentity::generate())),
        )
    }

    fn sent(actions: &[Action]) -> Vec<Value> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Send(text) => serde_json::from_str(text).ok(),
                _ => None,
            })
            .collect()
    }

    fn notifications(actions: &[Action]) -> Vec<&GatewayNotification> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Notify(n) => Some(n),
                _ => None,
            })
            .collect()
    }

    fn challenge(nonce: &str) -> Input {
        Input::TransportMessage(
            json!({"type": "event", "event": "connect.challenge", "payload": {"nonce": nonce}})
                .to_string(),
        )
    }

    fn hello_response(id: &str, hello: Value) -> Input {
        Input::TransportMessage(json!({"type": "res", "id": id, "ok": true, "payload": hello}).to_string())
    }

    fn event(name: &str, seq: u64) -> Input {
        Input::TransportMessage(json!({"type": "event", "event": name, "seq": seq}).to_string())
    }

    impl Harness {
        /// Drive to `Handshaking` and return the connect frame.
        fn handshake(&mut self) -> Value {
            self.conn.step(Input::Start);
            self.conn.step(Input::TransportOpened);
            let actions = self.conn.step(challenge("nonce-1"));
            sent(&actions).remove(0)
        }

        /// Drive to `Open`.
        fn open(&mut self) {
            let connect = self.handshake();
            let id = connect["id"].as_str().unwrap().to_owned();
            self.conn
                .step(hello_response(&id, json!({"type": "hello-ok", "protocol": 3})));
            assert!(self.conn.is_connected());
        }

        fn request(&mut self, method: &str, params: Value) -> (String, oneshot::Receiver<Result<Value, RequestError>>) {
            let (reply, rx) = oneshot::channel();
            let actions = self.conn.step(Input::Request {
                method: method.into(),
                params: Some(params),
                reply,
            });
            let frame = sent(&actions).remove(0);
            (frame["id"].as_str().unwrap().to_owned(), rx)
        }

        fn close(&mut self, code: u16) -> Vec<Action> {
            self.conn.step(Input::TransportClosed {
                code,
                reason: "gone".into(),
            })
        }
    }

    #[test]
    fn test_start_opens_transport() {
        let mut h = harness();
        let actions = h.conn.step(Input::Start);
        assert_eq!(h.conn.state(), ConnectionState::Connecting);
        assert!(matches!(actions.last(), Some(Action::OpenTransport)));
    }

    #[test]
    fn test_transport_open_waits_for_challenge() {
        let mut h = harness();
        h.conn.step(Input::Start);
        let actions = h.conn.step(Input::TransportOpened);
        assert_eq!(h.conn.state(), ConnectionState::AwaitingChallenge);
        assert!(sent(&actions).is_empty());
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::ArmChallengeTimer(d) if *d == CHALLENGE_FALLBACK)));
    }

    #[test]
    fn test_challenge_triggers_signed_connect() {
        let mut h = harness();
        let connect = h.handshake();
        assert_eq!(h.conn.state(), ConnectionState::Handshaking);
        assert_eq!(connect["type"], "req");
        assert_eq!(connect["method"], "connect");

        let params = &connect["params"];
        assert_eq!(params["minProtocol"], 3);
        assert_eq!(params["role"], "operator");
        assert_eq!(params["scopes"], json!(["operator.admin"]));
        assert_eq!(params["device"]["nonce"], "nonce-1");
        assert_eq!(params["device"]["id"], h.conn.signing().device_id().unwrap());
        assert!(params.get("auth").is_none());
    }

    #[test]
    fn test_challenge_timeout_connects_without_nonce() {
        let mut h = harness();
        h.conn.step(Input::Start);
        h.conn.step(Input::TransportOpened);
        let actions = h.conn.step(Input::ChallengeTimeout);

        let connect = sent(&actions).remove(0);
        assert!(connect["params"]["device"].get("nonce").is_none());
        assert_eq!(h.conn.state(), ConnectionState::Handshaking);

        // A late challenge is not answered twice.
        let actions = h.conn.step(challenge("late"));
        assert!(sent(&actions).is_empty());
    }

    #[test]
    fn test_fallback_hello_resets_backoff() {
        let mut h = harness();
        // Climb the backoff with a few failed attempts.
        h.conn.step(Input::Start);
        for _ in 0..3 {
            h.close(1006);
            h.conn.step(Input::ReconnectTimeout);
        }
        assert_eq!(h.conn.backoff().attempt(), 3);
        assert_eq!(h.conn.backoff().base(), Duration::from_millis(8000));

        h.conn.step(Input::TransportOpened);
        let connect = sent(&h.conn.step(Input::ChallengeTimeout)).remove(0);
        let id = connect["id"].as_str().unwrap();
        let actions = h
            .conn
            .step(hello_response(id, json!({"type": "hello-ok", "protocol": 3})));

        assert_eq!(h.conn.state(), ConnectionState::Open);
        assert_eq!(h.conn.backoff().attempt(), 0);
        assert_eq!(h.conn.backoff().base(), Duration::from_millis(1000));
        assert!(notifications(&actions)
            .iter()
            .any(|n| matches!(n, GatewayNotification::Hello(hello) if hello.protocol == 3)));

        // The next failure reports attempt 1 at the floor.
        let actions = h.close(1006);
        let retry = notifications(&actions)
            .into_iter()
            .find_map(|n| match n {
                GatewayNotification::ReconnectScheduled(r) => Some(*r),
                _ => None,
            })
            .unwrap();
        assert_eq!(retry.attempt, 1);
        assert!(retry.delay >= Duration::from_millis(800) && retry.delay <= Duration::from_millis(1200));
    }

    #[test]
    fn test_request_before_open_fails() {
        let mut h = harness();
        h.conn.step(Input::Start);
        let (reply, mut rx) = oneshot::channel();
        let actions = h.conn.step(Input::Request {
            method: "echo".into(),
            params: None,
            reply,
        });
        assert!(sent(&actions).is_empty());
        assert_eq!(h.conn.pending_requests(), 0);
        assert_eq!(rx.try_recv().unwrap(), Err(RequestError::NotConnected));
    }

    #[test]
    fn test_request_echo() {
        let mut h = harness();
        h.open();
        let (id, mut rx) = h.request("echo", json!({"x": 1}));
        assert_eq!(h.conn.pending_requests(), 1);

        h.conn.step(Input::TransportMessage(
            json!({"type": "res", "id": id, "ok": true, "payload": {"x": 1}}).to_string(),
        ));
        assert_eq!(rx.try_recv().unwrap(), Ok(json!({"x": 1})));
        assert_eq!(h.conn.pending_requests(), 0);
    }

    #[test]
    fn test_responses_routed_by_id() {
        let mut h = harness();
        h.open();
        let (id_a, mut rx_a) = h.request("a", json!(1));
        let (id_b, mut rx_b) = h.request("b", json!(2));

        for (id, value) in [(&id_b, "B"), (&id_a, "A")] {
            h.conn.step(Input::TransportMessage(
                json!({"type": "res", "id": id, "ok": true, "payload": value}).to_string(),
            ));
        }
        assert_eq!(rx_a.try_recv().unwrap(), Ok(json!("A")));
        assert_eq!(rx_b.try_recv().unwrap(), Ok(json!("B")));
    }

    #[test]
    fn test_remote_error_reaches_caller_only() {
        let mut h = harness();
        h.open();
        let (id, mut rx) = h.request("boom", json!(null));
        h.conn.step(Input::TransportMessage(
            json!({"type": "res", "id": id, "ok": false,
                   "error": {"code": "INVALID_REQUEST", "message": "bad", "details": {"f": 1}}})
            .to_string(),
        ));
        let err = rx.try_recv().unwrap().unwrap_err();
        assert_eq!(err.remote_code(), Some("INVALID_REQUEST"));
        assert!(h.conn.is_connected());
    }

    #[test]
    fn test_stop_rejects_all_pending() {
        let mut h = harness();
        h.open();
        let mut receivers: Vec<_> = (0..4).map(|i| h.request("m", json!(i)).1).collect();

        let actions = h.conn.step(Input::Stop);
        assert_eq!(h.conn.state(), ConnectionState::Stopped);
        assert_eq!(h.conn.pending_requests(), 0);
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::CloseTransport { code: CLOSE_NORMAL, .. }
        )));
        for rx in &mut receivers {
            assert_eq!(rx.try_recv().unwrap(), Err(RequestError::Stopped));
        }

        // Idempotent, and no reconnect follows the transport's own close.
        assert!(h.conn.step(Input::Stop).is_empty());
        assert!(h.close(1000).is_empty());
        assert_eq!(h.conn.state(), ConnectionState::Stopped);
    }

    #[test]
    fn test_start_after_stop() {
        let mut h = harness();
        h.conn.step(Input::Start);
        h.conn.step(Input::Stop);
        h.conn.step(Input::ReconnectNow { reset_backoff: true });
        assert_eq!(h.conn.state(), ConnectionState::Stopped);

        h.conn.step(Input::Start);
        assert_eq!(h.conn.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_gap_detection() {
        let mut h = harness();
        h.open();
        let mut gaps = Vec::new();
        let mut delivered = 0;
        for seq in [1, 2, 4] {
            for n in notifications(&h.conn.step(event("chat", seq))) {
                match n {
                    GatewayNotification::Gap(gap) => gaps.push(*gap),
                    GatewayNotification::Event(_) => delivered += 1,
                    _ => {}
                }
            }
        }
        assert_eq!(delivered, 3);
        assert_eq!(gaps.len(), 1);
        assert_eq!((gaps[0].expected, gaps[0].received), (3, 4));
        assert_eq!(h.conn.last_seq(), Some(4));
    }

    #[test]
    fn test_challenge_not_delivered_or_sequenced() {
        let mut h = harness();
        h.open();
        h.conn.step(event("chat", 5));
        let actions = h.conn.step(Input::TransportMessage(
            json!({"type": "event", "event": "connect.challenge", "seq": 99,
                   "payload": {"nonce": "x"}})
            .to_string(),
        ));
        assert!(notifications(&actions).is_empty());
        assert_eq!(h.conn.last_seq(), Some(5));
    }

    #[test]
    fn test_sequence_resets_per_transport() {
        let mut h = harness();
        h.open();
        h.conn.step(event("chat", 10));
        h.close(1006);
        assert_eq!(h.conn.last_seq(), None);
    }

    #[test]
    fn test_malformed_frames_dropped() {
        let mut h = harness();
        h.open();
        for text in ["not json", r#"{"type":"req","id":"1","method":"x"}"#, r#"{"type":"res"}"#] {
            let actions = h.conn.step(Input::TransportMessage(text.into()));
            assert!(actions.is_empty());
        }
        assert!(h.conn.is_connected());
    }

    #[test]
    fn test_close_rejects_and_schedules_reconnect() {
        let mut h = harness();
        h.open();
        let (_, mut rx) = h.request("m", json!(null));

        let actions = h.close(1006);
        assert_eq!(h.conn.state(), ConnectionState::ReconnectScheduled);
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(RequestError::Closed {
                code: 1006,
                reason: "gone".into()
            })
        );
        assert!(matches!(actions.first(), Some(Action::Notify(GatewayNotification::Closed { code: 1006, .. }))));
        assert!(actions.iter().any(|a| matches!(a, Action::ArmReconnectTimer(_))));

        h.conn.step(Input::ReconnectTimeout);
        assert_eq!(h.conn.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_hidden_reconnect_floor() {
        let mut h = harness();
        h.visibility.set_hidden(true);
        h.conn.step(Input::Start);
        let actions = h.close(1006);
        let retry = notifications(&actions)
            .into_iter()
            .find_map(|n| match n {
                GatewayNotification::ReconnectScheduled(r) => Some(*r),
                _ => None,
            })
            .unwrap();
        assert!(retry.hidden);
        assert!(retry.delay >= Duration::from_secs(30));
    }

    #[test]
    fn test_reconnect_disabled_goes_idle() {
        let mut h = harness();
        h.open();
        h.conn.step(Input::SetReconnectEnabled(false));
        let actions = h.close(1006);
        assert_eq!(h.conn.state(), ConnectionState::Idle);
        assert!(!actions.iter().any(|a| matches!(a, Action::ArmReconnectTimer(_))));
    }

    #[test]
    fn test_disabling_cancels_scheduled_reconnect() {
        let mut h = harness();
        h.conn.step(Input::Start);
        h.close(1006);
        let actions = h.conn.step(Input::SetReconnectEnabled(false));
        assert_eq!(h.conn.state(), ConnectionState::Idle);
        assert!(matches!(actions.first(), Some(Action::CancelTimers)));
        assert!(h.conn.step(Input::ReconnectTimeout).is_empty());
    }

    #[test]
    fn test_start_skips_scheduled_reconnect_delay() {
        let mut h = harness();
        h.conn.step(Input::Start);
        h.close(1006);
        assert_eq!(h.conn.state(), ConnectionState::ReconnectScheduled);

        let actions = h.conn.step(Input::Start);
        assert_eq!(h.conn.state(), ConnectionState::Connecting);
        assert!(matches!(actions.first(), Some(Action::CancelTimers)));
        assert!(matches!(actions.last(), Some(Action::OpenTransport)));
        assert!(h.conn.step(Input::ReconnectTimeout).is_empty());
    }

    #[test]
    fn test_start_ignored_while_connected() {
        let mut h = harness();
        h.open();
        assert!(h.conn.step(Input::Start).is_empty());
        assert!(h.conn.is_connected());
    }

    #[test]
    fn test_reconnect_now_discards_transport() {
        let mut h = harness();
        h.open();
        let (_, mut rx) = h.request("m", json!(null));
        h.close(1006);
        h.conn.step(Input::ReconnectTimeout);
        h.conn.step(Input::TransportOpened);
        assert!(h.conn.backoff().attempt() > 0);

        let actions = h.conn.step(Input::ReconnectNow { reset_backoff: true });
        assert_eq!(h.conn.state(), ConnectionState::Connecting);
        assert_eq!(h.conn.backoff().attempt(), 0);
        assert!(actions.iter().any(|a| matches!(a, Action::CloseTransport { .. })));
        assert!(matches!(actions.last(), Some(Action::OpenTransport)));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_every_transition_cancels_timers() {
        let mut h = harness();
        let mut last = h.conn.state();
        let inputs = vec![
            Input::Start,
            Input::TransportOpened,
            Input::ChallengeTimeout,
            Input::TransportClosed {
                code: 1006,
                reason: String::new(),
            },
            Input::ReconnectTimeout,
            Input::Stop,
        ];
        for input in inputs {
            let actions = h.conn.step(input);
            let now = h.conn.state();
            assert_ne!(now, last);
            assert!(actions.iter().any(|a| matches!(a, Action::CancelTimers)));
            last = now;
        }
    }

    #[test]
    fn test_hello_persists_device_token() {
        let mut h = harness();
        let connect = h.handshake();
        let id = connect["id"].as_str().unwrap();
        h.conn.step(hello_response(
            id,
            json!({"type": "hello-ok", "protocol": 3,
                   "auth": {"deviceToken": "issued", "role": "operator", "scopes": ["operator.admin"]}}),
        ));
        let device_id = h.conn.signing().device_id().unwrap();
        assert_eq!(h.tokens.load(device_id, DEFAULT_ROLE).unwrap().token, "issued");
    }

    #[test]
    fn test_token_store_failure_does_not_block_open() {
        struct ReadOnly;
        impl TokenStore for ReadOnly {
            fn load(&self, _: &str, _: &str) -> Option<DeviceToken> {
                None
            }
            fn store(&self, _: &str, _: DeviceToken) -> Result<(), IdentityError> {
                Err(IdentityError::InvalidKey("read-only".into()))
            }
            fn clear(&self, _: &str, _: &str) -> Result<(), IdentityError> {
                Ok(())
            }
        }

        let mut conn = Connection::new(
            SessionConfig::new(HandshakeConfig::new(client_info())),
            SigningCapability::Available(Arc::new(DeviceIdentity::generate())),
            Arc::new(ReadOnly),
            Arc::new(VisibilityFlag::new()),
        );
        conn.step(Input::Start);
        conn.step(Input::TransportOpened);
        let connect = sent(&conn.step(Input::ChallengeTimeout)).remove(0);
        conn.step(hello_response(
            connect["id"].as_str().unwrap(),
            json!({"type": "hello-ok", "protocol": 3, "auth": {"deviceToken": "t"}}),
        ));
        assert!(conn.is_connected());
    }

    #[test]
    fn test_rejected_device_token_falls_back_to_shared() {
        let mut config = SessionConfig::new(HandshakeConfig::new(client_info()));
        config.handshake.token = Some("shared".into());
        let mut h = harness_with(
            config,
            SigningCapability::Available(Arc::new(DeviceIdentity::generate())),
        );
        let device_id = h.conn.signing().device_id().unwrap().to_owned();
        h.tokens
            .store(
                &device_id,
                DeviceToken {
                    token: "device".into(),
                    role: DEFAULT_ROLE.into(),
                    scopes: vec![],
                    updated_at_ms: 0,
                },
            )
            .unwrap();

        let reject = |id: &str| {
            Input::TransportMessage(
                json!({"type": "res", "id": id, "ok": false,
                       "error": {"code": "UNAUTHORIZED", "message": "token mismatch"}})
                .to_string(),
            )
        };

        let mut tokens_used = Vec::new();
        h.conn.step(Input::Start);
        for _ in 0..2 {
            h.conn.step(Input::TransportOpened);
            let connect = sent(&h.conn.step(challenge("n"))).remove(0);
            tokens_used.push(connect["params"]["auth"]["token"].as_str().unwrap().to_owned());

            let actions = h.conn.step(reject(connect["id"].as_str().unwrap()));
            assert!(actions.iter().any(|a| matches!(
                a,
                Action::CloseTransport { code: CLOSE_CONNECT_FAILED, .. }
            )));
            assert!(notifications(&actions).iter().any(|n| matches!(
                n,
                GatewayNotification::Closed { code: CLOSE_CONNECT_FAILED, .. }
            )));
            assert_eq!(h.conn.state(), ConnectionState::ReconnectScheduled);
            h.conn.step(Input::ReconnectTimeout);
        }
        assert!(h.tokens.load(&device_id, DEFAULT_ROLE).is_none());

        h.conn.step(Input::TransportOpened);
        let connect = sent(&h.conn.step(challenge("n"))).remove(0);
        tokens_used.push(connect["params"]["auth"]["token"].as_str().unwrap().to_owned());
        assert_eq!(tokens_used, vec!["device", "shared", "shared"]);
    }

    #[test]
    fn test_tick_watchdog_rearms_while_frames_flow() {
        let mut h = harness();
        let connect = h.handshake();
        let actions = h.conn.step(hello_response(
            connect["id"].as_str().unwrap(),
            json!({"type": "hello-ok", "protocol": 3, "policy": {"tickIntervalMs": 60000}}),
        ));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::ArmTickTimer(d) if *d == Duration::from_secs(60))));

        let actions = h.conn.step(Input::TickTimeout);
        assert!(matches!(actions.as_slice(), [Action::ArmTickTimer(_)]));
        assert!(h.conn.is_connected());
    }

    #[test]
    fn test_unsigned_when_signing_unavailable() {
        let mut config = SessionConfig::new(HandshakeConfig::new(client_info()));
        config.handshake.password = Some("pw".into());
        let mut h = harness_with(config, SigningCapability::Unavailable);
        let connect = h.handshake();
        assert!(connect["params"].get("device").is_none());
        assert_eq!(connect["params"]["auth"], json!({"password": "pw"}));
    }
}
