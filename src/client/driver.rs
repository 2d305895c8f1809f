//! Background task that executes the state machine's actions.
//!
//! The driver is the only owner of the [`Connection`], the live transport,
//! and the timers. Commands, transport events, and timer firings are
//! processed one at a time from a single `select!`, so no two transitions
//! ever interleave.

use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::{Sleep, sleep};
use tracing::{debug, trace};

use crate::core::CLOSE_NORMAL;
use crate::frame::HelloOk;
use crate::session::{Action, Connection, ConnectionState, GatewayNotification, Input};
use crate::transport::{Connector, TransportEvent, TransportEvents, TransportHandle, TransportSink};

type Timer = Option<Pin<Box<Sleep>>>;

#[derive(Default)]
struct Timers {
    challenge: Timer,
    reconnect: Timer,
    tick: Timer,
}

impl Timers {
    fn cancel(&mut self) {
        self.challenge = None;
        self.reconnect = None;
        self.tick = None;
    }
}

fn arm(delay: Duration) -> Timer {
    Some(Box::pin(sleep(delay)))
}

async fn fire(timer: &mut Timer) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

enum Wake {
    Command(Option<Input>),
    Transport(Option<(u64, TransportEvent)>),
    Challenge,
    Reconnect,
    Tick,
}

/// Channels the driver publishes on.
pub(crate) struct Outputs {
    pub notifications: mpsc::Sender<GatewayNotification>,
    pub state: watch::Sender<ConnectionState>,
    pub hello: watch::Sender<Option<Arc<HelloOk>>>,
}

pub(crate) struct Driver {
    url: String,
    machine: Connection,
    connector: Arc<dyn Connector>,
    commands: mpsc::UnboundedReceiver<Input>,
    sink: TransportSink,
    events: TransportEvents,
    transport: Option<TransportHandle>,
    generation: u64,
    timers: Timers,
    outputs: Outputs,
    dropped_notifications: u64,
}

impl Driver {
    pub(crate) fn new(
        url: String,
        machine: Connection,
        connector: Arc<dyn Connector>,
        commands: mpsc::UnboundedReceiver<Input>,
        outputs: Outputs,
    ) -> Self {
        let (sink, events) = TransportSink::channel(0);
        Self {
            url,
            machine,
            connector,
            commands,
            sink,
            events,
            transport: None,
            generation: 0,
            timers: Timers::default(),
            outputs,
            dropped_notifications: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            let wake = tokio::select! {
                command = self.commands.recv() => Wake::Command(command),
                event = self.events.recv() => Wake::Transport(event),
                () = fire(&mut self.timers.challenge) => Wake::Challenge,
                () = fire(&mut self.timers.reconnect) => Wake::Reconnect,
                () = fire(&mut self.timers.tick) => Wake::Tick,
            };

            let input = match wake {
                Wake::Command(Some(input)) => input,
                Wake::Command(None) => {
                    // Every client handle is gone.
                    self.apply(Input::Stop);
                    break;
                }
                Wake::Transport(Some((generation, event))) => {
                    if generation != self.generation {
                        trace!(generation, current = self.generation, "stale transport event");
                        continue;
                    }
                    match event {
                        TransportEvent::Opened => Input::TransportOpened,
                        TransportEvent::Message(text) => Input::TransportMessage(text),
                        TransportEvent::Closed { code, reason } => {
                            self.transport = None;
                            Input::TransportClosed { code, reason }
                        }
                    }
                }
                // The driver holds a sender, so the channel never closes.
                Wake::Transport(None) => continue,
                Wake::Challenge => {
                    self.timers.challenge = None;
                    Input::ChallengeTimeout
                }
                Wake::Reconnect => {
                    self.timers.reconnect = None;
                    Input::ReconnectTimeout
                }
                Wake::Tick => {
                    self.timers.tick = None;
                    Input::TickTimeout
                }
            };
            self.apply(input);
        }
        debug!("gateway driver finished");
    }

    fn apply(&mut self, input: Input) {
        for action in self.machine.step(input) {
            self.execute(action);
        }
        let state = self.machine.state();
        self.outputs.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    fn execute(&mut self, action: Action) {
        match action {
            Action::OpenTransport => {
                if let Some(stale) = self.transport.take() {
                    stale.close(CLOSE_NORMAL, "superseded");
                }
                self.generation += 1;
                let sink = self.sink.with_generation(self.generation);
                debug!(generation = self.generation, url = %self.url, "opening transport");
                self.transport = Some(self.connector.open(&self.url, sink));
            }
            Action::Send(text) => match &self.transport {
                Some(transport) => {
                    if !transport.send_text(text) {
                        debug!("transport gone; frame dropped");
                    }
                }
                None => debug!("no transport; frame dropped"),
            },
            Action::CloseTransport { code, reason } => {
                if let Some(transport) = self.transport.take() {
                    transport.close(code, reason);
                }
                // Whatever the closed transport reports from now on is stale.
                self.generation += 1;
            }
            Action::CancelTimers => self.timers.cancel(),
            Action::ArmChallengeTimer(delay) => self.timers.challenge = arm(delay),
            Action::ArmReconnectTimer(delay) => self.timers.reconnect = arm(delay),
            Action::ArmTickTimer(delay) => self.timers.tick = arm(delay),
            Action::Notify(notification) => {
                if let GatewayNotification::Hello(hello) = &notification {
                    self.outputs.hello.send_replace(Some(Arc::clone(hello)));
                }
                match self.outputs.notifications.try_send(notification) {
                    Ok(()) => {}
                    Err(TrySendError::Full(dropped)) => {
                        self.dropped_notifications += 1;
                        debug!(
                            dropped = self.dropped_notifications,
                            kind = dropped.kind(),
                            "notification queue full; dropping"
                        );
                    }
                    // Observers stopped listening.
                    Err(TrySendError::Closed(_)) => {}
                }
            }
        }
    }
}
