//! Gateway tail
//!
//! Connects to a gateway, prints every pushed event, and optionally calls a
//! single method once the session opens.
//!
//! Environment variables:
//! - GATEWAY_URL, GATEWAY_TOKEN, GATEWAY_PASSWORD, GATEWAY_ROLE,
//!   GATEWAY_SCOPES, GATEWAY_CLIENT_ID, GATEWAY_LOCALE: client configuration
//! - GATEWAY_STATE_DIR: where the device identity and tokens live (default ./.gateway)
//! - GATEWAY_CALL_METHOD: method to call after each successful handshake
//! - GATEWAY_CALL_PARAMS: JSON params for that call
//! - GATEWAY_LOG: log filter (default info)

use std::sync::Arc;

use gateway_session::prelude::*;
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
enum TailError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("GATEWAY_CALL_PARAMS is not valid JSON: {0}")]
    Params(#[from] serde_json::Error),
}

struct Call {
    method: String,
    params: Option<Value>,
}

impl Call {
    fn from_env() -> Result<Option<Self>, TailError> {
        let Some(method) = env("GATEWAY_CALL_METHOD") else {
            return Ok(None);
        };
        let params = env("GATEWAY_CALL_PARAMS")
            .map(|raw| serde_json::from_str(&raw))
            .transpose()?;
        Ok(Some(Self { method, params }))
    }
}

fn env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("GATEWAY_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "gateway-tail failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), TailError> {
    let config = GatewayClientBuilder::from_env().mode("cli").build()?;
    let call = Call::from_env()?.map(Arc::new);
    let state_dir = env("GATEWAY_STATE_DIR").unwrap_or_else(|| "./.gateway".into());

    info!(url = %config.url, state_dir = %state_dir, "connecting");
    let (client, mut notifications) =
        GatewayClient::new(config, Collaborators::persistent(WebSocketConnector::new(), &state_dir));
    let client = Arc::new(client);
    client.start();

    loop {
        tokio::select! {
            notification = notifications.recv() => {
                let Some(notification) = notification else { break };
                handle(&client, call.as_ref(), notification);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                client.stop();
                break;
            }
        }
    }
    Ok(())
}

fn handle(client: &Arc<GatewayClient>, call: Option<&Arc<Call>>, notification: GatewayNotification) {
    match notification {
        GatewayNotification::Hello(hello) => {
            info!(protocol = hello.protocol, device = ?client.device_id(), "session open");
            if let Some(call) = call {
                let client = Arc::clone(client);
                let call = Arc::clone(call);
                tokio::spawn(async move {
                    match client.request(call.method.as_str(), call.params.clone()).await {
                        Ok(result) => println!("{} -> {result}", call.method),
                        Err(e) => warn!(method = %call.method, error = %e, "call failed"),
                    }
                });
            }
        }
        GatewayNotification::Event(event) => {
            let payload = event.payload.unwrap_or(Value::Null);
            match event.seq {
                Some(seq) => println!("[{seq}] {} {payload}", event.event),
                None => println!("{} {payload}", event.event),
            }
        }
        GatewayNotification::Gap(gap) => {
            warn!(expected = gap.expected, received = gap.received, "missed {} events", gap.missed());
        }
        GatewayNotification::Closed { code, reason } => info!(code, %reason, "closed"),
        GatewayNotification::ReconnectScheduled(retry) => {
            info!(attempt = retry.attempt, delay_ms = retry.delay.as_millis() as u64, hidden = retry.hidden, "reconnect scheduled");
        }
        GatewayNotification::StateChanged(state) => tracing::debug!(%state, "state"),
    }
}
