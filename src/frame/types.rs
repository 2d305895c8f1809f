//! Wire frame shapes.
//!
//! Field names are contractual with the gateway; Rust fields are renamed to
//! the camelCase wire names and optional fields are omitted when absent.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{EVENT_CONNECT_CHALLENGE, HELLO_OK_TYPE};

// =============================================================================
// ERROR SHAPE
// =============================================================================

/// Structured application error carried by a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorShape {
    /// Machine-readable code, e.g. `NOT_FOUND`.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Opaque details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    /// Whether the gateway considers the call retryable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    /// Suggested retry delay.
    #[serde(
        rename = "retryAfterMs",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub retry_after_ms: Option<u64>,
}

impl ErrorShape {
    /// Create an error shape with just a code and a message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            retryable: None,
            retry_after_ms: None,
        }
    }

    /// Fallback used when a response has `ok: false` but no error body.
    pub(crate) fn unknown() -> Self {
        Self::new("UNAVAILABLE", "request failed")
    }
}

// =============================================================================
// GENERIC FRAMES
// =============================================================================

/// Client → gateway request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    /// Always `"req"`.
    pub r#type: String,
    /// Correlation id, unique per connection.
    pub id: String,
    /// Remote method name.
    pub method: String,
    /// Opaque parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RequestFrame {
    /// Build a request frame.
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            r#type: "req".into(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// Gateway → client response, matched to a request by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    /// Correlation id of the originating request.
    pub id: String,
    /// Whether the call succeeded.
    pub ok: bool,
    /// Success payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Failure body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResponseFrame {
    /// Collapse into exactly one resolution path.
    pub fn into_result(self) -> Result<Value, ErrorShape> {
        if self.ok {
            Ok(self.payload.unwrap_or(Value::Null))
        } else {
            Err(self.error.unwrap_or_else(ErrorShape::unknown))
        }
    }
}

/// Gateway → client push event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    /// Event name.
    pub event: String,
    /// Opaque payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Monotonic sequence number, used only for gap detection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    /// Opaque state version vector.
    #[serde(
        rename = "stateVersion",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub state_version: Option<Value>,
}

impl EventFrame {
    /// Nonce of a `connect.challenge` event, `None` for every other event.
    pub fn challenge_nonce(&self) -> Option<&str> {
        if self.event != EVENT_CONNECT_CHALLENGE {
            return None;
        }
        self.payload.as_ref()?.get("nonce")?.as_str()
    }

    /// Whether this is the handshake challenge (even a malformed one).
    pub fn is_challenge(&self) -> bool {
        self.event == EVENT_CONNECT_CHALLENGE
    }
}

/// Every frame shape the client accepts from the gateway.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// `type: "res"`.
    Response(ResponseFrame),
    /// `type: "event"`.
    Event(EventFrame),
}

// =============================================================================
// CONNECT HANDSHAKE
// =============================================================================

/// Identification of the connecting client software.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Client identifier, e.g. `control-ui`.
    pub id: String,
    /// Optional display name.
    #[serde(
        rename = "displayName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub display_name: Option<String>,
    /// Client version.
    pub version: String,
    /// Host platform.
    pub platform: String,
    /// Client mode, e.g. `webchat` or `cli`.
    pub mode: String,
    /// Per-process instance id.
    #[serde(rename = "instanceId", default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

/// Signed proof of device identity attached to a connect request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProof {
    /// Device id (fingerprint of the public key).
    pub id: String,
    /// Base64url public key.
    #[serde(rename = "publicKey")]
    pub public_key: String,
    /// Base64url signature over the device auth payload.
    pub signature: String,
    /// Signing timestamp, ms since the Unix epoch.
    #[serde(rename = "signedAt")]
    pub signed_at: u64,
    /// Challenge nonce echoed into the signature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// Bearer credentials attached to a connect request.
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConnectAuth {
    /// Device-scoped or shared bearer token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Shared password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl fmt::Debug for ConnectAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectAuth")
            .field("token", &self.token.as_ref().map(|_| "[redacted]"))
            .field("password", &self.password.as_ref().map(|_| "[redacted]"))
            .finish()
    }
}

/// Parameters of the `connect` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectParams {
    /// Lowest acceptable protocol version.
    #[serde(rename = "minProtocol")]
    pub min_protocol: u32,
    /// Highest acceptable protocol version.
    #[serde(rename = "maxProtocol")]
    pub max_protocol: u32,
    /// Client software identification.
    pub client: ClientInfo,
    /// Requested role.
    pub role: String,
    /// Requested capability scopes.
    pub scopes: Vec<String>,
    /// Signed device proof, absent when signing is unavailable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceProof>,
    /// Bearer credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<ConnectAuth>,
    /// User agent string.
    #[serde(rename = "userAgent")]
    pub user_agent: String,
    /// Preferred locale.
    pub locale: String,
}

/// Method/event catalogue advertised by the gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Features {
    /// Callable methods.
    #[serde(default)]
    pub methods: Vec<String>,
    /// Pushed events.
    #[serde(default)]
    pub events: Vec<String>,
}

/// Credentials issued by the gateway on a successful handshake.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloAuth {
    /// Device-scoped bearer token to persist.
    #[serde(
        rename = "deviceToken",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub device_token: Option<String>,
    /// Role the token is valid for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Granted scopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    /// Issue time, ms since the Unix epoch.
    #[serde(rename = "issuedAtMs", default, skip_serializing_if = "Option::is_none")]
    pub issued_at_ms: Option<u64>,
}

impl fmt::Debug for HelloAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HelloAuth")
            .field("device_token", &self.device_token.as_ref().map(|_| "[redacted]"))
            .field("role", &self.role)
            .field("scopes", &self.scopes)
            .field("issued_at_ms", &self.issued_at_ms)
            .finish()
    }
}

/// Connection policy announced by the gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloPolicy {
    /// Heartbeat interval.
    #[serde(
        rename = "tickIntervalMs",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub tick_interval_ms: Option<u64>,
    /// Largest frame the gateway accepts.
    #[serde(rename = "maxPayload", default, skip_serializing_if = "Option::is_none")]
    pub max_payload: Option<u64>,
    /// Send buffer limit before the gateway drops the connection.
    #[serde(
        rename = "maxBufferedBytes",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub max_buffered_bytes: Option<u64>,
}

/// Payload of a successful `connect` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloOk {
    /// Always `"hello-ok"`.
    pub r#type: String,
    /// Negotiated protocol version.
    pub protocol: u32,
    /// Opaque server description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<Value>,
    /// Advertised methods and events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<Features>,
    /// Opaque initial state snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Value>,
    /// Issued credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<HelloAuth>,
    /// Connection policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<HelloPolicy>,
}

impl HelloOk {
    /// Minimal hello for a negotiated protocol version.
    pub fn new(protocol: u32) -> Self {
        Self {
            r#type: HELLO_OK_TYPE.into(),
            protocol,
            server: None,
            features: None,
            snapshot: None,
            auth: None,
            policy: None,
        }
    }

    /// Negotiated tick interval, if the gateway announced one.
    pub fn tick_interval_ms(&self) -> Option<u64> {
        self.policy.as_ref()?.tick_interval_ms.filter(|ms| *ms > 0)
    }
}
