//! Protocol constants for the gateway session protocol.
//!
//! Wire-level values (method names, close codes, protocol range) are fixed
//! by the gateway and MUST NOT be changed. Timing values are defaults that
//! [`BackoffPolicy`](crate::session::BackoffPolicy) and the client config
//! may override.

use std::time::Duration;

// =============================================================================
// PROTOCOL
// =============================================================================

/// Lowest protocol version this client speaks.
pub const MIN_PROTOCOL_VERSION: u32 = 3;

/// Highest protocol version this client speaks.
pub const MAX_PROTOCOL_VERSION: u32 = 3;

/// Method name of the handshake request.
pub const METHOD_CONNECT: &str = "connect";

/// Event name of the server-pushed handshake challenge.
pub const EVENT_CONNECT_CHALLENGE: &str = "connect.challenge";

/// Event name of the server heartbeat.
pub const EVENT_TICK: &str = "tick";

/// `type` discriminator of a successful handshake payload.
pub const HELLO_OK_TYPE: &str = "hello-ok";

/// Role requested when none is configured.
pub const DEFAULT_ROLE: &str = "operator";

/// Scope requested when none is configured.
pub const DEFAULT_SCOPE: &str = "operator.admin";

// =============================================================================
// CLOSE CODES
// =============================================================================

/// Normal closure (user-initiated stop or discarded transport).
pub const CLOSE_NORMAL: u16 = 1000;

/// Transport dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Generic policy violation, as produced by the gateway itself.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// No frame arrived within twice the negotiated tick interval.
pub const CLOSE_TICK_TIMEOUT: u16 = 4000;

/// The gateway explicitly rejected this client's connect request.
///
/// Distinct from [`CLOSE_POLICY_VIOLATION`] so observers can tell a rejected
/// handshake apart from an ordinary drop.
pub const CLOSE_CONNECT_FAILED: u16 = 4008;

// =============================================================================
// TIMING
// =============================================================================

/// How long to wait for `connect.challenge` before connecting without a nonce.
pub const CHALLENGE_FALLBACK: Duration = Duration::from_millis(750);

/// Reconnect delay floor (pre-jitter), also the value after a reset.
pub const BACKOFF_FLOOR: Duration = Duration::from_millis(1000);

/// Reconnect delay ceiling (pre-jitter).
pub const BACKOFF_CEILING: Duration = Duration::from_millis(15000);

/// Minimum reconnect delay while the host is hidden.
pub const HIDDEN_RECONNECT_FLOOR: Duration = Duration::from_millis(30000);

/// Relative jitter applied to each reconnect delay (0.2 = ±20%).
pub const BACKOFF_JITTER: f64 = 0.2;

/// Multiplier applied to the tick interval before the watchdog closes.
pub const TICK_MISS_FACTOR: u32 = 2;

// =============================================================================
// DEVICE IDENTITY
// =============================================================================

/// Ed25519 public key size.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Ed25519 secret key size.
pub const SECRET_KEY_SIZE: usize = 32;

/// Version tag of persisted identity and token files.
pub const STORE_VERSION: u32 = 1;

// =============================================================================
// CLIENT
// =============================================================================

/// Notifications buffered for observers before new ones are dropped.
pub const NOTIFICATION_CAPACITY: usize = 1024;
