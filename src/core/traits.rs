//! Collaborator traits consumed by the gateway session client.
//!
//! The client never reaches for ambient state: identity, token persistence,
//! and host visibility are all handed in through these seams.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::error::IdentityError;
use crate::identity::{DeviceIdentity, DeviceToken};

/// Source of the long-lived device keypair.
///
/// Called once when the client is built; the resulting identity is shared
/// read-only across every reconnect.
pub trait DeviceIdentityProvider: Send + Sync {
    /// Load the persisted identity, creating and persisting one if absent.
    fn load_or_create(&self) -> Result<DeviceIdentity, IdentityError>;
}

/// Persistence for device-scoped bearer tokens, keyed by (device id, role).
///
/// Implementations MUST make `store` and `clear` idempotent. Writes are
/// last-writer-wins; the client never issues them concurrently.
pub trait TokenStore: Send + Sync {
    /// Look up the token issued to `device_id` for `role`.
    fn load(&self, device_id: &str, role: &str) -> Option<DeviceToken>;

    /// Persist `token` for `device_id` under `token.role`.
    fn store(&self, device_id: &str, token: DeviceToken) -> Result<(), IdentityError>;

    /// Forget the token for (`device_id`, `role`).
    fn clear(&self, device_id: &str, role: &str) -> Result<(), IdentityError>;
}

/// Whether the hosting surface is currently in the foreground.
pub trait Visibility: Send + Sync {
    /// `true` while the host is backgrounded or hidden.
    fn is_hidden(&self) -> bool;
}

/// A host that is always foregrounded (daemons, CLIs).
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysVisible;

impl Visibility for AlwaysVisible {
    fn is_hidden(&self) -> bool {
        false
    }
}

/// Shareable visibility flag the host flips as it moves in and out of view.
#[derive(Debug, Clone, Default)]
pub struct VisibilityFlag {
    hidden: Arc<AtomicBool>,
}

impl VisibilityFlag {
    /// Create a flag starting in the visible state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record whether the host is hidden.
    pub fn set_hidden(&self, hidden: bool) {
        self.hidden.store(hidden, Ordering::Relaxed);
    }
}

impl Visibility for VisibilityFlag {
    fn is_hidden(&self) -> bool {
        self.hidden.load(Ordering::Relaxed)
    }
}
