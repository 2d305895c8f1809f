//! Handshake signing capability.
//!
//! Whether the client can prove its device identity is decided once, when
//! the client is built. Every connect attempt then asks the capability for a
//! proof; an unavailable capability yields none and the handshake falls back
//! to bearer credentials alone.

use std::sync::Arc;

use tracing::warn;

use super::device::DeviceIdentity;
use crate::core::DeviceIdentityProvider;
use crate::frame::DeviceProof;

/// Fields covered by the device signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAuthPayload<'a> {
    /// Device id.
    pub device_id: &'a str,
    /// Client identifier.
    pub client_id: &'a str,
    /// Client mode.
    pub client_mode: &'a str,
    /// Requested role.
    pub role: &'a str,
    /// Requested scopes.
    pub scopes: &'a [String],
    /// Signing time, ms since the Unix epoch.
    pub signed_at_ms: u64,
    /// Bearer token sent alongside the proof.
    pub token: Option<&'a str>,
    /// Challenge nonce, when one arrived.
    pub nonce: Option<&'a str>,
}

impl DeviceAuthPayload<'_> {
    /// Canonical `|`-joined string that gets signed.
    ///
    /// `v2` payloads append the challenge nonce; `v1` payloads are used when
    /// the client connected without one.
    pub fn canonical(&self) -> String {
        let version = if self.nonce.is_some() { "v2" } else { "v1" };
        let signed_at = self.signed_at_ms.to_string();
        let scopes = self.scopes.join(",");
        let mut parts = vec![
            version,
            self.device_id,
            self.client_id,
            self.client_mode,
            self.role,
            scopes.as_str(),
            signed_at.as_str(),
            self.token.unwrap_or_default(),
        ];
        if let Some(nonce) = self.nonce {
            parts.push(nonce);
        }
        parts.join("|")
    }
}

/// Whether this process can sign connect requests.
#[derive(Debug, Clone)]
pub enum SigningCapability {
    /// A device identity is loaded and can sign.
    Available(Arc<DeviceIdentity>),
    /// No identity; authenticate with bearer credentials only.
    Unavailable,
}

impl SigningCapability {
    /// Probe `provider` once. A failing provider degrades to
    /// [`SigningCapability::Unavailable`] rather than erroring.
    pub fn detect(provider: &dyn DeviceIdentityProvider) -> Self {
        match provider.load_or_create() {
            Ok(identity) => Self::Available(Arc::new(identity)),
            Err(e) => {
                warn!(error = %e, "device identity unavailable; using bearer auth only");
                Self::Unavailable
            }
        }
    }

    /// Whether device proofs can be produced.
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available(_))
    }

    /// Device id of the loaded identity.
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Self::Available(identity) => Some(identity.device_id()),
            Self::Unavailable => None,
        }
    }

    /// Sign `payload` into a wire proof.
    ///
    /// Returns `None` when signing is unavailable.
    pub fn prove(&self, payload: &DeviceAuthPayload<'_>) -> Option<DeviceProof> {
        let Self::Available(identity) = self else {
            return None;
        };
        Some(DeviceProof {
            id: identity.device_id().to_owned(),
            public_key: identity.public_key_base64url(),
            signature: identity.sign(&payload.canonical()),
            signed_at: payload.signed_at_ms,
            nonce: payload.nonce.map(str::to_owned),
        })
    }
}
