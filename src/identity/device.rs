//! Ed25519 device identity.
//!
//! A device is identified by the SHA-256 fingerprint of its public key. The
//! keypair is created once, persisted, and shared read-only by every
//! connect attempt.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::core::{DeviceIdentityProvider, IdentityError, PUBLIC_KEY_SIZE, SECRET_KEY_SIZE};

/// Long-lived device keypair plus its derived device id.
///
/// The secret key is zeroized on drop.
#[derive(Clone)]
pub struct DeviceIdentity {
    device_id: String,
    signing_key: SigningKey,
}

impl DeviceIdentity {
    /// Generate a new random identity.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Rebuild an identity from a 32-byte secret key.
    pub fn from_secret_bytes(secret: &[u8; SECRET_KEY_SIZE]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(secret))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let device_id = fingerprint(signing_key.verifying_key().as_bytes());
        Self {
            device_id,
            signing_key,
        }
    }

    /// Device id (lowercase hex SHA-256 of the raw public key).
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Raw public key.
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Public key as sent on the wire (base64url, no padding).
    pub fn public_key_base64url(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.public_key())
    }

    /// Verifying half of the keypair.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Secret key bytes.
    ///
    /// # Security
    /// Handle with care - this exposes sensitive key material.
    pub fn secret_bytes(&self) -> [u8; SECRET_KEY_SIZE] {
        self.signing_key.to_bytes()
    }

    /// Sign `payload`, returning the base64url signature.
    pub fn sign(&self, payload: &str) -> String {
        let signature = self.signing_key.sign(payload.as_bytes());
        URL_SAFE_NO_PAD.encode(signature.to_bytes())
    }
}

impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .field("signing_key", &"[REDACTED]")
            .finish()
    }
}

/// Derive a device id from a raw public key.
pub fn fingerprint(public_key: &[u8]) -> String {
    hex::encode(Sha256::digest(public_key))
}

/// Identity provider that mints a fresh key on every call.
///
/// Suitable for tests and throwaway tools; the gateway will see a new device
/// each process.
#[derive(Debug, Clone, Copy, Default)]
pub struct EphemeralIdentity;

impl DeviceIdentityProvider for EphemeralIdentity {
    fn load_or_create(&self) -> Result<DeviceIdentity, IdentityError> {
        Ok(DeviceIdentity::generate())
    }
}

/// Identity provider backed by an existing identity.
#[derive(Debug, Clone)]
pub struct FixedIdentity(pub DeviceIdentity);

impl DeviceIdentityProvider for FixedIdentity {
    fn load_or_create(&self) -> Result<DeviceIdentity, IdentityError> {
        Ok(self.0.clone())
    }
}

#[cfg(feature = "file-store")]
pub use file::FileIdentityStore;

#[cfg(feature = "file-store")]
mod file {
    use std::path::{Path, PathBuf};

    use base64::Engine as _;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use serde::{Deserialize, Serialize};
    use tracing::{info, warn};
    use zeroize::{Zeroize, ZeroizeOnDrop};

    use super::DeviceIdentity;
    use crate::core::{
        DeviceIdentityProvider, IdentityError, SECRET_KEY_SIZE, STORE_VERSION, now_ms,
    };
    use crate::identity::write_private_file;

    /// On-disk identity record.
    #[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
    #[serde(rename_all = "camelCase")]
    struct StoredIdentity {
        version: u32,
        device_id: String,
        public_key: String,
        private_key: String,
        created_at_ms: u64,
    }

    /// Identity provider persisting the keypair as a JSON file.
    ///
    /// A missing, unreadable, or inconsistent file (device id not matching
    /// the key) is replaced by a freshly generated identity.
    #[derive(Debug, Clone)]
    pub struct FileIdentityStore {
        path: PathBuf,
    }

    impl FileIdentityStore {
        /// Store the identity at `path`.
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self { path: path.into() }
        }

        /// Location of the identity file.
        pub fn path(&self) -> &Path {
            &self.path
        }

        fn load(&self) -> Result<Option<DeviceIdentity>, IdentityError> {
            let text = match std::fs::read_to_string(&self.path) {
                Ok(text) => text,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            let stored: StoredIdentity = serde_json::from_str(&text)?;
            if stored.version != STORE_VERSION {
                return Ok(None);
            }

            let mut raw = URL_SAFE_NO_PAD
                .decode(stored.private_key.as_bytes())
                .map_err(|e| IdentityError::InvalidKey(e.to_string()))?;
            let secret = <[u8; SECRET_KEY_SIZE]>::try_from(raw.as_slice());
            raw.zeroize();
            let mut secret = secret.map_err(|_| {
                IdentityError::InvalidKey(format!("expected {SECRET_KEY_SIZE} secret key bytes"))
            })?;
            let identity = DeviceIdentity::from_secret_bytes(&secret);
            secret.zeroize();

            if identity.device_id() != stored.device_id
                || identity.public_key_base64url() != stored.public_key
            {
                warn!(path = %self.path.display(), "device identity file is inconsistent");
                return Ok(None);
            }
            Ok(Some(identity))
        }

        fn save(&self, identity: &DeviceIdentity) -> Result<(), IdentityError> {
            let mut secret = identity.secret_bytes();
            let stored = StoredIdentity {
                version: STORE_VERSION,
                device_id: identity.device_id().to_owned(),
                public_key: identity.public_key_base64url(),
                private_key: URL_SAFE_NO_PAD.encode(secret),
                created_at_ms: now_ms(),
            };
            secret.zeroize();
            let mut text = serde_json::to_string_pretty(&stored)?;
            let written = write_private_file(&self.path, &text);
            text.zeroize();
            written
        }
    }

    impl DeviceIdentityProvider for FileIdentityStore {
        fn load_or_create(&self) -> Result<DeviceIdentity, IdentityError> {
            match self.load() {
                Ok(Some(identity)) => return Ok(identity),
                Ok(None) => {}
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "discarding unreadable device identity");
                }
            }

            let identity = DeviceIdentity::generate();
            self.save(&identity)?;
            info!(device_id = %identity.device_id(), "created device identity");
            Ok(identity)
        }
    }
}
