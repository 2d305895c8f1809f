//! Device-scoped bearer token persistence.

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::{IdentityError, TokenStore};

/// A bearer token the gateway issued to one device for one role.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceToken {
    /// Opaque bearer token.
    pub token: String,
    /// Role the token is valid for.
    pub role: String,
    /// Scopes granted with the token.
    #[serde(default)]
    pub scopes: Vec<String>,
    /// When the token was persisted, ms since the Unix epoch.
    pub updated_at_ms: u64,
}

impl fmt::Debug for DeviceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceToken")
            .field("token", &"[redacted]")
            .field("role", &self.role)
            .field("scopes", &self.scopes)
            .field("updated_at_ms", &self.updated_at_ms)
            .finish()
    }
}

/// Process-local token store.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    tokens: Mutex<HashMap<(String, String), DeviceToken>>,
}

impl MemoryTokenStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored tokens.
    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.tokens.lock().is_empty()
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self, device_id: &str, role: &str) -> Option<DeviceToken> {
        self.tokens
            .lock()
            .get(&(device_id.to_owned(), role.to_owned()))
            .cloned()
    }

    fn store(&self, device_id: &str, token: DeviceToken) -> Result<(), IdentityError> {
        self.tokens
            .lock()
            .insert((device_id.to_owned(), token.role.clone()), token);
        Ok(())
    }

    fn clear(&self, device_id: &str, role: &str) -> Result<(), IdentityError> {
        self.tokens
            .lock()
            .remove(&(device_id.to_owned(), role.to_owned()));
        Ok(())
    }
}

#[cfg(feature = "file-store")]
pub use file::FileTokenStore;

#[cfg(feature = "file-store")]
mod file {
    use std::collections::BTreeMap;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};
    use tracing::{debug, warn};

    use super::DeviceToken;
    use crate::core::{IdentityError, STORE_VERSION, TokenStore};
    use crate::identity::write_private_file;

    /// On-disk token record. Holds tokens for exactly one device.
    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct StoredTokens {
        version: u32,
        device_id: String,
        tokens: BTreeMap<String, DeviceToken>,
    }

    impl StoredTokens {
        fn empty(device_id: &str) -> Self {
            Self {
                version: STORE_VERSION,
                device_id: device_id.to_owned(),
                tokens: BTreeMap::new(),
            }
        }
    }

    /// Token store persisting to a JSON file.
    ///
    /// The file is read once, when the store is created; lookups are then
    /// answered from memory. Inside a tokio runtime, writes go to the
    /// blocking pool so the session task never waits on the disk, and a
    /// failed background write is logged. Outside a runtime they happen
    /// inline.
    ///
    /// The file belongs to a single device; a file written for another
    /// device id reads as empty and is replaced on the next store.
    #[derive(Debug, Clone)]
    pub struct FileTokenStore {
        path: Arc<PathBuf>,
        cached: Arc<Mutex<Option<StoredTokens>>>,
        // Serializes file writes.
        write_lock: Arc<Mutex<()>>,
    }

    impl FileTokenStore {
        /// Store tokens at `path`, loading whatever it already holds.
        pub fn new(path: impl Into<PathBuf>) -> Self {
            let path = path.into();
            let cached = read_file(&path);
            Self {
                path: Arc::new(path),
                cached: Arc::new(Mutex::new(cached)),
                write_lock: Arc::new(Mutex::new(())),
            }
        }

        /// Location of the token file.
        pub fn path(&self) -> &Path {
            &self.path
        }

        /// Apply `change` to the tokens of `device_id` and persist when it
        /// reports a modification.
        fn update(
            &self,
            device_id: &str,
            change: impl FnOnce(&mut BTreeMap<String, DeviceToken>) -> bool,
        ) -> Result<(), IdentityError> {
            let changed = {
                let mut cached = self.cached.lock();
                let mut stored = match cached.take() {
                    Some(stored) if stored.device_id == device_id => stored,
                    _ => StoredTokens::empty(device_id),
                };
                let changed = change(&mut stored.tokens);
                *cached = Some(stored);
                changed
            };
            if changed { self.persist() } else { Ok(()) }
        }

        fn persist(&self) -> Result<(), IdentityError> {
            let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                return flush(&self.path, &self.cached, &self.write_lock);
            };
            let store = self.clone();
            runtime.spawn_blocking(move || {
                if let Err(e) = flush(&store.path, &store.cached, &store.write_lock) {
                    warn!(path = %store.path.display(), error = %e, "failed to write device tokens");
                }
            });
            Ok(())
        }
    }

    fn read_file(path: &Path) -> Option<StoredTokens> {
        let text = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str::<StoredTokens>(&text) {
            Ok(stored) if stored.version == STORE_VERSION => Some(stored),
            Ok(stored) => {
                debug!(version = stored.version, "ignoring token file of another version");
                None
            }
            Err(e) => {
                debug!(error = %e, "ignoring unreadable token file");
                None
            }
        }
    }

    /// Write the current in-memory tokens. Each write takes the latest
    /// snapshot, so the file ends up matching memory whatever order queued
    /// writes run in.
    fn flush(
        path: &Path,
        cached: &Mutex<Option<StoredTokens>>,
        write_lock: &Mutex<()>,
    ) -> Result<(), IdentityError> {
        let _guard = write_lock.lock();
        let Some(stored) = cached.lock().clone() else {
            return Ok(());
        };
        let text = serde_json::to_string_pretty(&stored)?;
        write_private_file(path, &text)
    }

    impl TokenStore for FileTokenStore {
        fn load(&self, device_id: &str, role: &str) -> Option<DeviceToken> {
            self.cached
                .lock()
                .as_ref()
                .filter(|stored| stored.device_id == device_id)
                .and_then(|stored| stored.tokens.get(role).cloned())
        }

        fn store(&self, device_id: &str, token: DeviceToken) -> Result<(), IdentityError> {
            self.update(device_id, |tokens| {
                tokens.insert(token.role.clone(), token);
                true
            })
        }

        fn clear(&self, device_id: &str, role: &str) -> Result<(), IdentityError> {
            self.update(device_id, |tokens| {
                let removed = tokens.remove(role).is_some();
                if !removed {
                    debug!(role, "no device token to clear");
                }
                removed
            })
        }
    }
}
