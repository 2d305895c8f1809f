//! Device identity store.
//!
//! Holds the long-lived Ed25519 device keypair, the capability check that
//! decides whether connect requests are signed, and the persisted
//! device-scoped bearer tokens. Nothing here depends on the session layer.

mod device;
mod signing;
mod token_store;

pub use device::*;
pub use signing::*;
pub use token_store::*;

#[cfg(feature = "file-store")]
use crate::core::IdentityError;

/// Write `contents` to `path`, creating parent directories, readable by the
/// owner only on Unix.
#[cfg(feature = "file-store")]
pub(crate) fn write_private_file(
    path: &std::path::Path,
    contents: &str,
) -> Result<(), IdentityError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}
