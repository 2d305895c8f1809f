//! Core constants, error types, and collaborator traits.

use std::time::{SystemTime, UNIX_EPOCH};

pub mod constants;
mod error;
mod traits;

pub use constants::*;
pub use error::*;
pub use traits::*;

/// Wall-clock milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
