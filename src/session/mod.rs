//! Session layer.
//!
//! Everything that decides what happens on the wire lives here, free of I/O:
//!
//! - [`Connection`]: the state machine, one instance per logical session
//! - [`RequestCorrelator`]: in-flight request bookkeeping
//! - [`EventSequencer`]: gap detection on the push stream
//! - [`Backoff`]: jittered, visibility-aware reconnect delays
//! - [`AuthSession`]: credentials and nonce for one connect attempt

mod backoff;
mod correlator;
mod handshake;
mod machine;
mod notify;
mod sequencer;

pub use backoff::*;
pub use correlator::*;
pub use handshake::*;
pub use machine::*;
pub use notify::*;
pub use sequencer::*;
