//! Request/response correlation.
//!
//! Each outstanding request owns a one-shot completion keyed by its frame
//! id. A completion fires at most once: either with the response, or with
//! the teardown cause when the transport goes away.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::core::RequestError;
use crate::frame::ResponseFrame;

/// Completion handle for one request.
pub type Reply = oneshot::Sender<Result<Value, RequestError>>;

/// Map of in-flight request ids to their completions.
#[derive(Debug, Default)]
pub struct RequestCorrelator {
    pending: HashMap<String, Reply>,
}

impl RequestCorrelator {
    /// Create an empty correlator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Whether `id` is outstanding.
    pub fn contains(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    /// Track `reply` under `id`.
    ///
    /// Hands the reply back if `id` is already outstanding.
    pub fn register(&mut self, id: String, reply: Reply) -> Result<(), Reply> {
        if self.pending.contains_key(&id) {
            return Err(reply);
        }
        self.pending.insert(id, reply);
        Ok(())
    }

    /// Complete the request matching `frame.id`.
    ///
    /// Returns `false` for unknown ids; such frames are dropped.
    pub fn resolve(&mut self, frame: ResponseFrame) -> bool {
        let Some(reply) = self.pending.remove(&frame.id) else {
            debug!(id = %frame.id, "dropping response for unknown request");
            return false;
        };
        // The caller may have stopped waiting; that is not an error here.
        let _ = reply.send(frame.into_result().map_err(RequestError::Remote));
        true
    }

    /// Fail every outstanding request with `error`, returning how many there were.
    pub fn reject_all(&mut self, error: RequestError) -> usize {
        let count = self.pending.len();
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(error.clone()));
        }
        count
    }
}
