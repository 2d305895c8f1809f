//! Push-event sequence tracking.
//!
//! Events stamped with a `seq` are expected to arrive in order. A jump
//! forward is reported as a gap; duplicates and regressions are not. The
//! last observed value is overwritten on every stamped event, so a
//! regression moves the baseline backwards rather than being ignored.

/// A detected hole in the event sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceGap {
    /// The sequence number that should have arrived next.
    pub expected: u64,
    /// The sequence number that did arrive.
    pub received: u64,
}

impl SequenceGap {
    /// Number of events skipped.
    pub fn missed(&self) -> u64 {
        self.received - self.expected
    }
}

/// Tracks the last sequence number seen on the current transport.
#[derive(Debug, Clone, Default)]
pub struct EventSequencer {
    last_seq: Option<u64>,
}

impl EventSequencer {
    /// Create a tracker with no baseline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Last sequence number observed, if any.
    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }

    /// Record an event's `seq`, reporting a gap if one was skipped.
    ///
    /// Events without a sequence number leave the baseline untouched.
    pub fn observe(&mut self, seq: Option<u64>) -> Option<SequenceGap> {
        let seq = seq?;
        let gap = match self.last_seq {
            Some(last) if seq > last.saturating_add(1) => Some(SequenceGap {
                expected: last + 1,
                received: seq,
            }),
            _ => None,
        };
        self.last_seq = Some(seq);
        gap
    }

    /// Forget the baseline. Called whenever a new transport is opened.
    pub fn reset(&mut self) {
        self.last_seq = None;
    }
}
