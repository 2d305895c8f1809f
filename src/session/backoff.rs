//! Reconnect backoff scheduling.
//!
//! The pre-jitter base starts at the floor and doubles after every scheduled
//! reconnect up to the ceiling; each delay is the base scaled by a uniform
//! jitter factor. While the host is hidden the delay never drops below the
//! hidden floor.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::core::{BACKOFF_CEILING, BACKOFF_FLOOR, BACKOFF_JITTER, HIDDEN_RECONNECT_FLOOR};

/// Tunable reconnect policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BackoffPolicy {
    /// Initial pre-jitter delay, and the value restored on success.
    pub floor_ms: u64,
    /// Largest pre-jitter delay.
    pub ceiling_ms: u64,
    /// Smallest delay while the host is hidden.
    pub hidden_floor_ms: u64,
    /// Relative jitter; 0.2 draws the factor from [0.8, 1.2].
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            floor_ms: BACKOFF_FLOOR.as_millis() as u64,
            ceiling_ms: BACKOFF_CEILING.as_millis() as u64,
            hidden_floor_ms: HIDDEN_RECONNECT_FLOOR.as_millis() as u64,
            jitter: BACKOFF_JITTER,
        }
    }
}

impl BackoffPolicy {
    /// Delay for a pre-jitter `base_ms`, given a uniform `unit` sample in [0, 1).
    ///
    /// `unit = 0` yields the low edge of the jitter band, `unit → 1` the high
    /// edge. Pure so the bounds can be checked directly.
    pub fn delay_for(&self, base_ms: u64, hidden: bool, unit: f64) -> Duration {
        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = 1.0 - jitter + 2.0 * jitter * unit.clamp(0.0, 1.0);
        let mut delay_ms = (base_ms as f64 * factor).round() as u64;
        if hidden {
            delay_ms = delay_ms.max(self.hidden_floor_ms);
        }
        Duration::from_millis(delay_ms)
    }

    /// Base that follows `base_ms` after one more failure.
    pub fn next_base(&self, base_ms: u64) -> u64 {
        base_ms.saturating_mul(2).min(self.ceiling_ms.max(self.floor_ms))
    }
}

/// One scheduled reconnect, as reported to observers.
///
/// Carries no close reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledReconnect {
    /// 1-based attempt number since the last successful handshake.
    pub attempt: u32,
    /// Jittered delay before the attempt.
    pub delay: Duration,
    /// Whether the host was hidden when the delay was computed.
    pub hidden: bool,
}

/// Mutable backoff state owned by one connection.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    base_ms: u64,
    attempt: u32,
}

impl Backoff {
    /// Start at the policy floor with no attempts.
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            base_ms: policy.floor_ms,
            attempt: 0,
        }
    }

    /// Current pre-jitter base.
    pub fn base(&self) -> Duration {
        Duration::from_millis(self.base_ms)
    }

    /// Reconnects scheduled since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Policy in effect.
    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Compute the next reconnect and advance the base for the failure after it.
    pub fn schedule<R: Rng + ?Sized>(&mut self, hidden: bool, rng: &mut R) -> ScheduledReconnect {
        self.attempt = self.attempt.saturating_add(1);
        let delay = self.policy.delay_for(self.base_ms, hidden, rng.r#gen::<f64>());
        self.base_ms = self.policy.next_base(self.base_ms);
        ScheduledReconnect {
            attempt: self.attempt,
            delay,
            hidden,
        }
    }

    /// Restore the floor and forget previous attempts (after a successful
    /// handshake or an explicit reset).
    pub fn reset(&mut self) {
        self.base_ms = self.policy.floor_ms;
        self.attempt = 0;
    }
}
