//! Retry and backoff policy.
//!
//! Pure functions over attempt numbers. The queue stores the policy with the
//! job; the worker asks it for the next delay after every non-terminal
//! attempt.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay strategy between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Constant delay regardless of attempt number. Used for polling loops
    /// where the external operation has a natural cadence.
    Fixed { delay_ms: u64 },
    /// `base * 2^(attempt-1)`, optionally capped. Used for transient-failure
    /// retries.
    Exponential {
        base_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cap_ms: Option<u64>,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base_ms: 1_000,
            cap_ms: None,
        }
    }
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed {
            delay_ms: delay.as_millis() as u64,
        }
    }

    pub fn exponential(base: Duration) -> Self {
        Self::Exponential {
            base_ms: base.as_millis() as u64,
            cap_ms: None,
        }
    }

    pub fn exponential_capped(base: Duration, cap: Duration) -> Self {
        Self::Exponential {
            base_ms: base.as_millis() as u64,
            cap_ms: Some(cap.as_millis() as u64),
        }
    }

    /// Delay before the attempt following `attempt` (1-based: pass the number
    /// of attempts already made).
    pub fn next_delay(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            Self::Exponential { base_ms, cap_ms } => {
                let attempt = attempt.max(1);
                // Saturate instead of wrapping once the doubling overflows u64.
                let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
                let raw = base_ms.saturating_mul(factor);
                let capped = match cap_ms {
                    Some(cap) => raw.min(*cap),
                    None => raw,
                };
                Duration::from_millis(capped)
            }
        }
    }
}

/// Attempt budget for a poll loop: how many fixed-interval checks fit in a
/// total wall-clock budget. The queue's own retry exhaustion then enforces
/// the timeout; there is no separate timer.
pub fn attempts_for_budget(max_total: Duration, poll_interval: Duration) -> u32 {
    let total = max_total.as_millis();
    let interval = poll_interval.as_millis().max(1);
    (total.div_ceil(interval)).max(1) as u32
}
