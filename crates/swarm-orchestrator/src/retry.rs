//! Retry timing.
//!
//! Delays grow exponentially with the number of retries already scheduled,
//! get heavier with consecutive failures, and are jittered by a factor
//! derived from a SHA-256 hash of the record state so that identical state
//! always yields the identical delay.

use crate::record::{RetryLifecycle, TaskStatus};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Why a retry is being scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryReason {
    /// The worker did not finish before the deadline.
    Timeout,
    /// The transport refused or failed the send.
    TransportFailure,
    /// Sending after an approval failed.
    ApprovalReleaseFailed,
}

impl RetryReason {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryReason::Timeout => "timeout",
            RetryReason::TransportFailure => "transport_failure",
            RetryReason::ApprovalReleaseFailed => "approval_release_failed",
        }
    }

    /// Parse a stored reason; unknown values read as [`RetryReason::Timeout`].
    pub fn parse(value: &str) -> Self {
        match value {
            "transport_failure" => RetryReason::TransportFailure,
            "approval_release_failed" => RetryReason::ApprovalReleaseFailed,
            _ => RetryReason::Timeout,
        }
    }

    /// Status a record ends in when this reason exhausts its retries.
    pub fn terminal_status(&self) -> TaskStatus {
        match self {
            RetryReason::Timeout => TaskStatus::TimedOut,
            RetryReason::TransportFailure | RetryReason::ApprovalReleaseFailed => TaskStatus::TransportError,
        }
    }

    fn penalty(&self) -> f64 {
        match self {
            RetryReason::Timeout => 1.0,
            RetryReason::TransportFailure | RetryReason::ApprovalReleaseFailed => 1.25,
        }
    }
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of the retry delay curve.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay of the first retry before any factor applies.
    pub base_delay_ms: i64,
    /// Cap applied before and after jitter.
    pub max_delay_ms: i64,
    /// Clamped to `[0, 1]`.
    pub jitter_ratio: f64,
    /// Scheduled retries allowed per send attempt in the budget.
    pub cycle_multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter_ratio: 0.2,
            cycle_multiplier: 4,
        }
    }
}

impl RetryPolicy {
    /// Upper bound on scheduled retries for a record with `max_retries`.
    pub fn max_cycles(&self, max_retries: u32) -> u32 {
        max_retries.saturating_add(1).saturating_mul(self.cycle_multiplier.max(1))
    }

    /// Delay before capping and jitter.
    pub fn base_delay(&self, reason: RetryReason, lifecycle: &RetryLifecycle) -> f64 {
        let base = self.base_delay_ms.max(0) as f64;
        if base == 0.0 {
            return 0.0;
        }
        let exponent = lifecycle.scheduled_count.min(62) as i32;
        let failure_factor = 1.0 + f64::from(lifecycle.consecutive_failures.min(4)) * 0.15;
        base * 2f64.powi(exponent) * failure_factor * reason.penalty()
    }

    /// Deterministic delay in ms for the next retry.
    ///
    /// With `jitter_ratio <= 1/3` the delay never decreases as
    /// `scheduled_count` grows, as long as the unjittered delay is under the
    /// cap.
    pub fn compute_delay(
        &self,
        task_id: &str,
        reason: RetryReason,
        lifecycle: &RetryLifecycle,
        attempts: u32,
        updated_at: i64,
    ) -> i64 {
        let cap = self.max_delay_ms.max(0) as f64;
        let capped = self.base_delay(reason, lifecycle).min(cap);

        let ratio = if self.jitter_ratio.is_finite() {
            self.jitter_ratio.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let u = jitter_unit(task_id, reason, lifecycle, attempts, updated_at);
        let factor = 1.0 - ratio + 2.0 * ratio * u;

        (capped * factor).min(cap).max(0.0).round() as i64
    }
}

/// A value in `[0, 1]` from the first 8 bytes (big-endian) of
/// `sha256("taskId|reason|scheduledCount|consecutiveFailures|attempts|updatedAt")`.
pub fn jitter_unit(
    task_id: &str,
    reason: RetryReason,
    lifecycle: &RetryLifecycle,
    attempts: u32,
    updated_at: i64,
) -> f64 {
    let seed = format!(
        "{task_id}|{}|{}|{}|{attempts}|{updated_at}",
        reason.as_str(),
        lifecycle.scheduled_count,
        lifecycle.consecutive_failures
    );
    let digest = Sha256::digest(seed.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes) as f64 / u64::MAX as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lifecycle(scheduled: u32, failures: u32) -> RetryLifecycle {
        RetryLifecycle {
            scheduled_count: scheduled,
            consecutive_failures: failures,
            ..RetryLifecycle::new(8)
        }
    }

    #[test]
    fn test_base_delay_formula() {
        let policy = RetryPolicy {
            base_delay_ms: 100,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.base_delay(RetryReason::Timeout, &lifecycle(0, 0)), 100.0);
        assert_eq!(policy.base_delay(RetryReason::Timeout, &lifecycle(2, 0)), 400.0);
        // 100 * 2 * 1.3 * 1.25
        let delay = policy.base_delay(RetryReason::TransportFailure, &lifecycle(1, 2));
        assert!((delay - 325.0).abs() < 1e-9);
        // failure factor stops growing after four
        assert_eq!(
            policy.base_delay(RetryReason::Timeout, &lifecycle(0, 4)),
            policy.base_delay(RetryReason::Timeout, &lifecycle(0, 9))
        );
    }

    #[test]
    fn test_delay_is_deterministic() {
        let policy = RetryPolicy::default();
        let lc = lifecycle(1, 1);
        let a = policy.compute_delay("task-1", RetryReason::Timeout, &lc, 1, 1_000);
        let b = policy.compute_delay("task-1", RetryReason::Timeout, &lc, 1, 1_000);
        assert_eq!(a, b);
    }

    #[test]
    fn test_jitter_stays_within_ratio_and_cap() {
        let policy = RetryPolicy {
            base_delay_ms: 1_000,
            max_delay_ms: 5_000,
            jitter_ratio: 0.2,
            cycle_multiplier: 4,
        };
        for updated_at in 0..50 {
            let lc = lifecycle(0, 0);
            let d = policy.compute_delay("t", RetryReason::Timeout, &lc, 1, updated_at);
            assert!((800..=1_200).contains(&d), "delay {d} outside jitter band");

            let big = lifecycle(10, 0);
            let capped = policy.compute_delay("t", RetryReason::Timeout, &big, 1, updated_at);
            assert!(capped <= 5_000);
            assert!(capped >= 4_000);
        }
    }

    #[test]
    fn test_zero_jitter_is_exact() {
        let policy = RetryPolicy {
            base_delay_ms: 40,
            max_delay_ms: 30_000,
            jitter_ratio: 0.0,
            cycle_multiplier: 4,
        };
        // 40 * 1.3 * 1.25
        assert_eq!(policy.compute_delay("t", RetryReason::TransportFailure, &lifecycle(0, 2), 1, 0), 65);
    }

    #[test]
    fn test_delay_never_decreases_before_cap() {
        let default_policy = RetryPolicy::default();
        let wide_jitter = RetryPolicy {
            base_delay_ms: 40,
            max_delay_ms: 60_000,
            jitter_ratio: 1.0 / 3.0,
            cycle_multiplier: 4,
        };
        let reasons = [RetryReason::Timeout, RetryReason::TransportFailure, RetryReason::ApprovalReleaseFailed];

        for policy in [&default_policy, &wide_jitter] {
            let cap = policy.max_delay_ms as f64;
            for task_id in ["task-1", "gated", "wf-node-7"] {
                for updated_at in [0, 1_000, 123_456, 1_700_000_000_000] {
                    for reason in reasons {
                        for failures in [0, 2, 4] {
                            let mut previous = None;
                            let mut scheduled = 0;
                            while policy.base_delay(reason, &lifecycle(scheduled, failures)) <= cap {
                                let delay = policy.compute_delay(
                                    task_id,
                                    reason,
                                    &lifecycle(scheduled, failures),
                                    1,
                                    updated_at,
                                );
                                if let Some(previous) = previous {
                                    assert!(
                                        delay >= previous,
                                        "{task_id} {reason} failures={failures} seed={updated_at}: \
                                         delay {delay} at scheduledCount {scheduled} < {previous}"
                                    );
                                }
                                previous = Some(delay);
                                scheduled += 1;
                            }
                            assert!(scheduled >= 4, "sweep stopped after {scheduled} steps");

                            // Past the cap every delay stays in the jitter band below it.
                            let capped = policy.compute_delay(task_id, reason, &lifecycle(scheduled + 3, failures), 1, updated_at);
                            assert!(capped as f64 <= cap);
                            assert!(capped as f64 >= (cap * (1.0 - policy.jitter_ratio)).floor());
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_max_cycles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_cycles(1), 8);
        assert_eq!(policy.max_cycles(0), 4);
    }

    #[test]
    fn test_unit_in_range() {
        for n in 0..100 {
            let u = jitter_unit(&format!("t{n}"), RetryReason::Timeout, &lifecycle(0, 0), 0, 0);
            assert!((0.0..=1.0).contains(&u));
        }
    }
}
