// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Retry policy for job attempts: exponential backoff + jitter.
//
// Classifies errors into Transient (send the job round again) and Permanent
// (report it to the cloud as failed).  Only transient errors are retried, and
// only while the job has attempts left.

use std::time::Duration;

use cloudspool_core::error::CloudSpoolError;
use cloudspool_core::types::ErrorClass;
use tracing::{debug, info, warn};

/// How often and how patiently a failed job is sent round again.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts per job, the first one included.
    pub max_attempts: u32,
    /// Base delay between attempts (exponential backoff).
    pub base_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(120),
        }
    }
}

/// What happens to a job after a failed attempt.
#[derive(Debug)]
pub enum RetryDecision {
    /// Queue the job again after this delay.
    RetryAfter(Duration),
    /// Do not retry: the error is permanent.
    GiveUp,
    /// Maximum attempts used up.
    Exhausted,
}

/// Classify a `CloudSpoolError` for retry decisions.
pub fn classify_error(err: &CloudSpoolError) -> ErrorClass {
    match err {
        // Transient: network, timeouts, busy printers
        CloudSpoolError::Spooler(_)
        | CloudSpoolError::SpoolerRejected(_)
        | CloudSpoolError::SpoolerTimeout(_)
        | CloudSpoolError::Cloud(_)
        | CloudSpoolError::Auth(_)
        | CloudSpoolError::Enrichment(_)
        | CloudSpoolError::UnknownPrinter(_)
        | CloudSpoolError::Cancelled => ErrorClass::Transient,

        // Permanent: the same job would fail the same way again
        CloudSpoolError::InvalidTicket(_)
        | CloudSpoolError::JobAborted(_)
        | CloudSpoolError::Config(_)
        | CloudSpoolError::MonitorSocketInUse(_)
        | CloudSpoolError::CloudIdReassigned { .. }
        | CloudSpoolError::IllegalTransition { .. }
        | CloudSpoolError::ShutDown
        | CloudSpoolError::Serialization(_) => ErrorClass::Permanent,

        // A missing or unreadable file will not appear on its own
        CloudSpoolError::Io(io_err) => match io_err.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                ErrorClass::Permanent
            }
            _ => ErrorClass::Transient,
        },
    }
}

/// Decide what happens after attempt number `attempt` (1-based) failed.
pub fn should_retry(err: &CloudSpoolError, attempt: u32, config: &RetryConfig) -> RetryDecision {
    match classify_error(err) {
        ErrorClass::Permanent => {
            info!(error = %err, "permanent error, not retrying");
            RetryDecision::GiveUp
        }
        ErrorClass::Transient => {
            if attempt >= config.max_attempts {
                warn!(attempt, max = config.max_attempts, "attempt limit exhausted");
                RetryDecision::Exhausted
            } else {
                let delay = compute_delay(attempt.saturating_sub(1), config);
                debug!(attempt, delay_ms = delay.as_millis(), "scheduling retry");
                RetryDecision::RetryAfter(delay)
            }
        }
    }
}

/// Backoff before retry number `retry` (0-based): the base delay doubled per
/// retry, plus a jitter below one base delay, never above `max_delay`.
pub fn compute_delay(retry: u32, config: &RetryConfig) -> Duration {
    let doubled = config.base_delay.saturating_mul(1 << retry.min(10));
    let spread = config.base_delay.mul_f64(jitter_fraction(retry));
    doubled.saturating_add(spread).min(config.max_delay)
}

/// Deterministic fraction in [0, 1) so that jobs failing together do not
/// come back in lockstep.
fn jitter_fraction(retry: u32) -> f64 {
    let mixed = u64::from(retry + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    (mixed >> 11) as f64 / (1u64 << 53) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }

    #[test]
    fn spooler_hiccups_are_transient() {
        for err in [
            CloudSpoolError::SpoolerRejected("printer offline".into()),
            CloudSpoolError::SpoolerTimeout(Duration::from_secs(30)),
            CloudSpoolError::Cloud("502 from fetch".into()),
        ] {
            assert_eq!(classify_error(&err), ErrorClass::Transient, "{err}");
        }
    }

    #[test]
    fn bad_ticket_and_aborted_job_are_permanent() {
        for err in [
            CloudSpoolError::InvalidTicket("unknown media".into()),
            CloudSpoolError::JobAborted("filter failed".into()),
        ] {
            assert_eq!(classify_error(&err), ErrorClass::Permanent, "{err}");
        }
    }

    #[test]
    fn last_attempt_is_exhausted() {
        let config = policy(3);
        let err = CloudSpoolError::Cloud("connection reset".into());
        for attempt in 1..3 {
            assert!(matches!(
                should_retry(&err, attempt, &config),
                RetryDecision::RetryAfter(_)
            ));
        }
        assert!(matches!(should_retry(&err, 3, &config), RetryDecision::Exhausted));
    }

    #[test]
    fn permanent_failure_gives_up_on_first_attempt() {
        let err = CloudSpoolError::InvalidTicket("copies=-1".into());
        assert!(matches!(should_retry(&err, 1, &policy(5)), RetryDecision::GiveUp));
    }

    #[test]
    fn backoff_doubles_within_jitter() {
        let config = policy(10);
        for retry in 0..4 {
            let delay = compute_delay(retry, &config);
            let floor = config.base_delay * (1 << retry);
            assert!(delay >= floor && delay < floor + config.base_delay, "retry {retry}: {delay:?}");
        }
    }

    #[test]
    fn backoff_never_exceeds_cap() {
        let config = policy(10);
        assert_eq!(compute_delay(30, &config), config.max_delay);
    }
}
