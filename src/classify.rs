//! Verdict classification over a job's attempt sequence. Pure, no I/O.
use crate::types::{AttemptOutcome, Verdict};

/// Counters derived from one job's ordered attempt sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptStats {
    pub attempts: u32,
    pub count_success: u32,
    /// Non-successful attempts that did not abort the loop.
    pub total_timeout: u32,
    /// Longest run of contiguous `Timeout` outcomes.
    pub consecutive_timeout_max: u32,
    /// Code of the most recent non-successful attempt.
    pub last_code: String,
    pub aborted: bool,
}

impl AttemptStats {
    pub fn from_attempts(attempts: &[AttemptOutcome]) -> Self {
        let mut stats = AttemptStats {
            attempts: attempts.len() as u32,
            ..Default::default()
        };
        let mut run = 0u32;
        for outcome in attempts {
            match outcome {
                AttemptOutcome::Success => {
                    stats.count_success += 1;
                    run = 0;
                }
                AttemptOutcome::Timeout => {
                    stats.total_timeout += 1;
                    run += 1;
                    stats.consecutive_timeout_max = stats.consecutive_timeout_max.max(run);
                }
                AttemptOutcome::Error { fatal, .. } => {
                    if *fatal {
                        stats.aborted = true;
                    } else {
                        stats.total_timeout += 1;
                    }
                    run = 0;
                }
            }
            if !matches!(outcome, AttemptOutcome::Success) {
                stats.last_code = outcome.code().to_string();
            }
        }
        stats
    }
}

/// Classify a finished attempt sequence.
///
/// A timeout run reaching `threshold` wins over everything else, then a job
/// with no success at all is `Unknown`, then a full, non-aborted sequence of
/// successes is `NotAffected`. Anything else is `Unknown`.
pub fn classify(stats: &AttemptStats, repeat: u32, threshold: u32) -> Verdict {
    if stats.consecutive_timeout_max >= threshold {
        return Verdict::Affected;
    }
    if stats.count_success == 0 {
        return Verdict::Unknown;
    }
    if !stats.aborted && stats.count_success == repeat {
        return Verdict::NotAffected;
    }
    Verdict::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;
    use AttemptOutcome::{Success, Timeout};

    fn verdict(attempts: &[AttemptOutcome], repeat: u32, threshold: u32) -> Verdict {
        classify(&AttemptStats::from_attempts(attempts), repeat, threshold)
    }

    #[test]
    fn all_successes_not_affected() {
        let attempts = [Success, Success, Success];
        let stats = AttemptStats::from_attempts(&attempts);
        assert_eq!(stats.count_success, 3);
        assert_eq!(stats.last_code, "");
        assert_eq!(verdict(&attempts, 3, 2), Verdict::NotAffected);
    }

    #[test]
    fn all_timeouts_affected() {
        let attempts = [Timeout, Timeout, Timeout];
        let stats = AttemptStats::from_attempts(&attempts);
        assert_eq!(stats.consecutive_timeout_max, 3);
        assert_eq!(stats.total_timeout, 3);
        assert_eq!(stats.last_code, "timeout");
        assert_eq!(verdict(&attempts, 3, 2), Verdict::Affected);
    }

    #[test]
    fn fatal_first_attempt_unknown() {
        let attempts = [AttemptOutcome::fatal_error("Connection refused (os error 111)")];
        let stats = AttemptStats::from_attempts(&attempts);
        assert_eq!(stats.attempts, 1);
        assert!(stats.aborted);
        assert_eq!(stats.total_timeout, 0);
        assert_eq!(stats.last_code, "Connection refused (os error 111)");
        assert_eq!(verdict(&attempts, 3, 2), Verdict::Unknown);
    }

    #[test]
    fn trailing_timeouts_after_success_affected() {
        let attempts = [Success, Timeout, Timeout];
        assert_eq!(
            AttemptStats::from_attempts(&attempts).consecutive_timeout_max,
            2
        );
        assert_eq!(verdict(&attempts, 3, 2), Verdict::Affected);
    }

    #[test]
    fn success_resets_timeout_run() {
        let attempts = [Timeout, Success, Timeout, Success];
        let stats = AttemptStats::from_attempts(&attempts);
        assert_eq!(stats.consecutive_timeout_max, 1);
        assert_eq!(stats.total_timeout, 2);
        assert_eq!(verdict(&attempts, 4, 2), Verdict::Unknown);
    }

    #[test]
    fn soft_errors_break_runs_but_count_as_failures() {
        let attempts = [
            Timeout,
            AttemptOutcome::soft_error("no_answer"),
            Timeout,
            Success,
        ];
        let stats = AttemptStats::from_attempts(&attempts);
        assert_eq!(stats.consecutive_timeout_max, 1);
        assert_eq!(stats.total_timeout, 3);
        assert_eq!(stats.last_code, "timeout");
        assert_eq!(verdict(&attempts, 4, 2), Verdict::Unknown);
    }

    #[test]
    fn fatal_after_success_is_unknown() {
        let attempts = [Success, AttemptOutcome::fatal_error("reset")];
        assert_eq!(verdict(&attempts, 2, 2), Verdict::Unknown);
        // Even if the aborted sequence happens to have `repeat` successes.
        let attempts = [Success, AttemptOutcome::fatal_error("reset")];
        assert_eq!(verdict(&attempts, 1, 2), Verdict::Unknown);
    }

    #[test]
    fn threshold_is_inclusive() {
        let attempts = [Success, Timeout, Timeout, Timeout, Success];
        assert_eq!(verdict(&attempts, 5, 3), Verdict::Affected);
        assert_eq!(verdict(&attempts, 5, 4), Verdict::Unknown);
    }
}
