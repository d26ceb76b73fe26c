use async_trait::async_trait;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::debug;

use crate::classify::{classify, AttemptStats};
use crate::config::ProbeConfig;
use crate::types::{AttemptOutcome, Job, JobResult};

/// One network attempt against one target.
///
/// Implementations must bound every network call by `timeout` and report
/// failures as outcomes, never as panics.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn attempt(&self, job: &Job, timeout: Duration) -> AttemptOutcome;

    /// Name of the target as written to the `domain`/`addr` column.
    fn target(&self, job: &Job) -> String;
}

/// Run the full repeat loop for one job and classify it.
///
/// Attempts are strictly sequential. A fatal outcome stops the loop; the
/// result is classified from what was observed so far.
pub async fn run_job(probe: &dyn Probe, job: &Job, config: &ProbeConfig) -> JobResult {
    let target = probe.target(job);
    let mut attempts = Vec::with_capacity(config.repeat as usize);

    for i in 0..config.repeat {
        let outcome = probe.attempt(job, config.timeout).await;
        debug!("{target}: attempt {} -> {:?}", i + 1, outcome);
        let fatal = outcome.is_fatal();
        let pause = match outcome {
            AttemptOutcome::Timeout => config.backoff,
            _ => config.interval,
        };
        attempts.push(outcome);
        if fatal {
            break;
        }
        if i + 1 < config.repeat && !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
    }

    job_result(target, job, attempts, config)
}

/// Classify `attempts` observed for `job` into its final result.
pub fn job_result(
    target: String,
    job: &Job,
    attempts: Vec<AttemptOutcome>,
    config: &ProbeConfig,
) -> JobResult {
    let stats = AttemptStats::from_attempts(&attempts);
    let verdict = classify(&stats, config.repeat, config.threshold);
    JobResult {
        target,
        payload: job.payload_hex(),
        attempts,
        count_success: stats.count_success,
        total_timeout: stats.total_timeout,
        consecutive_timeout_max: stats.consecutive_timeout_max,
        last_code: stats.last_code,
        verdict,
        end_time: OffsetDateTime::now_utc(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DomainJob, Verdict};
    use std::sync::Mutex;

    /// Replays a fixed list of outcomes, one per attempt.
    struct Scripted {
        outcomes: Mutex<Vec<AttemptOutcome>>,
    }

    impl Scripted {
        fn new(mut outcomes: Vec<AttemptOutcome>) -> Self {
            outcomes.reverse();
            Self { outcomes: Mutex::new(outcomes) }
        }
    }

    #[async_trait]
    impl Probe for Scripted {
        async fn attempt(&self, _job: &Job, _timeout: Duration) -> AttemptOutcome {
            self.outcomes
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(AttemptOutcome::Success)
        }

        fn target(&self, _job: &Job) -> String {
            "scripted".into()
        }
    }

    fn quick(repeat: u32, threshold: u32) -> ProbeConfig {
        ProbeConfig {
            repeat,
            threshold,
            interval: Duration::ZERO,
            backoff: Duration::ZERO,
            ..Default::default()
        }
    }

    fn job() -> Job {
        DomainJob::new("example.com").unwrap().into()
    }

    #[tokio::test]
    async fn runs_exactly_repeat_attempts() {
        let probe = Scripted::new(vec![]);
        let res = run_job(&probe, &job(), &quick(4, 2)).await;
        assert_eq!(res.attempts.len(), 4);
        assert_eq!(res.count_success, 4);
        assert_eq!(res.verdict, Verdict::NotAffected);
        assert_eq!(res.payload, None);
    }

    #[tokio::test]
    async fn fatal_error_stops_loop() {
        let probe = Scripted::new(vec![
            AttemptOutcome::Success,
            AttemptOutcome::fatal_error("connection reset"),
            AttemptOutcome::Success,
        ]);
        let res = run_job(&probe, &job(), &quick(3, 2)).await;
        assert_eq!(res.attempts.len(), 2);
        assert_eq!(res.last_code, "connection reset");
        assert_eq!(res.verdict, Verdict::Unknown);
    }

    #[tokio::test]
    async fn soft_errors_do_not_stop_loop() {
        let probe = Scripted::new(vec![
            AttemptOutcome::soft_error("no_answer"),
            AttemptOutcome::soft_error("error_503"),
        ]);
        let res = run_job(&probe, &job(), &quick(3, 2)).await;
        assert_eq!(res.attempts.len(), 3);
        assert_eq!(res.count_success, 1);
        assert_eq!(res.total_timeout, 2);
        assert_eq!(res.last_code, "error_503");
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_follows_timeouts() {
        let probe = Scripted::new(vec![AttemptOutcome::Timeout, AttemptOutcome::Success]);
        let cfg = ProbeConfig {
            repeat: 3,
            interval: Duration::from_secs(1),
            backoff: Duration::from_secs(10),
            ..Default::default()
        };
        let start = tokio::time::Instant::now();
        run_job(&probe, &job(), &cfg).await;
        // backoff after attempt 1, interval after attempt 2, nothing after the last
        assert_eq!(start.elapsed(), Duration::from_secs(11));
    }
}
