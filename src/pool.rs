//! Bounded worker pool that drives probe jobs from a FIFO queue.
//!
//! Each worker takes one job, runs its full attempt loop via
//! [`run_job`](crate::probe::run_job), publishes the result to the sink and
//! only then asks for the next job.
use anyhow::{bail, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinSet;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{error, info, warn};

use crate::config::ProbeConfig;
use crate::probe::{job_result, run_job, Probe};
use crate::sink::RecordSink;
use crate::types::{AttemptOutcome, Job, JobResult};

/// Jobs submitted but not yet turned into a result.
#[derive(Debug, Default)]
struct Pending {
    count: AtomicUsize,
    zero: Notify,
}

impl Pending {
    fn add(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn done(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.zero.notify_waiters();
        }
    }

    async fn wait_zero(&self) {
        loop {
            let notified = self.zero.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub struct WorkerPool {
    jobs: mpsc::UnboundedSender<Job>,
    pending: Arc<Pending>,
    cancel: CancellationToken,
    workers: JoinSet<()>,
}

impl WorkerPool {
    /// Spawn `config.workers` workers sharing one job queue.
    pub fn start(
        config: Arc<ProbeConfig>,
        probe: Arc<dyn Probe>,
        sink: RecordSink<JobResult>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<Job>();
        let queue = Arc::new(Mutex::new(rx));
        let pending = Arc::new(Pending::default());
        let cancel = CancellationToken::new();
        let mut workers = JoinSet::new();

        for id in 0..config.workers.max(1) {
            workers.spawn(worker(
                id,
                queue.clone(),
                config.clone(),
                probe.clone(),
                sink.clone(),
                pending.clone(),
                cancel.clone(),
            ));
        }

        Self { jobs: tx, pending, cancel, workers }
    }

    /// Queue a job. Fails only after shutdown has begun.
    pub fn submit(&self, job: Job) -> Result<()> {
        if self.cancel.is_cancelled() {
            bail!("worker pool is shutting down");
        }
        self.pending.add();
        if self.jobs.send(job).is_err() {
            self.pending.done();
            bail!("worker pool queue is closed");
        }
        Ok(())
    }

    /// Number of submitted jobs that have not produced a result yet.
    pub fn pending(&self) -> usize {
        self.pending.count.load(Ordering::SeqCst)
    }

    /// Wait until every submitted job has produced a result.
    pub async fn drain(&self) {
        self.pending.wait_zero().await;
    }

    /// Drain, then stop every worker and wait for them to exit.
    pub async fn shutdown(self) {
        self.drain().await;
        self.stop(None).await;
    }

    /// Stop without draining: idle workers exit at once, busy workers get
    /// `grace` to finish their current job before being aborted.
    pub async fn abort(self, grace: Duration) {
        self.stop(Some(grace)).await;
    }

    async fn stop(self, grace: Option<Duration>) {
        let WorkerPool { jobs, cancel, mut workers, .. } = self;
        cancel.cancel();
        drop(jobs);
        let join_all = async {
            while let Some(res) = workers.join_next().await {
                if let Err(e) = res {
                    if !e.is_cancelled() {
                        warn!("worker task failed: {e}");
                    }
                }
            }
        };
        match grace {
            None => join_all.await,
            Some(grace) => {
                if time::timeout(grace, join_all).await.is_err() {
                    warn!("workers still busy after {:?}; aborting", grace);
                    workers.abort_all();
                    while workers.join_next().await.is_some() {}
                }
            }
        }
    }
}

/// Marks one job as done when dropped, including on panic or abort.
struct PendingGuard(Arc<Pending>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.done();
    }
}

async fn worker(
    id: usize,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<Job>>>,
    config: Arc<ProbeConfig>,
    probe: Arc<dyn Probe>,
    sink: RecordSink<JobResult>,
    pending: Arc<Pending>,
    cancel: CancellationToken,
) {
    loop {
        let job = {
            let mut rx = queue.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                job = rx.recv() => job,
            }
        };
        let Some(job) = job else { break };
        let _done = PendingGuard(pending.clone());

        let target = probe.target(&job);
        info!("worker {id} is testing {target}");
        // A panicking probe must still yield a result for its job.
        let task = AbortOnDropHandle::new(tokio::spawn({
            let (probe, job, config) = (probe.clone(), job.clone(), config.clone());
            async move { run_job(probe.as_ref(), &job, &config).await }
        }));
        let result = match task.await {
            Ok(result) => result,
            Err(e) => {
                error!("worker {id} failed while testing {target}: {e}");
                let outcome = AttemptOutcome::fatal_error(format!("worker panicked: {e}"));
                job_result(target.clone(), &job, vec![outcome], &config)
            }
        };
        info!("worker {id} finished testing {target}: {}", result.verdict);
        sink.push(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink;
    use crate::types::{DomainJob, Verdict};
    use async_trait::async_trait;
    use std::collections::HashSet;

    struct Echo;

    #[async_trait]
    impl Probe for Echo {
        async fn attempt(&self, _job: &Job, _timeout: Duration) -> AttemptOutcome {
            tokio::task::yield_now().await;
            AttemptOutcome::Success
        }

        fn target(&self, job: &Job) -> String {
            match job {
                Job::Domain(d) => d.domain().to_string(),
                Job::Payload(_) => String::new(),
            }
        }
    }

    fn config(workers: usize) -> Arc<ProbeConfig> {
        Arc::new(ProbeConfig {
            workers,
            repeat: 2,
            interval: Duration::ZERO,
            backoff: Duration::ZERO,
            ..Default::default()
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn every_job_yields_one_result() {
        let (tx, mut drain) = sink::channel();
        let pool = WorkerPool::start(config(4), Arc::new(Echo), tx);
        for i in 0..100 {
            pool.submit(DomainJob::new(format!("d{i}.example")).unwrap().into()).unwrap();
        }
        pool.drain().await;
        assert_eq!(pool.pending(), 0);
        pool.shutdown().await;

        let mut seen = HashSet::new();
        while let Some(r) = drain.recv().await {
            assert_eq!(r.attempts.len(), 2);
            assert!(seen.insert(r.target));
        }
        assert_eq!(seen.len(), 100);
    }

    /// Panics for one target, succeeds for the rest.
    struct Fragile;

    #[async_trait]
    impl Probe for Fragile {
        async fn attempt(&self, job: &Job, _timeout: Duration) -> AttemptOutcome {
            if self.target(job) == "boom.example" {
                panic!("resolver state corrupted");
            }
            AttemptOutcome::Success
        }

        fn target(&self, job: &Job) -> String {
            Echo.target(job)
        }
    }

    #[tokio::test]
    async fn panicking_job_still_yields_result() {
        let (tx, mut drain) = sink::channel();
        let pool = WorkerPool::start(config(2), Arc::new(Fragile), tx);
        pool.submit(DomainJob::new("boom.example").unwrap().into()).unwrap();
        pool.submit(DomainJob::new("fine.example").unwrap().into()).unwrap();
        time::timeout(Duration::from_secs(5), pool.drain())
            .await
            .expect("drain hung after a panicking job");
        assert_eq!(pool.pending(), 0);
        pool.shutdown().await;

        let mut results = Vec::new();
        while let Some(r) = drain.recv().await {
            results.push(r);
        }
        results.sort_by(|a, b| a.target.cmp(&b.target));
        assert_eq!(results.len(), 2);
        let boom = &results[0];
        assert_eq!(boom.target, "boom.example");
        assert_eq!(boom.attempts.len(), 1);
        assert!(boom.attempts[0].is_fatal());
        assert!(boom.last_code.starts_with("worker panicked"));
        assert_eq!(boom.verdict, Verdict::Unknown);
        assert_eq!(results[1].verdict, Verdict::NotAffected);
    }

    #[tokio::test]
    async fn drain_on_idle_pool_returns() {
        let (tx, _drain) = sink::channel();
        let pool = WorkerPool::start(config(2), Arc::new(Echo), tx);
        pool.drain().await;
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn abort_stops_idle_workers() {
        let (tx, mut drain) = sink::channel::<JobResult>();
        let pool = WorkerPool::start(config(3), Arc::new(Echo), tx);
        pool.abort(Duration::from_secs(1)).await;
        assert!(drain.recv().await.is_none());
    }
}
