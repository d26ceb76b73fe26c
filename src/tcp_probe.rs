use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time;
use tracing::trace;

use crate::probe::Probe;
use crate::types::{AttemptOutcome, Job};

/// Connects to `host:port` and writes the job's payload.
///
/// - Connect and write are each bounded by the attempt timeout.
/// - After a successful write the connection is held open for `hold`, then closed.
/// - Any non-timeout I/O error (refused, unreachable, reset) is fatal for the job.
pub struct TcpProbe {
    host: String,
    hold: Duration,
}

impl TcpProbe {
    pub fn new(host: impl Into<String>, hold: Duration) -> Self {
        Self { host: host.into(), hold }
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

#[async_trait]
impl Probe for TcpProbe {
    async fn attempt(&self, job: &Job, timeout: Duration) -> AttemptOutcome {
        let Job::Payload(job) = job else {
            return AttemptOutcome::fatal_error("TCP probe only accepts payload jobs");
        };

        let connect = time::timeout(timeout, TcpStream::connect((self.host.as_str(), job.port())));
        let mut stream = match connect.await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return io_outcome(e),
            Err(_) => return AttemptOutcome::Timeout,
        };

        match time::timeout(timeout, stream.write_all(job.payload())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return io_outcome(e),
            Err(_) => return AttemptOutcome::Timeout,
        }
        trace!("sent {} bytes to {}:{}", job.payload().len(), self.host, job.port());

        if !self.hold.is_zero() {
            time::sleep(self.hold).await;
        }
        // Close errors after a delivered payload do not change the outcome.
        let _ = stream.shutdown().await;
        AttemptOutcome::Success
    }

    fn target(&self, job: &Job) -> String {
        match job {
            Job::Payload(p) => format!("{}:{}", self.host, p.port()),
            Job::Domain(d) => d.domain().to_string(),
        }
    }
}

fn io_outcome(e: io::Error) -> AttemptOutcome {
    if e.kind() == io::ErrorKind::TimedOut {
        AttemptOutcome::Timeout
    } else {
        AttemptOutcome::fatal_error(e.to_string())
    }
}
