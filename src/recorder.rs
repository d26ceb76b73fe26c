use std::net::SocketAddr;
use std::time::Duration;
use ::time::OffsetDateTime;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};

use crate::types::ConnectionRecord;

/// Receive buffer size for each read.
pub const READ_CHUNK: usize = 2048;

/// Endpoint pairs and timestamps captured at accept time.
///
/// Consumed by [`AcceptedConnection::finish`], so a connection can only be
/// finalized once.
#[derive(Debug)]
pub struct AcceptedConnection {
    local: SocketAddr,
    remote: SocketAddr,
    started_at: OffsetDateTime,
    started: Instant,
}

impl AcceptedConnection {
    pub fn new(local: SocketAddr, remote: SocketAddr) -> Self {
        Self {
            local,
            remote,
            started_at: OffsetDateTime::now_utc(),
            started: Instant::now(),
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn finish(self, first_chunk_hex: String, total_bytes: u64) -> ConnectionRecord {
        ConnectionRecord {
            start_time: self.started_at,
            local: self.local,
            remote: self.remote,
            first_chunk_hex,
            total_bytes,
            duration_seconds: self.started.elapsed().as_secs_f64(),
        }
    }
}

/// Read `stream` until EOF, `read_timeout` of idleness, or an I/O error, then
/// finalize the record. Errors end the connection; they are never returned.
pub async fn record_connection<S>(
    mut stream: S,
    accepted: AcceptedConnection,
    read_timeout: Duration,
) -> ConnectionRecord
where
    S: AsyncRead + Unpin,
{
    let remote = accepted.remote();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut total: u64 = 0;
    let mut first: Option<String> = None;

    loop {
        match time::timeout(read_timeout, stream.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                total += n as u64;
                let chunk = &buf[..n];
                trace!("recv {remote}: {}", hex::encode(chunk));
                if first.is_none() {
                    first = Some(hex::encode(chunk));
                }
            }
            Ok(Err(e)) => {
                warn!("error reading from {remote}: {e}");
                break;
            }
            Err(_) => {
                debug!("{remote} idle for {:?}, closing", read_timeout);
                break;
            }
        }
    }

    accepted.finish(first.unwrap_or_default(), total)
}
