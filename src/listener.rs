use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time;
use tokio_native_tls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::ListenerConfig;
use crate::recorder::{record_connection, AcceptedConnection};
use crate::sink::RecordSink;
use crate::tls;
use crate::types::ConnectionRecord;

/// Bound sockets ready to accept. Binding and TLS loading happen up front so
/// configuration errors surface before anything is accepted.
pub struct PassiveListener {
    sockets: Vec<TcpListener>,
    tls: Option<TlsAcceptor>,
    read_timeout: Duration,
    grace_period: Duration,
    admission: Arc<Semaphore>,
}

impl PassiveListener {
    pub async fn bind(config: &ListenerConfig) -> Result<Self> {
        config.validate()?;
        let tls = match &config.tls {
            Some(files) => Some(tls::load_acceptor(&files.cert, &files.key)?),
            None => None,
        };

        let mut sockets = Vec::with_capacity(config.ports.len());
        for &port in &config.ports {
            let addr = SocketAddr::new(config.bind, port);
            let socket = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind {addr}"))?;
            let kind = if tls.is_some() { "TLS" } else { "TCP" };
            info!(
                "{kind} server is listening on {}, timeout value: {}s",
                socket.local_addr().unwrap_or(addr),
                config.read_timeout.as_secs()
            );
            sockets.push(socket);
        }

        Ok(Self {
            sockets,
            tls,
            read_timeout: config.read_timeout,
            grace_period: config.grace_period,
            admission: Arc::new(Semaphore::new(config.max_connections)),
        })
    }

    /// Actual bound addresses (resolves port 0).
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.sockets.iter().filter_map(|s| s.local_addr().ok()).collect()
    }

    /// Accept on every socket until `cancel` fires, then give in-flight
    /// connections the grace period to finish.
    pub async fn run(self, sink: RecordSink<ConnectionRecord>, cancel: CancellationToken) {
        let tracker = TaskTracker::new();
        let hard_stop = CancellationToken::new();
        let mut acceptors = JoinSet::new();
        for socket in self.sockets {
            acceptors.spawn(accept_loop(
                socket,
                self.tls.clone(),
                self.read_timeout,
                self.admission.clone(),
                tracker.clone(),
                sink.clone(),
                cancel.clone(),
                hard_stop.clone(),
            ));
        }
        drop(sink);

        while let Some(res) = acceptors.join_next().await {
            if let Err(e) = res {
                error!("acceptor task failed: {e}");
            }
        }

        tracker.close();
        if !tracker.is_empty() {
            info!(
                "waiting up to {:?} for {} open connection(s)",
                self.grace_period,
                tracker.len()
            );
        }
        if time::timeout(self.grace_period, tracker.wait()).await.is_err() {
            warn!(
                "{} connection(s) still open after grace period; dropping them",
                tracker.len()
            );
            hard_stop.cancel();
            tracker.wait().await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    socket: TcpListener,
    tls: Option<TlsAcceptor>,
    read_timeout: Duration,
    admission: Arc<Semaphore>,
    tracker: TaskTracker,
    sink: RecordSink<ConnectionRecord>,
    cancel: CancellationToken,
    hard_stop: CancellationToken,
) {
    let listen_addr = socket.local_addr().ok();
    loop {
        // Take a slot before accepting so floods queue in the kernel backlog.
        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = admission.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            res = socket.accept() => res,
        };
        match accepted {
            Ok((stream, remote)) => {
                let local = stream
                    .local_addr()
                    .ok()
                    .or(listen_addr)
                    .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
                let conn = AcceptedConnection::new(local, remote);
                let work = handle_connection(
                    stream,
                    conn,
                    tls.clone(),
                    read_timeout,
                    sink.clone(),
                    permit,
                );
                let hard_stop = hard_stop.clone();
                tracker.spawn(async move {
                    tokio::select! {
                        _ = work => {}
                        _ = hard_stop.cancelled() => debug!("connection from {remote} dropped at shutdown"),
                    }
                });
            }
            Err(e) => {
                warn!("accept failed on {:?}: {e}", listen_addr);
                // Back off briefly on descriptor exhaustion and similar errors.
                time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
    debug!("acceptor on {:?} stopped", listen_addr);
}

async fn handle_connection(
    stream: TcpStream,
    conn: AcceptedConnection,
    tls: Option<TlsAcceptor>,
    read_timeout: Duration,
    sink: RecordSink<ConnectionRecord>,
    _permit: OwnedSemaphorePermit,
) {
    let remote = conn.remote();
    let record = match tls {
        None => record_connection(stream, conn, read_timeout).await,
        Some(acceptor) => match time::timeout(read_timeout, acceptor.accept(stream)).await {
            Ok(Ok(tls_stream)) => record_connection(tls_stream, conn, read_timeout).await,
            Ok(Err(e)) => {
                warn!("TLS handshake with {remote} failed: {e}");
                return;
            }
            Err(_) => {
                warn!("TLS handshake with {remote} timed out");
                return;
            }
        },
    };
    debug!(
        "connection from {remote} closed: {} bytes in {:.3}s",
        record.total_bytes, record.duration_seconds
    );
    sink.push(record);
}
