use anyhow::{bail, Result};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

/// Immutable settings shared by every probe worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeConfig {
    pub workers: usize,
    /// Bound on each network attempt.
    pub timeout: Duration,
    /// Attempts per job (R).
    pub repeat: u32,
    /// Consecutive timeouts that mark a target as affected (T).
    pub threshold: u32,
    /// Pause after a non-timeout attempt.
    pub interval: Duration,
    /// Pause after a timed out attempt.
    pub backoff: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            timeout: Duration::from_secs(5),
            repeat: 3,
            threshold: 2,
            interval: Duration::from_secs(1),
            backoff: Duration::from_secs(2),
        }
    }
}

impl ProbeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            bail!("worker count must be at least 1");
        }
        if self.repeat == 0 {
            bail!("repeat count must be at least 1");
        }
        if self.threshold == 0 {
            bail!("consecutive timeout threshold must be at least 1");
        }
        if self.timeout.is_zero() {
            bail!("timeout must be greater than zero");
        }
        Ok(())
    }
}

/// PEM certificate and PKCS#8 key used to wrap every listening socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Immutable settings for the passive capture listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    pub bind: IpAddr,
    pub ports: Vec<u16>,
    /// A connection idle for this long is closed and recorded.
    pub read_timeout: Duration,
    /// Upper bound on connections being recorded at once.
    pub max_connections: usize,
    /// Time in-flight connections get to finish on shutdown.
    pub grace_period: Duration,
    pub tls: Option<TlsFiles>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ports: vec![12345],
            read_timeout: Duration::from_secs(60),
            max_connections: 1024,
            grace_period: Duration::from_secs(5),
            tls: None,
        }
    }
}

impl ListenerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.ports.is_empty() {
            bail!("no listening ports configured");
        }
        if self.max_connections == 0 {
            bail!("max connections must be at least 1");
        }
        if self.read_timeout.is_zero() {
            bail!("read timeout must be greater than zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(ProbeConfig::default().validate().is_ok());
        assert!(ListenerConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_values_rejected() {
        let cfg = ProbeConfig { workers: 0, ..Default::default() };
        assert!(cfg.validate().is_err());
        let cfg = ProbeConfig { repeat: 0, ..Default::default() };
        assert!(cfg.validate().is_err());
        let cfg = ProbeConfig { threshold: 0, ..Default::default() };
        assert!(cfg.validate().is_err());
        let cfg = ListenerConfig { ports: Vec::new(), ..Default::default() };
        assert!(cfg.validate().is_err());
        let cfg = ListenerConfig { max_connections: 0, ..Default::default() };
        assert!(cfg.validate().is_err());
    }
}
