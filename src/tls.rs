use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::Path;
use tokio_native_tls::TlsAcceptor;
use tracing::{info, warn};
use x509_parser::pem::parse_x509_pem;

/// Summary of the leaf certificate a listener will present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub subject: String,
    pub not_after: String,
    pub currently_valid: bool,
}

/// Parse the first PEM certificate in `pem`.
pub fn describe_certificate(pem: &[u8]) -> Result<CertificateInfo> {
    let (_, pem) = parse_x509_pem(pem).map_err(|e| anyhow!("invalid PEM certificate: {e}"))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| anyhow!("invalid X.509 certificate: {e}"))?;
    let validity = cert.validity();
    Ok(CertificateInfo {
        subject: cert.subject().to_string(),
        not_after: validity.not_after.to_string(),
        currently_valid: validity.is_valid(),
    })
}

/// Build a TLS acceptor from a PEM certificate chain and a PKCS#8 PEM key.
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let cert = fs::read(cert_path)
        .with_context(|| format!("failed to read TLS certificate: {}", cert_path.display()))?;
    let key = fs::read(key_path)
        .with_context(|| format!("failed to read TLS key: {}", key_path.display()))?;

    let info = describe_certificate(&cert)
        .with_context(|| format!("bad TLS certificate: {}", cert_path.display()))?;
    info!("TLS certificate subject={} not_after={}", info.subject, info.not_after);
    if !info.currently_valid {
        warn!("TLS certificate {} is not currently valid", cert_path.display());
    }

    let identity = native_tls::Identity::from_pkcs8(&cert, &key)
        .context("TLS certificate/key pair rejected (key must be PKCS#8 PEM)")?;
    let acceptor = native_tls::TlsAcceptor::new(identity).context("failed to build TLS acceptor")?;
    Ok(TlsAcceptor::from(acceptor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_files_are_config_errors() {
        let err = load_acceptor(Path::new("/nonexistent/server.crt"), Path::new("/nonexistent/server.key"))
            .err()
            .expect("must fail");
        assert!(format!("{err:#}").contains("failed to read TLS certificate"));
    }

    #[test]
    fn garbage_certificate_rejected() {
        let mut cert = tempfile::NamedTempFile::new().unwrap();
        cert.write_all(b"not a certificate").unwrap();
        let mut key = tempfile::NamedTempFile::new().unwrap();
        key.write_all(b"not a key").unwrap();
        let err = load_acceptor(cert.path(), key.path()).err().expect("must fail");
        assert!(format!("{err:#}").contains("bad TLS certificate"));
    }

    #[test]
    fn describe_rejects_non_pem() {
        assert!(describe_certificate(b"-----BEGIN NOTHING-----").is_err());
    }
}
