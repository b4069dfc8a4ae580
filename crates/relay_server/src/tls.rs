//! Certificate loading for `wss` and `auto` listeners.

use crate::config::TlsConfig;
use crate::ServerError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Builds a rustls server configuration from PEM files.
pub fn load_server_config(tls: &TlsConfig) -> Result<Arc<ServerConfig>, ServerError> {
    if tls.passphrase.is_some() {
        warn!("Encrypted private keys are not supported, ignoring the configured passphrase");
    }

    let certificates = load_certificates(&tls.certificate)?;
    if certificates.is_empty() {
        return Err(ServerError::Tls(format!(
            "No certificates found in {}",
            tls.certificate.display()
        )));
    }
    let key = load_private_key(&tls.private_key)?;

    debug!(
        cert_count = certificates.len(),
        certificate = %tls.certificate.display(),
        "TLS material loaded"
    );

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certificates, key)
        .map_err(|e| ServerError::Tls(e.to_string()))?;

    Ok(Arc::new(config))
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, ServerError> {
    let file = File::open(path).map_err(|e| ServerError::Tls(format!("{}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);

    certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ServerError::Tls(format!("{}: {e}", path.display())))
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ServerError> {
    let file = File::open(path).map_err(|e| ServerError::Tls(format!("{}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);

    private_key(&mut reader)
        .map_err(|e| ServerError::Tls(format!("{}: {e}", path.display())))?
        .ok_or_else(|| ServerError::Tls(format!("No private key found in {}", path.display())))
}
