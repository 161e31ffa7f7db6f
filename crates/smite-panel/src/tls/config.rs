//! TLS configuration for the node control channel.
//!
//! The panel always requires a client certificate signed by the node CA;
//! there is no plaintext mode.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tracing::info;

use super::certs::{CertError, load_or_create_dev_bundle};

#[derive(Debug, Clone)]
pub enum TlsMode {
    /// Self-signed CA, server and node certificates kept in `cert_dir`.
    /// Development only.
    DevSelfSigned {
        cert_dir: PathBuf,
        server_names: Vec<String>,
    },
    /// Operator-provided server identity and node CA.
    Custom {
        cert_path: PathBuf,
        key_path: PathBuf,
        /// CA that signs node client certificates.
        client_ca_path: PathBuf,
    },
}

impl TlsMode {
    /// Build the rustls server config for this mode.
    pub fn to_server_config(&self) -> Result<Arc<ServerConfig>, TlsConfigError> {
        match self {
            Self::DevSelfSigned {
                cert_dir,
                server_names,
            } => {
                let bundle = load_or_create_dev_bundle(cert_dir, server_names)?;
                let config = server_config_from_pem(
                    bundle.server.cert_pem.as_bytes(),
                    bundle.server.key_pem.as_bytes(),
                    bundle.ca_cert_pem.as_bytes(),
                )?;
                info!(cert_dir = %cert_dir.display(), "Dev mTLS enabled");
                Ok(config)
            }
            Self::Custom {
                cert_path,
                key_path,
                client_ca_path,
            } => {
                let config = server_config_from_pem(
                    &read_file(cert_path)?,
                    &read_file(key_path)?,
                    &read_file(client_ca_path)?,
                )?;
                info!(
                    cert = %cert_path.display(),
                    key = %key_path.display(),
                    client_ca = %client_ca_path.display(),
                    "mTLS enabled"
                );
                Ok(config)
            }
        }
    }
}

/// Server config that presents `cert_pem` and only accepts clients whose
/// certificate chains to `client_ca_pem`.
pub fn server_config_from_pem(
    cert_pem: &[u8],
    key_pem: &[u8],
    client_ca_pem: &[u8],
) -> Result<Arc<ServerConfig>, TlsConfigError> {
    let mut roots = RootCertStore::empty();
    for ca in parse_certificates(client_ca_pem)? {
        roots
            .add(ca)
            .map_err(|e| TlsConfigError::Certificate(format!("Failed to add client CA: {e}")))?;
    }
    if roots.is_empty() {
        return Err(TlsConfigError::Certificate("No client CA certificates found".into()));
    }

    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| TlsConfigError::Config(format!("Client verifier error: {e}")))?;

    let certs = parse_certificates(cert_pem)?;
    if certs.is_empty() {
        return Err(TlsConfigError::Certificate("No server certificates found".into()));
    }
    let key = PrivateKeyDer::from_pem_slice(key_pem)
        .map_err(|e| TlsConfigError::Certificate(format!("Failed to parse private key: {e}")))?;

    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| TlsConfigError::Config(format!("Server config error: {e}")))?;
    Ok(Arc::new(config))
}

pub fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, TlsConfigError> {
    CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsConfigError::Certificate(format!("Failed to parse certificates: {e}")))
}

fn read_file(path: &Path) -> Result<Vec<u8>, TlsConfigError> {
    std::fs::read(path)
        .map_err(|e| TlsConfigError::FileRead(format!("Failed to read {}: {e}", path.display())))
}

#[derive(Debug, thiserror::Error)]
pub enum TlsConfigError {
    #[error("Certificate generation error: {0}")]
    CertGeneration(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("TLS config error: {0}")]
    Config(String),

    #[error("File read error: {0}")]
    FileRead(String),
}

impl From<CertError> for TlsConfigError {
    fn from(e: CertError) -> Self {
        Self::CertGeneration(e.to_string())
    }
}
