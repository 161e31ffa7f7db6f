//! Client-side mTLS for the control channel.

use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};

use super::error::AgentError;

/// Client config that trusts only `ca_pem` and presents the node identity.
pub fn client_config_from_pem(
    ca_pem: &[u8],
    cert_pem: &[u8],
    key_pem: &[u8],
) -> Result<Arc<ClientConfig>, AgentError> {
    let mut roots = RootCertStore::empty();
    for ca in parse_certificates(ca_pem)? {
        roots
            .add(ca)
            .map_err(|e| AgentError::Tls(format!("Failed to add panel CA: {e}")))?;
    }
    if roots.is_empty() {
        return Err(AgentError::Tls("No panel CA certificates found".into()));
    }

    let certs = parse_certificates(cert_pem)?;
    if certs.is_empty() {
        return Err(AgentError::Tls("No client certificates found".into()));
    }
    let key = PrivateKeyDer::from_pem_slice(key_pem)
        .map_err(|e| AgentError::Tls(format!("Failed to parse private key: {e}")))?;

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .map_err(|e| AgentError::Tls(format!("Client config error: {e}")))?;
    Ok(Arc::new(config))
}

/// Load the client config from PEM files.
pub fn load_client_config(
    ca_path: &Path,
    cert_path: &Path,
    key_path: &Path,
) -> Result<Arc<ClientConfig>, AgentError> {
    client_config_from_pem(&read_file(ca_path)?, &read_file(cert_path)?, &read_file(key_path)?)
}

fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, AgentError> {
    CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| AgentError::Tls(format!("Failed to parse certificates: {e}")))
}

fn read_file(path: &Path) -> Result<Vec<u8>, AgentError> {
    std::fs::read(path).map_err(|e| AgentError::Tls(format!("Failed to read {}: {e}", path.display())))
}
