//! Development certificate generation using rcgen.
//!
//! Generates a self-signed CA, the panel's server certificate and one node
//! client certificate for local development and testing. NOT suitable for
//! production use.

use std::path::Path;

use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use tracing::info;

/// Subject of the node certificate in a dev bundle.
pub const DEV_NODE_SUBJECT: &str = "smite-node-dev";

const CA_FILE: &str = "ca.pem";
const SERVER_CERT_FILE: &str = "server.pem";
const SERVER_KEY_FILE: &str = "server-key.pem";
const NODE_CERT_FILE: &str = "node.pem";
const NODE_KEY_FILE: &str = "node-key.pem";

/// CA material able to sign further certificates.
pub struct CaBundle {
    pub params: CertificateParams,
    pub key_pair: KeyPair,
    pub cert_pem: String,
}

/// A PEM certificate and its private key.
#[derive(Debug, Clone)]
pub struct CertPair {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Generated certificate bundle (PEM-encoded).
#[derive(Debug, Clone)]
pub struct DevBundle {
    pub ca_cert_pem: String,
    pub server: CertPair,
    pub node: CertPair,
}

#[derive(Debug, thiserror::Error)]
pub enum CertError {
    #[error("Certificate generation error: {0}")]
    Generation(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<rcgen::Error> for CertError {
    fn from(e: rcgen::Error) -> Self {
        Self::Generation(e.to_string())
    }
}

/// Generate a self-signed CA.
pub fn generate_ca(org_name: &str) -> Result<CaBundle, CertError> {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params
        .distinguished_name
        .push(DnType::CommonName, format!("{org_name} CA"));
    params
        .distinguished_name
        .push(DnType::OrganizationName, org_name);
    params.key_usages.push(KeyUsagePurpose::KeyCertSign);
    params.key_usages.push(KeyUsagePurpose::CrlSign);

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    Ok(CaBundle {
        cert_pem: cert.pem(),
        params,
        key_pair,
    })
}

/// Generate the panel's server certificate for the given DNS names / IPs.
pub fn generate_server_cert(ca: &CaBundle, server_names: &[String]) -> Result<CertPair, CertError> {
    let issuer = Issuer::from_params(&ca.params, &ca.key_pair);

    let mut params = CertificateParams::new(server_names.to_vec())?;
    params
        .distinguished_name
        .push(DnType::CommonName, "Smite Panel");
    params
        .extended_key_usages
        .push(ExtendedKeyUsagePurpose::ServerAuth);

    let key = KeyPair::generate()?;
    let cert = params.signed_by(&key, &issuer)?;
    Ok(CertPair {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    })
}

/// Generate a node client certificate. `subject` becomes the Common Name the
/// panel matches against the node record.
pub fn generate_node_cert(ca: &CaBundle, subject: &str) -> Result<CertPair, CertError> {
    let issuer = Issuer::from_params(&ca.params, &ca.key_pair);

    let mut params = CertificateParams::default();
    params.distinguished_name.push(DnType::CommonName, subject);
    params
        .extended_key_usages
        .push(ExtendedKeyUsagePurpose::ClientAuth);

    let key = KeyPair::generate()?;
    let cert = params.signed_by(&key, &issuer)?;
    Ok(CertPair {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    })
}

/// Generate a full dev bundle: CA, server and one node certificate.
pub fn generate_dev_bundle(server_names: &[String]) -> Result<DevBundle, CertError> {
    let ca = generate_ca("Smite Dev")?;
    let server = generate_server_cert(&ca, server_names)?;
    let node = generate_node_cert(&ca, DEV_NODE_SUBJECT)?;
    Ok(DevBundle {
        ca_cert_pem: ca.cert_pem,
        server,
        node,
    })
}

/// Load a dev bundle from `dir`, generating and writing one if any file is
/// missing.
pub fn load_or_create_dev_bundle(dir: &Path, server_names: &[String]) -> Result<DevBundle, CertError> {
    if let Some(bundle) = read_dev_bundle(dir)? {
        info!(cert_dir = %dir.display(), "Reusing dev certificates");
        return Ok(bundle);
    }
    let bundle = generate_dev_bundle(server_names)?;
    write_dev_bundle(dir, &bundle)?;
    Ok(bundle)
}

fn read_dev_bundle(dir: &Path) -> Result<Option<DevBundle>, CertError> {
    let files = [
        CA_FILE,
        SERVER_CERT_FILE,
        SERVER_KEY_FILE,
        NODE_CERT_FILE,
        NODE_KEY_FILE,
    ];
    if !files.iter().all(|f| dir.join(f).exists()) {
        return Ok(None);
    }
    let read = |name: &str| {
        std::fs::read_to_string(dir.join(name))
            .map_err(|e| CertError::Io(format!("Failed to read {name}: {e}")))
    };
    Ok(Some(DevBundle {
        ca_cert_pem: read(CA_FILE)?,
        server: CertPair {
            cert_pem: read(SERVER_CERT_FILE)?,
            key_pem: read(SERVER_KEY_FILE)?,
        },
        node: CertPair {
            cert_pem: read(NODE_CERT_FILE)?,
            key_pem: read(NODE_KEY_FILE)?,
        },
    }))
}

/// Write a dev bundle to disk.
pub fn write_dev_bundle(dir: &Path, bundle: &DevBundle) -> Result<(), CertError> {
    std::fs::create_dir_all(dir)
        .map_err(|e| CertError::Io(format!("Failed to create cert dir: {e}")))?;

    for (name, contents) in [
        (CA_FILE, &bundle.ca_cert_pem),
        (SERVER_CERT_FILE, &bundle.server.cert_pem),
        (SERVER_KEY_FILE, &bundle.server.key_pem),
        (NODE_CERT_FILE, &bundle.node.cert_pem),
        (NODE_KEY_FILE, &bundle.node.key_pem),
    ] {
        std::fs::write(dir.join(name), contents)
            .map_err(|e| CertError::Io(format!("Failed to write {name}: {e}")))?;
    }

    info!(
        cert_dir = %dir.display(),
        node_subject = DEV_NODE_SUBJECT,
        "Dev certificates written"
    );
    Ok(())
}
