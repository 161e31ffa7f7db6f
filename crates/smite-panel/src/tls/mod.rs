//! Control-channel TLS: server configuration and development certificates.

pub mod certs;
pub mod config;

pub use certs::{CertError, CertPair, DEV_NODE_SUBJECT, DevBundle};
pub use config::{TlsConfigError, TlsMode, parse_certificates, server_config_from_pem};
