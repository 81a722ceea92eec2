//! TLS support for the listener side

use imaproxy_common::config::TlsConfig;
use imaproxy_common::{Error, Result};
use rustls::pki_types::CertificateDer;
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::info;

/// Load the listener key, certificate and optional CA bundle and build the
/// acceptor
pub fn create_tls_acceptor(tls_config: &TlsConfig) -> Result<TlsAcceptor> {
    let cert_path = tls_config
        .ssl_cert
        .as_ref()
        .ok_or_else(|| Error::Config("ssl is enabled but ssl_cert is not set".to_string()))?;
    let key_path = tls_config
        .ssl_key
        .as_ref()
        .ok_or_else(|| Error::Config("ssl is enabled but ssl_key is not set".to_string()))?;

    let mut chain = read_certs(cert_path)?;
    if chain.is_empty() {
        return Err(Error::Tls(format!(
            "No certificates found in {}",
            cert_path.display()
        )));
    }

    if let Some(ca_path) = &tls_config.ssl_ca {
        chain.extend(read_certs(ca_path)?);
    }

    info!("Loaded {} certificate(s) for the listener", chain.len());

    let key_file = File::open(key_path)
        .map_err(|e| Error::Tls(format!("Failed to open key file: {}", e)))?;
    let mut key_reader = BufReader::new(key_file);
    let key = private_key(&mut key_reader)
        .map_err(|e| Error::Tls(format!("Failed to read private key: {}", e)))?
        .ok_or_else(|| Error::Tls(format!("No private key found in {}", key_path.display())))?;

    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|e| Error::Tls(format!("Failed to create TLS config: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| Error::Tls(format!("Failed to open {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);
    certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("Failed to parse {}: {}", path.display(), e)))
}
