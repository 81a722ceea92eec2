//! Upstream server connection
//!
//! Parses the configured `imap:`/`imaps:`/`tls:`/`ssl:` URL, opens the
//! matching plain-TCP or TLS connection, and hands back a boxed stream the
//! mediator can pump without caring which it got.

use imaproxy_common::{Error, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Anything the mediator can read from and write to
pub trait Socket: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Socket for T {}

/// Boxed bidirectional stream, plain or TLS
pub type BoxedSocket = Box<dyn Socket>;

const DEFAULT_PLAIN_PORT: u16 = 143;
const DEFAULT_TLS_PORT: u16 = 993;

/// Parsed upstream server address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamAddr {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl UpstreamAddr {
    /// Parse an upstream URL. `imap:` connects in the plain on port 143;
    /// `imaps:`, `tls:` and `ssl:` negotiate TLS on port 993. An explicit
    /// `:port` overrides the default.
    pub fn parse(url: &str) -> Result<Self> {
        let (scheme, rest) = url
            .split_once(':')
            .ok_or_else(|| Error::Config(format!("Invalid upstream URL: {}", url)))?;

        let tls = match scheme.to_ascii_lowercase().as_str() {
            "imap" => false,
            "imaps" | "tls" | "ssl" => true,
            other => {
                return Err(Error::Config(format!(
                    "Unsupported upstream scheme: {}",
                    other
                )))
            }
        };

        let rest = rest.trim_start_matches('/');
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| Error::Config(format!("Invalid upstream port in {}", url)))?;
                (host, port)
            }
            None => (
                rest,
                if tls { DEFAULT_TLS_PORT } else { DEFAULT_PLAIN_PORT },
            ),
        };

        if host.is_empty() {
            return Err(Error::Config(format!("Missing upstream host in {}", url)));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            tls,
        })
    }

    /// Open the upstream connection, applying TCP keep-alive and the TLS
    /// handshake as configured.
    pub async fn connect(&self, verify_certs: bool, keep_alive: u64) -> Result<BoxedSocket> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| {
                Error::Upstream(format!("Connect to {}:{} failed: {}", self.host, self.port, e))
            })?;
        stream.set_nodelay(true).ok();

        if keep_alive > 0 {
            enable_keep_alive(&stream, keep_alive)?;
        }

        if !self.tls {
            return Ok(Box::new(stream));
        }

        let connector = TlsConnector::from(Arc::new(client_tls_config(verify_certs)));
        let server_name = ServerName::try_from(self.host.clone())
            .map_err(|e| Error::Tls(format!("Invalid upstream hostname: {}", e)))?;
        let tls_stream = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| Error::Tls(format!("Upstream TLS handshake failed: {}", e)))?;
        debug!("Upstream TLS handshake with {} complete", self.host);

        Ok(Box::new(tls_stream))
    }
}

#[cfg(unix)]
fn enable_keep_alive(stream: &TcpStream, secs: u64) -> Result<()> {
    use nix::sys::socket::{setsockopt, sockopt};

    let secs = secs.min(u32::MAX as u64) as u32;
    setsockopt(stream, sockopt::KeepAlive, &true)
        .map_err(|e| Error::Upstream(format!("Enabling keepalive failed: {}", e)))?;
    setsockopt(stream, sockopt::TcpKeepIdle, &secs)
        .map_err(|e| Error::Upstream(format!("Setting keepalive idle failed: {}", e)))?;
    setsockopt(stream, sockopt::TcpKeepInterval, &secs)
        .map_err(|e| Error::Upstream(format!("Setting keepalive interval failed: {}", e)))?;
    Ok(())
}

#[cfg(not(unix))]
fn enable_keep_alive(_stream: &TcpStream, _secs: u64) -> Result<()> {
    Ok(())
}

fn client_tls_config(verify_certs: bool) -> ClientConfig {
    if verify_certs {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    } else {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_no_client_auth()
    }
}

/// Verifier used when `tls_nocheck_certs` is set
#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_url() {
        let addr = UpstreamAddr::parse("imap://mail.example.com:1143").unwrap();
        assert_eq!(addr.host, "mail.example.com");
        assert_eq!(addr.port, 1143);
        assert!(!addr.tls);
    }

    #[test]
    fn test_parse_default_ports() {
        let plain = UpstreamAddr::parse("imap://mail.example.com").unwrap();
        assert_eq!(plain.port, 143);
        let tls = UpstreamAddr::parse("imaps://mail.example.com").unwrap();
        assert_eq!(tls.port, 993);
        assert!(tls.tls);
    }

    #[test]
    fn test_parse_tls_and_ssl_schemes() {
        assert!(UpstreamAddr::parse("tls://host").unwrap().tls);
        assert!(UpstreamAddr::parse("ssl://host:993").unwrap().tls);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(UpstreamAddr::parse("http://host").is_err());
        assert!(UpstreamAddr::parse("no-scheme").is_err());
        assert!(UpstreamAddr::parse("imap://host:notaport").is_err());
        assert!(UpstreamAddr::parse("imap://").is_err());
    }
}
