//! # TLS for the reliable channel
//!
//! Optional TLS wrapping of the TCP stream. The best-effort channel is never
//! encrypted.
//!
//! The server either loads a PEM certificate chain and PKCS8 key from disk or
//! generates a throwaway self-signed identity in memory. A client paired with a
//! self-signed server skips certificate verification; otherwise it verifies
//! against the platform root store.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls::{Certificate, PrivateKey, RootCertStore, ServerName};
use rustls_pemfile::{certs, pkcs8_private_keys};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, instrument, warn};

use crate::config::{ClientConfig, ServerConfig};
use crate::error::{ProtocolError, Result};
use crate::transport::BoxedStream;

/// Build the acceptor described by the server configuration
pub fn server_acceptor(config: &ServerConfig) -> Result<TlsAcceptor> {
    let (chain, key) = match (&config.tls_cert_path, &config.tls_key_path) {
        (Some(cert_path), Some(key_path)) => load_identity(cert_path, key_path)?,
        _ if config.tls_self_signed => self_signed_identity()?,
        _ => {
            return Err(ProtocolError::ConfigError(
                "TLS enabled without a certificate or self-signing".into(),
            ))
        }
    };

    let tls = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|e| ProtocolError::TlsError(format!("TLS error: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(tls)))
}

/// Build the connector described by the client configuration
pub fn client_connector(config: &ClientConfig) -> Result<TlsConnector> {
    let builder = rustls::ClientConfig::builder().with_safe_defaults();

    let tls = if config.tls_self_signed {
        warn!("Server certificate verification disabled for self-signed peer");
        builder
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs()
            .map_err(|e| ProtocolError::TlsError(format!("Failed to load native certs: {e}")))?;
        for cert in native {
            if let Err(e) = roots.add(&Certificate(cert.0)) {
                debug!(error = %e, "Skipping unusable native root");
            }
        }
        builder
            .with_root_certificates(roots)
            .with_no_client_auth()
    };

    Ok(TlsConnector::from(Arc::new(tls)))
}

/// Complete the server side of the TLS handshake
#[instrument(skip(acceptor, stream))]
pub async fn accept(acceptor: &TlsAcceptor, stream: TcpStream) -> Result<BoxedStream> {
    let tls = acceptor
        .accept(stream)
        .await
        .map_err(|e| ProtocolError::TlsError(format!("TLS accept failed: {e}")))?;
    Ok(Box::new(tls))
}

/// Complete the client side of the TLS handshake against `host`
#[instrument(skip(connector, stream))]
pub async fn connect(connector: &TlsConnector, host: &str, stream: TcpStream) -> Result<BoxedStream> {
    let server_name = ServerName::try_from(host)
        .map_err(|e| ProtocolError::TlsError(format!("Invalid server name '{host}': {e}")))?;
    let tls = connector
        .connect(server_name, stream)
        .await
        .map_err(|e| ProtocolError::TlsError(format!("TLS connect failed: {e}")))?;
    Ok(Box::new(tls))
}

fn load_identity(cert_path: &str, key_path: &str) -> Result<(Vec<Certificate>, PrivateKey)> {
    let cert_file = File::open(cert_path)
        .map_err(|e| ProtocolError::TlsError(format!("Failed to open cert file: {e}")))?;
    let chain: Vec<Certificate> = certs(&mut BufReader::new(cert_file))
        .map_err(|_| ProtocolError::TlsError("Failed to parse certificate".into()))?
        .into_iter()
        .map(Certificate)
        .collect();
    if chain.is_empty() {
        return Err(ProtocolError::TlsError("No certificates found".into()));
    }

    let key_file = File::open(key_path)
        .map_err(|e| ProtocolError::TlsError(format!("Failed to open key file: {e}")))?;
    let key = pkcs8_private_keys(&mut BufReader::new(key_file))
        .map_err(|_| ProtocolError::TlsError("Failed to parse private key".into()))?
        .into_iter()
        .next()
        .ok_or_else(|| ProtocolError::TlsError("No private keys found".into()))?;

    Ok((chain, PrivateKey(key)))
}

/// Fresh in-memory certificate for `localhost`
fn self_signed_identity() -> Result<(Vec<Certificate>, PrivateKey)> {
    let generated = rcgen::generate_simple_self_signed(vec!["localhost".into()])
        .map_err(|e| ProtocolError::TlsError(format!("Certificate generation error: {e}")))?;
    let cert = Certificate(generated.cert.der().to_vec());
    let key = PrivateKey(generated.signing_key.serialize_der());
    debug!("Generated self-signed certificate");
    Ok((vec![cert], key))
}

struct AcceptAnyServerCert;

impl rustls::client::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}
