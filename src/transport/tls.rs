//! TLS client layer

use std::sync::Arc;

use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::common::{Result, Stream};
use crate::error::Error;

/// TLS client configuration
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Server name for SNI
    pub server_name: String,
    /// Allow insecure certificates
    pub skip_cert_verify: bool,
    /// ALPN protocols
    pub alpn: Vec<String>,
}

/// Build a rustls client config from our options.
pub fn build_client_config(config: &TlsConfig) -> ClientConfig {
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let mut tls_config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    if !config.alpn.is_empty() {
        tls_config.alpn_protocols = config.alpn.iter().map(|s| s.as_bytes().to_vec()).collect();
    }

    if config.skip_cert_verify {
        tls_config
            .dangerous()
            .set_certificate_verifier(Arc::new(InsecureVerifier));
    }

    tls_config
}

/// Wrap a stream in a TLS client session.
///
/// Returns the stream together with the negotiated ALPN protocol, which
/// the gRPC transport needs for its `h2` check.
pub async fn wrap_client(stream: Stream, config: &TlsConfig) -> Result<(Stream, Option<Vec<u8>>)> {
    if config.server_name.is_empty() {
        return Err(Error::Config("TLS server name required".into()));
    }

    let domain = ServerName::try_from(config.server_name.clone())
        .map_err(|_| Error::Config(format!("Invalid server name: {}", config.server_name)))?;

    let connector = TlsConnector::from(Arc::new(build_client_config(config)));
    let tls_stream = connector
        .connect(domain, stream)
        .await
        .map_err(|e| Error::Handshake(e.to_string()))?;

    let alpn = tls_stream.get_ref().1.alpn_protocol().map(|p| p.to_vec());
    Ok((Box::new(tls_stream), alpn))
}

/// Certificate verifier that accepts anything; used for skip-cert-verify
#[derive(Debug)]
pub(crate) struct InsecureVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
