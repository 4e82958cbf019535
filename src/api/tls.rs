//! Gateway certificate handling.
//!
//! The gateway's certificate is self-signed, so it cannot be verified against
//! the system roots. Instead, the exporter can fetch the certificate once
//! (`--fetchcert`), store it PEM-encoded, and pin it on later runs.

use std::{net::TcpStream, path::Path, sync::Arc};

use base64::{Engine, engine::general_purpose::STANDARD};
use rustls::{
    ClientConfig,
    ClientConnection,
    DigitallySignedStruct,
    SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, ServerName, UnixTime},
};

use crate::prelude::*;

/// Load a pinned PEM certificate for the HTTP client.
pub fn load_certificate(path: &Path) -> Result<reqwest::Certificate> {
    let contents = std::fs::read(path)
        .with_context(|| format!("failed to read the TLS cert file `{}`", path.display()))?;
    let certificate = reqwest::Certificate::from_pem(&contents).with_context(|| {
        format!("`{}` does not contain a PEM-encoded certificate", path.display())
    })?;
    debug!(path = %path.display(), "loaded the gateway certificate");
    Ok(certificate)
}

/// Connect to the gateway, accept whatever certificate it presents, and
/// return that certificate PEM-encoded.
pub fn fetch_certificate(gateway_address: &str) -> Result<String> {
    let address = if gateway_address.contains(':') {
        gateway_address.to_string()
    } else {
        format!("{gateway_address}:443")
    };
    let host = address.rsplit_once(':').map_or(gateway_address, |(host, _)| host);
    info!(address, "connecting to the gateway…");

    let config =
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .context("failed to configure TLS")?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
            .with_no_client_auth();
    let server_name = ServerName::try_from(host.to_string())
        .with_context(|| format!("invalid gateway host name `{host}`"))?;
    let mut connection = ClientConnection::new(Arc::new(config), server_name)
        .context("failed to set up the TLS connection")?;
    let mut stream = TcpStream::connect(&address)
        .with_context(|| format!("failed to connect to `{address}`"))?;
    while connection.is_handshaking() {
        connection
            .complete_io(&mut stream)
            .context("TLS handshake with the gateway failed")?;
    }

    let certificate = connection
        .peer_certificates()
        .and_then(|certificates| certificates.first())
        .context("the gateway presented no certificate")?;
    Ok(to_pem(certificate))
}

fn to_pem(certificate: &CertificateDer<'_>) -> String {
    let encoded = STANDARD.encode(certificate.as_ref());
    let mut pem = String::from("-----BEGIN CERTIFICATE-----\n");
    for line in encoded.as_bytes().chunks(64) {
        pem.push_str(std::str::from_utf8(line).unwrap_or_default());
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    pem
}

/// Verifier that accepts any presented certificate, used only to retrieve it.
#[derive(Debug)]
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
