//! TLS client configuration shared by the MQTT adapter. Mirrors
//! `connection_pool.py::_create_mqtt_connection`'s `verify_ssl` dev
//! escape hatch (`ssl.CERT_NONE`), recast as a custom rustls verifier
//! instead of disabling verification process-wide.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

#[derive(Debug)]
struct NoVerify;

impl ServerCertVerifier for NoVerify {
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
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
        ]
    }
}

/// Build a rustls client config using the OS trust store, or a
/// no-verification config when `verify_ssl` is false (development
/// brokers with self-signed certificates only).
pub fn client_config(verify_ssl: bool) -> ClientConfig {
    if !verify_ssl {
        return ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerify))
            .with_no_client_auth();
    }

    let mut roots = RootCertStore::empty();
    match rustls_native_certs::load_native_certs().certs.into_iter().try_for_each(|c| roots.add(c)) {
        Ok(()) => {}
        Err(_) => {
            // Falls back to an empty store; handshakes will fail closed
            // rather than silently accept anything.
        }
    }

    ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}
