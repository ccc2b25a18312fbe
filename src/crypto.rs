//! # Cryptographic Infrastructure
//!
//! - **Signatures**: domain-separated Ed25519 signing and verification
//! - **TLS**: self-signed Ed25519 certificates for QUIC mutual authentication
//!
//! ## Identity Binding
//!
//! The TLS layer only proves that the remote holds *some* Ed25519 key. The
//! overlay handshake that follows exchanges signed entries; the dialer then
//! checks that the entry's public key equals the key from the certificate
//! (see [`extract_verified_key`]). No CA is involved.

use std::sync::Arc;

use anyhow::{Context, Result};
use ed25519_dalek::{Signature, VerifyingKey};
use quinn::ClientConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::identity::Keypair;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    Missing,
    InvalidLength,
    VerificationFailed,
    InvalidPublicKey,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for SignatureError {}

impl From<SignatureError> for crate::error::Error {
    fn from(e: SignatureError) -> Self {
        crate::error::Error::InvalidSignature(e.to_string())
    }
}

/// Domain separation prefix for entry signatures.
pub const ENTRY_SIGNATURE_DOMAIN: &[u8] = b"seedmesh-entry-v1:";

/// Domain separation prefix for collection manifest signatures.
pub const MANIFEST_SIGNATURE_DOMAIN: &[u8] = b"seedmesh-manifest-v1:";

/// Sign `data` prefixed with `domain`.
pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);
    keypair.sign(&prefixed).to_bytes().to_vec()
}

/// Verify a signature produced by [`sign_with_domain`].
pub fn verify_with_domain(
    public_key: &[u8; 32],
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> std::result::Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    if signature.len() != 64 {
        return Err(SignatureError::InvalidLength);
    }

    let verifying_key =
        VerifyingKey::from_bytes(public_key).map_err(|_| SignatureError::InvalidPublicKey)?;

    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;
    let sig = Signature::from_bytes(&sig_bytes);

    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);

    verifying_key
        .verify_strict(&prefixed, &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}

static CRYPTO_PROVIDER: std::sync::LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    std::sync::LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// ALPN protocol identifier for overlay connections.
pub const ALPN: &[u8] = b"seedmesh";

/// Server name presented when dialing; identity is checked by the handshake.
pub const SERVER_NAME: &str = "seedmesh";

pub fn generate_ed25519_cert(
    keypair: &Keypair,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let secret_key = keypair.secret_key_bytes();
    let public_key = keypair.public_key_bytes();

    const ED25519_OID: [u8; 5] = [0x06, 0x03, 0x2b, 0x65, 0x70];
    const PKCS8_VERSION: [u8; 3] = [0x02, 0x01, 0x00];

    let mut pkcs8 = Vec::with_capacity(48);
    pkcs8.extend_from_slice(&[0x30, 0x2e]);
    pkcs8.extend_from_slice(&PKCS8_VERSION);
    pkcs8.extend_from_slice(&[0x30, 0x05]);
    pkcs8.extend_from_slice(&ED25519_OID);
    pkcs8.extend_from_slice(&[0x04, 0x22, 0x04, 0x20]);
    pkcs8.extend_from_slice(&secret_key);

    let pkcs8_der = PrivatePkcs8KeyDer::from(pkcs8.clone());
    let key_pair = rcgen::KeyPair::try_from(&pkcs8_der)
        .context("failed to create Ed25519 key pair for certificate")?;

    let mut params = rcgen::CertificateParams::new(vec![SERVER_NAME.to_string()])
        .context("failed to create certificate params")?;
    params.distinguished_name.push(
        rcgen::DnType::CommonName,
        rcgen::DnValue::Utf8String(hex::encode(public_key)),
    );

    let cert = params
        .self_signed(&key_pair)
        .context("failed to generate self-signed Ed25519 certificate")?;

    let key = PrivateKeyDer::Pkcs8(pkcs8.into());
    let cert_der = CertificateDer::from(cert.der().to_vec());

    Ok((vec![cert_der], key))
}

pub fn create_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<quinn::ServerConfig> {
    let mut server_crypto = rustls::ServerConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("failed to select TLS 1.3")?
        .with_client_cert_verifier(Arc::new(Ed25519ClientCertVerifier))
        .with_single_cert(certs, key)
        .context("failed to create server TLS config")?;
    server_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
            .context("failed to create QUIC server config")?,
    ));

    let transport_config = Arc::get_mut(&mut server_config.transport)
        .context("transport config shared before configuration")?;
    transport_config.max_idle_timeout(Some(
        std::time::Duration::from_secs(60)
            .try_into()
            .context("invalid idle timeout")?,
    ));
    transport_config.keep_alive_interval(Some(std::time::Duration::from_secs(15)));
    transport_config.max_concurrent_bidi_streams(64u32.into());

    Ok(server_config)
}

pub fn create_client_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ClientConfig> {
    let mut client_crypto = rustls::ClientConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("failed to select TLS 1.3")?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(Ed25519ServerCertVerifier))
        .with_client_auth_cert(certs, key)
        .context("failed to create client TLS config with client auth")?;
    client_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut client_config = ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
            .context("failed to create QUIC client config")?,
    ));
    let mut transport = quinn::TransportConfig::default();
    transport.keep_alive_interval(Some(std::time::Duration::from_secs(15)));
    client_config.transport_config(Arc::new(transport));

    Ok(client_config)
}

pub fn extract_public_key_from_cert(cert_der: &[u8]) -> Option<[u8; 32]> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;
    let key_bytes = &cert.public_key().subject_public_key.data;

    if key_bytes.len() == 32 {
        let mut key = [0u8; 32];
        key.copy_from_slice(key_bytes);
        Some(key)
    } else {
        None
    }
}

/// Public key the remote proved possession of during the TLS handshake.
pub fn extract_verified_key(connection: &quinn::Connection) -> Option<[u8; 32]> {
    let peer_identity = connection.peer_identity()?;
    let certs: &Vec<CertificateDer> = peer_identity.downcast_ref()?;
    let cert_der = certs.first()?.as_ref();
    extract_public_key_from_cert(cert_der)
}

fn check_ed25519_cert(end_entity: &CertificateDer<'_>) -> Result<(), rustls::Error> {
    let public_key = extract_public_key_from_cert(end_entity.as_ref()).ok_or(
        rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding),
    )?;
    VerifyingKey::from_bytes(&public_key).map_err(|_| {
        rustls::Error::InvalidCertificate(rustls::CertificateError::ApplicationVerificationFailure)
    })?;
    Ok(())
}

#[derive(Debug)]
struct Ed25519ClientCertVerifier;

impl rustls::server::danger::ClientCertVerifier for Ed25519ClientCertVerifier {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        check_ed25519_cert(end_entity)?;
        Ok(rustls::server::danger::ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}

#[derive(Debug)]
struct Ed25519ServerCertVerifier;

impl rustls::client::danger::ServerCertVerifier for Ed25519ServerCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        check_ed25519_cert(end_entity)?;
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn certificate_contains_keypair_public_key() {
        for _ in 0..20 {
            let keypair = Keypair::generate();
            let (certs, _key) = generate_ed25519_cert(&keypair).expect("cert generation must succeed");

            let extracted = extract_public_key_from_cert(certs[0].as_ref())
                .expect("public key extraction must succeed");
            assert_eq!(extracted, keypair.public_key_bytes());
        }
    }

    #[test]
    fn different_keypairs_different_cert_keys() {
        let mut keys = HashSet::new();
        for _ in 0..50 {
            let keypair = Keypair::generate();
            let (certs, _) = generate_ed25519_cert(&keypair).expect("cert generation must succeed");
            let key = extract_public_key_from_cert(certs[0].as_ref()).expect("pk extraction must succeed");
            assert!(keys.insert(key));
        }
    }

    #[test]
    fn domain_separation_prevents_cross_domain_replay() {
        let keypair = Keypair::generate();
        let sig = sign_with_domain(&keypair, ENTRY_SIGNATURE_DOMAIN, b"payload");

        assert!(verify_with_domain(&keypair.public_key_bytes(), ENTRY_SIGNATURE_DOMAIN, b"payload", &sig).is_ok());
        assert_eq!(
            verify_with_domain(&keypair.public_key_bytes(), MANIFEST_SIGNATURE_DOMAIN, b"payload", &sig),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn malformed_signatures_rejected() {
        let keypair = Keypair::generate();
        let pk = keypair.public_key_bytes();

        assert_eq!(verify_with_domain(&pk, ENTRY_SIGNATURE_DOMAIN, b"x", &[]), Err(SignatureError::Missing));
        assert_eq!(
            verify_with_domain(&pk, ENTRY_SIGNATURE_DOMAIN, b"x", &[0u8; 10]),
            Err(SignatureError::InvalidLength)
        );
    }

    #[test]
    fn configs_build_from_generated_certs() {
        let keypair = Keypair::generate();
        let (certs, key) = generate_ed25519_cert(&keypair).unwrap();
        assert!(create_server_config(certs.clone(), key.clone_key()).is_ok());
        assert!(create_client_config(certs, key).is_ok());
    }
}
