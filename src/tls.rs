//! TLS material and rustls configuration.
//!
//! The server side needs a certificate chain from somewhere: an
//! operator-supplied PEM pair, a `server.crt`/`server.key` pair next
//! to the executable, or a freshly generated self-signed CA + leaf.
//! The client side never verifies the peer — SNI is the identity and
//! the upstream is trusted out-of-band — so its config carries a
//! verifier that accepts everything. This is deliberate and must be
//! opted into by enabling TLS on the hop.

use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, RsaKeySize, PKCS_RSA_SHA256,
};
use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
    ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme,
};
use rustls_pemfile::{certs, private_key};
use time::{Duration, OffsetDateTime};
use tracing::info;

pub fn load_certs<P: AsRef<Path>>(cert_path: P) -> Result<Vec<CertificateDer<'static>>> {
    let cert_file = File::open(cert_path.as_ref())
        .with_context(|| format!("cannot open cert file {}", cert_path.as_ref().display()))?;
    let mut reader = BufReader::new(cert_file);

    let parsed: Result<Vec<CertificateDer>, _> = certs(&mut reader).collect();
    let parsed = parsed?;
    if parsed.is_empty() {
        anyhow::bail!("no certificates found in {}", cert_path.as_ref().display());
    }
    Ok(parsed)
}

pub fn load_private_key<P: AsRef<Path>>(key_path: P) -> Result<PrivateKeyDer<'static>> {
    let key_file = File::open(key_path.as_ref())
        .with_context(|| format!("cannot open key file {}", key_path.as_ref().display()))?;
    let mut reader = BufReader::new(key_file);

    private_key(&mut reader)?
        .with_context(|| format!("no private key found in {}", key_path.as_ref().display()))
}

/// Produce the server certificate chain and key, in priority order:
/// an explicit PEM pair, `server.crt`/`server.key` adjacent to the
/// executable, or a generated self-signed chain. Load failures on
/// the first two steps are fatal rather than falling through.
pub fn obtain_server_tls(
    cert_path: &str,
    key_path: &str,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    if !cert_path.is_empty() && !key_path.is_empty() {
        return Ok((load_certs(cert_path)?, load_private_key(key_path)?));
    }

    if let Some((cert, key)) = adjacent_pem_pair() {
        info!("Using TLS material from {}", cert.display());
        return Ok((load_certs(&cert)?, load_private_key(&key)?));
    }

    info!("No TLS material supplied, generating self-signed certificates");
    generate_self_signed()
}

fn adjacent_pem_pair() -> Option<(PathBuf, PathBuf)> {
    let exe_dir = std::env::current_exe().ok()?.parent()?.to_path_buf();
    let cert = exe_dir.join("server.crt");
    let key = exe_dir.join("server.key");
    (cert.exists() && key.exists()).then_some((cert, key))
}

/// Generate a self-signed CA plus leaf chain. Keys and serials are
/// random; the structure is fixed: RSA-4096, ten-year validity, the
/// CA constrained to cert signing, the leaf bound to loopback with
/// client- and server-auth usage.
pub fn generate_self_signed() -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let not_before = OffsetDateTime::now_utc();
    let not_after = not_before.saturating_add(Duration::days(365 * 10));

    let mut ca_params = CertificateParams::default();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.distinguished_name = DistinguishedName::new();
    ca_params.distinguished_name.push(DnType::CommonName, "WS");
    ca_params.distinguished_name.push(DnType::OrganizationName, "WS");
    ca_params.key_usages.push(KeyUsagePurpose::DigitalSignature);
    ca_params.key_usages.push(KeyUsagePurpose::KeyCertSign);
    ca_params.not_before = not_before;
    ca_params.not_after = not_after;

    let ca_key = KeyPair::generate_rsa_for(&PKCS_RSA_SHA256, RsaKeySize::_4096)?;
    let ca_cert = ca_params.self_signed(&ca_key)?;
    let ca_der = ca_cert.der().to_owned();
    let issuer = Issuer::new(ca_params, ca_key);

    let mut leaf_params =
        CertificateParams::new(vec!["127.0.0.1".to_string(), "::1".to_string()])?;
    leaf_params.distinguished_name.push(DnType::CommonName, "WS");
    leaf_params.is_ca = IsCa::NoCa;
    leaf_params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ClientAuth,
        ExtendedKeyUsagePurpose::ServerAuth,
    ];
    leaf_params.not_before = not_before;
    leaf_params.not_after = not_after;

    let leaf_key = KeyPair::generate_rsa_for(&PKCS_RSA_SHA256, RsaKeySize::_4096)?;
    let leaf_cert = leaf_params.signed_by(&leaf_key, &issuer)?;

    let key = PrivateKeyDer::try_from(leaf_key.serialize_der())
        .map_err(|e| anyhow::anyhow!("cannot encode generated key: {e}"))?;

    Ok((vec![leaf_cert.der().to_owned(), ca_der], key))
}

pub fn build_server_config(
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ServerConfig> {
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)?;
    Ok(config)
}

/// Client config that sends SNI but accepts any server certificate.
pub fn build_insecure_client_config() -> ClientConfig {
    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerification))
        .with_no_client_auth()
}

#[derive(Debug)]
struct NoVerification;

impl ServerCertVerifier for NoVerification {
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
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::pki_types::ServerName;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_rustls::{TlsAcceptor, TlsConnector};

    #[test]
    fn generated_chain_has_leaf_and_ca() {
        let (chain, _key) = generate_self_signed().unwrap();
        assert_eq!(chain.len(), 2);
    }

    #[tokio::test]
    async fn generated_material_handshakes_with_insecure_client() {
        let (chain, key) = generate_self_signed().unwrap();
        let acceptor = TlsAcceptor::from(Arc::new(build_server_config(chain, key).unwrap()));
        let connector = TlsConnector::from(Arc::new(build_insecure_client_config()));

        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let server_name = ServerName::try_from("cdn.example").unwrap();

        let server = tokio::spawn(async move {
            let mut tls = acceptor.accept(server_io).await.unwrap();
            let mut buf = [0u8; 4];
            tls.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            tls.write_all(b"pong").await.unwrap();
            tls.flush().await.unwrap();
        });

        let mut tls = connector.connect(server_name, client_io).await.unwrap();
        tls.write_all(b"ping").await.unwrap();
        tls.flush().await.unwrap();
        let mut buf = [0u8; 4];
        tls.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        server.await.unwrap();
    }
}
