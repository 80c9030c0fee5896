// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Mutual TLS between the two nodes.
//!
//! Both sides present a certificate and verify the peer against the
//! configured CA bundle. The tunnel may traverse intermediaries whose DNS
//! names do not match the certificate, so the dialing side validates the
//! chain but not the server name; the accepting side requires and verifies
//! a client certificate.

use crate::config::{LocalConfig, RemoteConfig};
use crate::error::Error;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{CertificateError, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Build the local node's acceptor: client certificate required and
/// chain-verified against the CA pool.
pub fn acceptor(config: &LocalConfig) -> Result<TlsAcceptor, Error> {
    ensure_crypto_provider();

    let roots = ca_pool(&config.cas)?;
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| Error::ConfigInvalid(format!("CA bundle rejected: {e}")))?;

    let certs = parse_certs(&config.cert)?;
    let key = parse_key(&config.key)?;

    let tls_config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| Error::ConfigInvalid(format!("invalid Cert/Key pair: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

/// Build the remote node's connector: chain validation against the CA pool
/// with server-name checking disabled, client certificate attached.
pub fn connector(config: &RemoteConfig) -> Result<TlsConnector, Error> {
    ensure_crypto_provider();

    let roots = ca_pool(&config.cas)?;
    let verifier = CaPoolVerifier::new(roots)?;

    let certs = parse_certs(&config.cert)?;
    let key = parse_key(&config.key)?;

    let tls_config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(certs, key)
        .map_err(|e| Error::ConfigInvalid(format!("invalid Cert/Key pair: {e}")))?;

    Ok(TlsConnector::from(Arc::new(tls_config)))
}

/// TLS server name for the dial target. The name is not checked against the
/// peer certificate, but rustls requires one for SNI.
pub fn server_name(host: &str) -> Result<ServerName<'static>, Error> {
    ServerName::try_from(host.to_string())
        .map_err(|e| Error::ConfigInvalid(format!("invalid Importer host '{host}': {e}")))
}

fn ca_pool(cas: &[String]) -> Result<RootCertStore, Error> {
    let mut roots = RootCertStore::empty();
    for ca in cas {
        for cert in parse_certs(ca)? {
            roots
                .add(cert)
                .map_err(|e| Error::ConfigInvalid(format!("invalid CA certificate: {e}")))?;
        }
    }
    if roots.is_empty() {
        return Err(Error::ConfigInvalid(
            "CA bundle contains no certificates".to_string(),
        ));
    }
    Ok(roots)
}

fn parse_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>, Error> {
    let mut reader = pem.as_bytes();
    let certs: Vec<_> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(|e| Error::ConfigInvalid(format!("invalid PEM certificate: {e}")))?;
    if certs.is_empty() {
        return Err(Error::ConfigInvalid(
            "no certificate found in PEM block".to_string(),
        ));
    }
    Ok(certs)
}

fn parse_key(pem: &str) -> Result<PrivateKeyDer<'static>, Error> {
    let mut reader = pem.as_bytes();
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::ConfigInvalid(format!("invalid PEM private key: {e}")))?
        .ok_or_else(|| Error::ConfigInvalid("no private key found in PEM block".to_string()))
}

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

/// Verifies the peer's chain against the configured CA pool only.
///
/// Delegates to the webpki verifier and accepts its one name-mismatch
/// outcome; every other verification failure (expiry, unknown issuer, bad
/// signature) still fails the handshake.
#[derive(Debug)]
struct CaPoolVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl CaPoolVerifier {
    fn new(roots: RootCertStore) -> Result<Self, Error> {
        let inner = WebPkiServerVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| Error::ConfigInvalid(format!("CA bundle rejected: {e}")))?;
        Ok(Self { inner })
    }
}

impl ServerCertVerifier for CaPoolVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Ok(verified) => Ok(verified),
            Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForName
                | CertificateError::NotValidForNameContext { .. },
            )) => Ok(ServerCertVerified::assertion()),
            Err(e) => Err(e),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
