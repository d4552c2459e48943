//! Tls settings for secure channels.
//!
//! Built once at startup and shared between the listener and any outbound
//! connections. Sessions may negotiate any protocol version and cipher
//! suite the `ring` provider supports, the list is not narrowed down.

use std::convert::TryFrom;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};

use crate::{EndpointInfo, Error, Result};

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Resulting tls configuration, holding the client side, the server side,
/// or both.
#[derive(Clone)]
pub struct TlsConfig {
    client: Option<Arc<ClientConfig>>,
    server: Option<Arc<ServerConfig>>,
    server_name: Option<String>,
    handshake_timeout: Duration,
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("client", &self.client.is_some())
            .field("server", &self.server.is_some())
            .field("server_name", &self.server_name)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}

impl TlsConfig {
    pub fn builder() -> TlsConfigBuilder {
        TlsConfigBuilder::default()
    }

    pub fn client_config(&self) -> Option<Arc<ClientConfig>> {
        self.client.clone()
    }

    pub fn server_config(&self) -> Option<Arc<ServerConfig>> {
        self.server.clone()
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// Name presented and verified when connecting to the endpoint. Falls
    /// back to the endpoint's ip address unless an override is set.
    pub(crate) fn server_name_for(&self, endpoint: &EndpointInfo) -> Result<ServerName<'static>> {
        let name = self
            .server_name
            .clone()
            .unwrap_or_else(|| endpoint.address().to_string());
        ServerName::try_from(name.clone())
            .map_err(|e| Error::TlsConfig(format!("invalid server name {}: {}", name, e)))
    }
}

/// Builder for [`TlsConfig`].
pub struct TlsConfigBuilder {
    cert_chain: Vec<CertificateDer<'static>>,
    private_key: Option<PrivateKeyDer<'static>>,
    roots: Vec<CertificateDer<'static>>,
    verify_peer: bool,
    server_name: Option<String>,
    handshake_timeout: Duration,
}

impl Default for TlsConfigBuilder {
    fn default() -> Self {
        Self {
            cert_chain: Vec::new(),
            private_key: None,
            roots: Vec::new(),
            verify_peer: true,
            server_name: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl TlsConfigBuilder {
    /// Sets the certificate chain and key presented when accepting
    /// connections.
    pub fn with_identity(
        mut self,
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Self {
        self.cert_chain = cert_chain;
        self.private_key = Some(private_key);
        self
    }

    /// Loads the identity from PEM files.
    pub fn with_identity_files(
        self,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let certs = read_certs(cert_path.as_ref())?;
        let mut reader = BufReader::new(File::open(key_path.as_ref())?);
        let key = rustls_pemfile::private_key(&mut reader)?.ok_or_else(|| {
            Error::TlsConfig(format!(
                "no private key found in {}",
                key_path.as_ref().display()
            ))
        })?;
        Ok(self.with_identity(certs, key))
    }

    /// Trusts the given certificate when verifying servers.
    pub fn with_root(mut self, cert: CertificateDer<'static>) -> Self {
        self.roots.push(cert);
        self
    }

    /// Trusts all certificates found in a PEM file.
    pub fn with_roots_file(mut self, path: impl AsRef<Path>) -> Result<Self> {
        self.roots.extend(read_certs(path.as_ref())?);
        Ok(self)
    }

    /// Overrides the name used for SNI and certificate verification.
    pub fn with_server_name(mut self, name: &str) -> Self {
        self.server_name = Some(name.to_string());
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Accepts any server certificate.
    ///
    /// Only use this in test or lab setups, the connection is encrypted but
    /// the server is not authenticated.
    pub fn dangerous_disable_verification(mut self) -> Self {
        self.verify_peer = false;
        self
    }

    pub fn build(self) -> Result<TlsConfig> {
        let provider = Arc::new(provider());

        let server = match self.private_key {
            Some(key) => {
                if self.cert_chain.is_empty() {
                    return Err(Error::TlsConfig(
                        "identity requires at least one certificate".to_string(),
                    ));
                }
                let config = ServerConfig::builder_with_provider(provider.clone())
                    .with_protocol_versions(rustls::ALL_VERSIONS)
                    .map_err(tls_config_error)?
                    .with_no_client_auth()
                    .with_single_cert(self.cert_chain, key)
                    .map_err(tls_config_error)?;
                Some(Arc::new(config))
            }
            None => None,
        };

        let client = if !self.verify_peer {
            let config = ClientConfig::builder_with_provider(provider.clone())
                .with_protocol_versions(rustls::ALL_VERSIONS)
                .map_err(tls_config_error)?
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier(provider)))
                .with_no_client_auth();
            Some(Arc::new(config))
        } else if !self.roots.is_empty() {
            let mut root_store = RootCertStore::empty();
            for root in self.roots {
                root_store.add(root).map_err(tls_config_error)?;
            }
            let config = ClientConfig::builder_with_provider(provider)
                .with_protocol_versions(rustls::ALL_VERSIONS)
                .map_err(tls_config_error)?
                .with_root_certificates(root_store)
                .with_no_client_auth();
            Some(Arc::new(config))
        } else {
            None
        };

        if client.is_none() && server.is_none() {
            return Err(Error::TlsConfig(
                "neither an identity nor trusted roots were provided".to_string(),
            ));
        }

        Ok(TlsConfig {
            client,
            server,
            server_name: self.server_name,
            handshake_timeout: self.handshake_timeout,
        })
    }
}

/// `ring` provider with every cipher suite it implements enabled.
fn provider() -> CryptoProvider {
    let mut provider = rustls::crypto::ring::default_provider();
    provider.cipher_suites = rustls::crypto::ring::ALL_CIPHER_SUITES.to_vec();
    provider
}

fn tls_config_error(e: rustls::Error) -> Error {
    Error::TlsConfig(e.to_string())
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<std::io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(Error::TlsConfig(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Verifier skipping certificate chain validation. Handshake signatures
/// are still checked.
#[derive(Debug)]
struct NoVerifier(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> core::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> core::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> core::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[test]
fn empty_builder_is_rejected() {
    assert!(TlsConfig::builder().build().is_err());
}

#[test]
fn unverified_client_only_config() {
    let config = TlsConfig::builder()
        .dangerous_disable_verification()
        .with_server_name("localhost")
        .build()
        .unwrap();
    assert!(config.client_config().is_some());
    assert!(config.server_config().is_none());
    let info: EndpointInfo = "secure://127.0.0.1:9000".parse().unwrap();
    assert!(config.server_name_for(&info).is_ok());
}
