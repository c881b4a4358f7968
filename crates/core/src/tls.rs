//! Compile-time TLS policy selection.
//!
//! Clients and servers are generic over a [`TlsPolicy`]; [`NoTls`] is the
//! plain-socket policy and [`Tls`] wraps a rustls context built from a
//! [`TlsConfig`] at construction time. Monomorphisation keeps the plain and
//! secure code paths free of per-call dispatch.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};

use crate::error::{ErrorCode, NetError, NetResult};

/// Certificate material and verification settings for the secure variants.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
    pub ca_path: String,
    pub verify_peer: bool,
}

/// Policy deciding whether a component speaks plain TCP or TLS.
#[async_trait]
pub trait TlsPolicy: Send + Sync + 'static {
    const ENABLED: bool;

    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Server side: wrap an accepted socket (TLS handshake when enabled).
    async fn accept(&self, stream: TcpStream) -> NetResult<Self::Stream>;

    /// Client side: wrap a connected socket (TLS handshake when enabled).
    async fn connect(&self, host: &str, stream: TcpStream) -> NetResult<Self::Stream>;
}

/// Plain-text policy; sockets pass through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTls;

#[async_trait]
impl TlsPolicy for NoTls {
    const ENABLED: bool = false;

    type Stream = TcpStream;

    async fn accept(&self, stream: TcpStream) -> NetResult<TcpStream> {
        Ok(stream)
    }

    async fn connect(&self, _host: &str, stream: TcpStream) -> NetResult<TcpStream> {
        Ok(stream)
    }
}

/// TLS policy holding the rustls contexts.
///
/// Servers need [`Tls::server`] (cert + key), clients [`Tls::client`]
/// (CA bundle, or `verify_peer = false` to accept any certificate).
#[derive(Debug)]
pub struct Tls {
    acceptor: Option<TlsAcceptor>,
    connector: Option<TlsConnector>,
}

impl Tls {
    /// Builds the server-side context from `cert_path`/`key_path`.
    pub fn server(config: &TlsConfig) -> NetResult<Self> {
        let server_config = server_rustls_config(config)?;
        Ok(Self {
            acceptor: Some(TlsAcceptor::from(Arc::new(server_config))),
            connector: None,
        })
    }

    /// Builds the client-side context from `ca_path`/`verify_peer`.
    pub fn client(config: &TlsConfig) -> NetResult<Self> {
        let client_config = client_rustls_config(config)?;
        Ok(Self {
            acceptor: None,
            connector: Some(TlsConnector::from(Arc::new(client_config))),
        })
    }
}

pub(crate) fn server_rustls_config(config: &TlsConfig) -> NetResult<rustls::ServerConfig> {
    let certs = load_certs(&config.cert_path)?;
    let key = load_private_key(&config.key_path)?;

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| {
            NetError::new(
                ErrorCode::InvalidArgument,
                format!("invalid certificate/key pair: {e}"),
                "tls::server",
            )
        })
}

pub(crate) fn client_rustls_config(config: &TlsConfig) -> NetResult<rustls::ClientConfig> {
    if config.verify_peer {
        let mut roots = rustls::RootCertStore::empty();
        if !config.ca_path.is_empty() {
            for cert in load_certs(&config.ca_path)? {
                roots.add(cert).map_err(|e| {
                    NetError::new(
                        ErrorCode::InvalidArgument,
                        format!("invalid CA certificate: {e}"),
                        "tls::client",
                    )
                })?;
            }
        }
        Ok(rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth())
    } else {
        Ok(rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification::new()))
            .with_no_client_auth())
    }
}

#[async_trait]
impl TlsPolicy for Tls {
    const ENABLED: bool = true;

    type Stream = TlsStream<TcpStream>;

    async fn accept(&self, stream: TcpStream) -> NetResult<Self::Stream> {
        let acceptor = self.acceptor.as_ref().ok_or_else(|| {
            NetError::new(
                ErrorCode::NotInitialized,
                "TLS policy has no server context",
                "tls::accept",
            )
        })?;

        let stream = acceptor.accept(stream).await.map_err(|e| {
            NetError::new(
                ErrorCode::ConnectionFailed,
                format!("TLS handshake failed: {e}"),
                "tls::accept",
            )
        })?;
        Ok(TlsStream::Server(stream))
    }

    async fn connect(&self, host: &str, stream: TcpStream) -> NetResult<Self::Stream> {
        let connector = self.connector.as_ref().ok_or_else(|| {
            NetError::new(
                ErrorCode::NotInitialized,
                "TLS policy has no client context",
                "tls::connect",
            )
        })?;

        let server_name = ServerName::try_from(host.to_owned()).map_err(|_| {
            NetError::new(
                ErrorCode::InvalidArgument,
                format!("invalid TLS server name: {host}"),
                "tls::connect",
            )
        })?;

        let stream = connector.connect(server_name, stream).await.map_err(|e| {
            NetError::new(
                ErrorCode::ConnectionFailed,
                format!("TLS handshake failed: {e}"),
                "tls::connect",
            )
        })?;
        Ok(TlsStream::Client(stream))
    }
}

pub(crate) fn load_certs(path: &str) -> NetResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        NetError::new(
            ErrorCode::InvalidArgument,
            format!("cannot open certificate file {path}: {e}"),
            "tls::load_certs",
        )
    })?;
    let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut BufReader::new(file)).collect();
    let certs = certs.map_err(|e| {
        NetError::new(
            ErrorCode::InvalidArgument,
            format!("cannot parse certificate file {path}: {e}"),
            "tls::load_certs",
        )
    })?;
    if certs.is_empty() {
        return Err(NetError::new(
            ErrorCode::InvalidArgument,
            format!("no certificates found in {path}"),
            "tls::load_certs",
        ));
    }
    Ok(certs)
}

pub(crate) fn load_private_key(path: &str) -> NetResult<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| {
        NetError::new(
            ErrorCode::InvalidArgument,
            format!("cannot open key file {path}: {e}"),
            "tls::load_private_key",
        )
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| {
            NetError::new(
                ErrorCode::InvalidArgument,
                format!("cannot parse key file {path}: {e}"),
                "tls::load_private_key",
            )
        })?
        .ok_or_else(|| {
            NetError::new(
                ErrorCode::InvalidArgument,
                format!("no private key found in {path}"),
                "tls::load_private_key",
            )
        })
}

/// Certificate verifier used when `verify_peer` is disabled.
#[derive(Debug)]
struct NoVerification {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl NoVerification {
    fn new() -> Self {
        Self {
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }
}

impl rustls::client::danger::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
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
            &self.provider.signature_verification_algorithms,
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
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_cert_file_is_invalid_argument() {
        let config = TlsConfig {
            cert_path: "/nonexistent/server.pem".into(),
            key_path: "/nonexistent/server.key".into(),
            ..Default::default()
        };
        let err = Tls::server(&config).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidArgument);
    }

    #[test]
    fn client_context_without_ca_builds_when_verification_disabled() {
        let config = TlsConfig {
            verify_peer: false,
            ..Default::default()
        };
        assert!(Tls::client(&config).is_ok());
    }

    #[tokio::test]
    async fn accept_without_server_context_reports_not_initialized() {
        let config = TlsConfig {
            verify_peer: false,
            ..Default::default()
        };
        let tls = Tls::client(&config).unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).await.unwrap();

        let err = tls.accept(stream).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NotInitialized);
    }
}
