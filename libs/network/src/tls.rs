//! Stream abstraction and optional TLS upgrade
//!
//! Connections own a [`BoxedStream`], so plain TCP and TLS share one code
//! path after the upgrade. TLS support needs the `tls` cargo feature.

use crate::{Result, TransportError};
use hublink_config::TlsConfig;
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Any byte stream a connection can run over
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Server and client TLS settings built once per hub
#[derive(Clone)]
pub struct TlsContext {
    #[cfg(feature = "tls")]
    acceptor: Option<tokio_native_tls::TlsAcceptor>,
    #[cfg(feature = "tls")]
    connector: tokio_native_tls::TlsConnector,
    domain: Option<String>,
}

impl TlsContext {
    /// Build a context from configuration; `None` means TLS is not configured
    #[cfg(feature = "tls")]
    pub fn from_config(config: Option<&TlsConfig>) -> Result<Option<Self>> {
        use tokio_native_tls::native_tls;

        let Some(config) = config else {
            return Ok(None);
        };

        let acceptor = match &config.identity_path {
            Some(path) => {
                let der = std::fs::read(path).map_err(|e| {
                    TransportError::configuration(
                        format!("failed to read TLS identity {:?}: {}", path, e),
                        Some("tls.identity_path"),
                    )
                })?;
                let identity = native_tls::Identity::from_pkcs12(&der, &config.identity_password)
                    .map_err(|e| {
                        TransportError::configuration(
                            format!("invalid PKCS#12 identity: {}", e),
                            Some("tls.identity_path"),
                        )
                    })?;
                let acceptor = native_tls::TlsAcceptor::new(identity).map_err(|e| {
                    TransportError::configuration(format!("failed to build TLS acceptor: {}", e), Some("tls"))
                })?;
                Some(tokio_native_tls::TlsAcceptor::from(acceptor))
            }
            None => None,
        };

        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| {
                TransportError::configuration(format!("failed to build TLS connector: {}", e), Some("tls"))
            })?;

        Ok(Some(Self {
            acceptor,
            connector: tokio_native_tls::TlsConnector::from(connector),
            domain: config.domain.clone(),
        }))
    }

    #[cfg(not(feature = "tls"))]
    pub fn from_config(config: Option<&TlsConfig>) -> Result<Option<Self>> {
        match config {
            None => Ok(None),
            Some(_) => Err(TransportError::configuration(
                "TLS configured but hublink-network was built without the `tls` feature",
                Some("tls"),
            )),
        }
    }

    /// Server side of the upgrade
    #[cfg(feature = "tls")]
    pub async fn accept(&self, stream: TcpStream) -> Result<BoxedStream> {
        let remote = stream.peer_addr().ok();
        let acceptor = self.acceptor.as_ref().ok_or_else(|| {
            TransportError::configuration("tls listener requires tls.identity_path", Some("tls.identity_path"))
        })?;
        let stream = acceptor
            .accept(stream)
            .await
            .map_err(|e| TransportError::connection_with_source("TLS accept failed", remote, e))?;
        Ok(Box::new(stream))
    }

    #[cfg(not(feature = "tls"))]
    pub async fn accept(&self, _stream: TcpStream) -> Result<BoxedStream> {
        Err(TransportError::configuration("TLS support not compiled in", Some("tls")))
    }

    /// Client side of the upgrade; `host` is verified unless a domain is configured
    #[cfg(feature = "tls")]
    pub async fn connect(&self, host: &str, stream: TcpStream) -> Result<BoxedStream> {
        let remote = stream.peer_addr().ok();
        let domain = self.domain.as_deref().unwrap_or(host);
        let stream = self
            .connector
            .connect(domain, stream)
            .await
            .map_err(|e| TransportError::connection_with_source("TLS connect failed", remote, e))?;
        Ok(Box::new(stream))
    }

    #[cfg(not(feature = "tls"))]
    pub async fn connect(&self, _host: &str, _stream: TcpStream) -> Result<BoxedStream> {
        Err(TransportError::configuration("TLS support not compiled in", Some("tls")))
    }

    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}
