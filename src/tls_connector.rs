//! A real TCP(+TLS) [`Connector`](crate::half_open::Connector), built on
//! `tokio::net::TcpStream` and, when `tls` is enabled, `rustls`/`tokio-rustls`
//! (grounded on the mongodb driver's `runtime::tls_rustls` module — same
//! `ClientConfig` → `TlsConnector` → `connect` shape, ported to rustls 0.23's
//! API). Gated behind the `tls` feature since most callers either don't need
//! TLS or bring their own stack via a custom [`Connector`].

use std::sync::Arc;

use tokio::net::TcpStream;

use crate::connection::Transport;
use crate::error::TransportError;
use crate::half_open::Connector;
use crate::info::ConnectionInfo;

/// Builds a `rustls::ClientConfig` trusting the Mozilla root program via
/// `webpki-roots`, the same default the mongodb driver falls back to when no
/// CA file is configured.
fn default_tls_config() -> Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

/// Plain TCP connect, with an optional TLS handshake layered on top
/// (spec §6, Non-goals: "socket I/O primitives are an external
/// collaborator's job" — this is that collaborator's default implementation).
pub struct TcpConnector {
    tls_config: Arc<rustls::ClientConfig>,
}

impl TcpConnector {
    pub fn new() -> Self {
        TcpConnector {
            tls_config: default_tls_config(),
        }
    }

    pub fn with_tls_config(tls_config: Arc<rustls::ClientConfig>) -> Self {
        TcpConnector { tls_config }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, info: &ConnectionInfo) -> Result<Box<dyn Transport>, TransportError> {
        let tcp = TcpStream::connect((&*info.host, info.port))
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        tcp.set_nodelay(true)
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        if !info.tls {
            return Ok(Box::new(tcp));
        }

        let server_name = rustls::pki_types::ServerName::try_from(info.host.to_string())
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        let connector = tokio_rustls::TlsConnector::from(self.tls_config.clone());
        let tls_stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        Ok(Box::new(tls_stream))
    }
}
