//! Byte stream to a server, plain TCP or TLS.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::config::{ServerAddress, TlsOptions};
use crate::error::{Error, Result};

/// Any duplex stream the socket can drive.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

pub type BoxedTransport = Box<dyn Transport>;

/// Open a stream to `server`, wrapping it in TLS when configured.
pub async fn open(server: &ServerAddress, tls: Option<&TlsOptions>) -> Result<BoxedTransport> {
    let tcp = TcpStream::connect((server.host.as_str(), server.port))
        .await
        .map_err(|e| Error::connection(format!("Failed to connect to {}: {}", server, e)).with_cause(e))?;
    tcp.set_nodelay(true)?;

    let Some(tls) = tls else {
        return Ok(Box::new(tcp));
    };

    let connector = build_connector(tls)?;
    let name = tls.server_name.clone().unwrap_or_else(|| server.host.clone());
    let server_name = ServerName::try_from(name)
        .map_err(|e| Error::connection(format!("Invalid TLS server name for {}", server)).with_cause(e))?;
    let stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| Error::connection(format!("TLS handshake with {} failed: {}", server, e)).with_cause(e))?;
    tracing::debug!(server = %server, "TLS session established");
    Ok(Box::new(stream))
}

fn build_connector(tls: &TlsOptions) -> Result<TlsConnector> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(path) = &tls.ca_file {
        let file = File::open(path).map_err(|e| {
            Error::config(format!("Cannot open CA file {}: {}", path.display(), e)).with_cause(e)
        })?;
        for cert in rustls_pemfile::certs(&mut BufReader::new(file)) {
            let cert = cert.map_err(|e| Error::config(format!("Invalid CA file {}", path.display())).with_cause(e))?;
            roots
                .add(cert)
                .map_err(|e| Error::config(format!("Rejected CA certificate: {}", e)).with_cause(e))?;
        }
    }

    let config = rustls::ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::config(format!("TLS setup failed: {}", e)).with_cause(e))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}
