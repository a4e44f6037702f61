//! rustls-backed transport credentials.

use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use super::{AuthInfo, HandshakeError, TransportCredentials};

/// Resolve the name to verify: the override if given, else the endpoint host.
pub fn server_name_for(
    endpoint: &str,
    override_name: Option<&str>,
) -> Result<ServerName<'static>, HandshakeError> {
    let name = match override_name {
        Some(name) => name,
        None => endpoint
            .rsplit_once(':')
            .map_or(endpoint, |(host, _)| host)
            .trim_start_matches('[')
            .trim_end_matches(']'),
    };
    ServerName::try_from(name.to_string())
        .map_err(|_| HandshakeError::InvalidServerName(name.to_string()))
}

/// TLS client credentials.
#[derive(Clone)]
pub struct RustlsCredentials {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl RustlsCredentials {
    pub fn new(config: Arc<ClientConfig>, server_name: ServerName<'static>) -> Self {
        Self {
            connector: TlsConnector::from(config),
            server_name,
        }
    }
}

impl TransportCredentials for RustlsCredentials {
    type Stream = TlsStream<TcpStream>;

    async fn client_handshake(
        &self,
        authority: &str,
        conn: TcpStream,
    ) -> Result<(Self::Stream, AuthInfo), HandshakeError> {
        let stream = self
            .connector
            .connect(self.server_name.clone(), conn)
            .await
            .map_err(HandshakeError::Tls)?;

        let session = stream.get_ref().1;
        let auth_info = AuthInfo {
            security_protocol: "tls",
            negotiated_protocol: session.alpn_protocol().map(<[u8]>::to_vec),
            tls_version: session.protocol_version().map(|v| format!("{v:?}")),
            peer_certificates: session
                .peer_certificates()
                .map(|certs| certs.iter().map(|c| c.clone().into_owned()).collect())
                .unwrap_or_default(),
        };
        tracing::debug!(
            authority,
            tls_version = ?auth_info.tls_version,
            peer_certificates = auth_info.peer_certificates.len(),
            "TLS handshake complete"
        );
        Ok((stream, auth_info))
    }
}
